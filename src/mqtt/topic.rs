// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! MQTT topic filters.

use std::collections::HashMap;

const SHARE_PREFIX: &str = "$share/";

/// Filter sent to the broker: a shared subscription `$share/<group>/<filter>`
/// when a group is given, the plain filter otherwise.
pub fn broker_filter(filter: &str, group: &str) -> String {
    if group.is_empty() {
        filter.to_owned()
    } else {
        format!("{}{}/{}", SHARE_PREFIX, group, filter)
    }
}

/// Strips a `$share/<group>/` prefix.
pub fn strip_share(filter: &str) -> &str {
    filter
        .strip_prefix(SHARE_PREFIX)
        .and_then(|rest| rest.split_once('/'))
        .map(|(_, filter)| filter)
        .unwrap_or(filter)
}

/// Whether `topic` matches `filter`, with `+` matching one level and a trailing
/// `#` matching any number of levels including none. Wildcards never match
/// topics starting with `$`.
pub fn matches(filter: &str, topic: &str) -> bool {
    let filter = strip_share(filter);

    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }

    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return filter_levels.next().is_none(),
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Assigns every incoming copy of a publish to one broker filter.
///
/// A broker sends a client one copy per subscription matching the topic, so a
/// topic matched by `n` filters arrives `n` times. The copies are handed to the
/// matching filters in turn, in filter order.
#[derive(Debug, Default)]
pub(crate) struct FilterRouter {
    turns: HashMap<String, usize>,
}

impl FilterRouter {
    /// The filter owning the next copy of `topic`, among the sorted `filters`.
    pub fn route<'a, I>(&mut self, topic: &str, filters: I) -> Option<String>
    where
        I: IntoIterator<Item = &'a String>,
    {
        let owners: Vec<&String> = filters.into_iter().filter(|f| matches(f, topic)).collect();
        let turn = self.turns.remove(topic).unwrap_or(0);
        if owners.is_empty() {
            return None;
        }

        let turn = turn % owners.len();
        if turn + 1 < owners.len() {
            self.turns.insert(topic.to_owned(), turn + 1);
        }
        Some(owners[turn].clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    #[test]
    fn test_exact_and_single_level() {
        assert!(matches("sensors/kitchen/temp", "sensors/kitchen/temp"));
        assert!(matches("sensors/+/temp", "sensors/kitchen/temp"));
        assert!(!matches("sensors/+/temp", "sensors/kitchen/humidity"));
        assert!(!matches("sensors/+", "sensors/kitchen/temp"));
        assert!(!matches("sensors/kitchen", "sensors/kitchen/temp"));
    }

    #[test]
    fn test_multi_level() {
        assert!(matches("sensors/#", "sensors/kitchen/temp"));
        assert!(matches("sensors/#", "sensors"));
        assert!(matches("#", "anything/at/all"));
        assert!(!matches("sensors/#/temp", "sensors/kitchen/temp"));
    }

    #[test]
    fn test_system_topics_skip_wildcards() {
        assert!(!matches("#", "$SYS/uptime"));
        assert!(!matches("+/uptime", "$SYS/uptime"));
        assert!(matches("$SYS/#", "$SYS/uptime"));
    }

    #[test]
    fn test_shared_filters() {
        assert_eq!(broker_filter("orders/+", "workers"), "$share/workers/orders/+");
        assert_eq!(broker_filter("orders/+", ""), "orders/+");
        assert_eq!(strip_share("$share/workers/orders/+"), "orders/+");
        assert!(matches("$share/workers/orders/+", "orders/42"));
    }

    #[test]
    fn test_router_hands_copies_to_each_filter() {
        let filters: BTreeSet<String> = [
            broker_filter("orders", "a"),
            broker_filter("orders", "b"),
            broker_filter("orders", ""),
            broker_filter("invoices", ""),
        ]
        .into_iter()
        .collect();
        let mut router = FilterRouter::default();

        let routes: Vec<_> = (0..3)
            .filter_map(|_| router.route("orders", &filters))
            .collect();
        assert_eq!(routes, vec!["$share/a/orders", "$share/b/orders", "orders"]);
        assert!(router.turns.is_empty());

        assert_eq!(router.route("invoices", &filters).as_deref(), Some("invoices"));
        assert_eq!(router.route("payments", &filters), None);
    }

    #[test]
    fn test_router_wildcard_and_exact_overlap() {
        let filters: BTreeSet<String> = ["orders/+".to_owned(), "orders/1".to_owned()]
            .into_iter()
            .collect();
        let mut router = FilterRouter::default();

        assert_eq!(router.route("orders/1", &filters).as_deref(), Some("orders/+"));
        assert_eq!(router.route("orders/2", &filters).as_deref(), Some("orders/+"));
        assert_eq!(router.route("orders/1", &filters).as_deref(), Some("orders/1"));
        assert_eq!(router.route("orders/1", &filters).as_deref(), Some("orders/+"));
    }
}
