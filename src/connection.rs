// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Connection Lifecycle
//!
//! Every broker connection manager keeps its native client in a
//! [`ConnectionSlot`]. The slot owns the `Closed -> Opening -> Open -> Closing`
//! state machine, the root cancellation token of the open connection, and a
//! generation counter that lets an `open` or `subscribe` racing with `close`
//! notice that the connection it started on is gone.

use crate::{
    errors::MessagingError,
    registry::{Subscription, SubscriptionRegistry},
};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Closed,
    Opening,
    Open,
    Closing,
}

/// Outcome of asking the slot to start opening.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum OpenTicket {
    AlreadyOpen,
    Proceed(u64),
}

/// Handle to the open client plus what a caller needs to start work on it.
pub(crate) struct Lease<C> {
    pub client: Arc<C>,
    pub generation: u64,
    pub cancel: CancellationToken,
}

/// What `close` takes over from the slot.
pub(crate) struct Teardown<C> {
    pub client: Option<Arc<C>>,
    pub cancel: Option<CancellationToken>,
}

struct SlotInner<C> {
    state: ConnectionState,
    generation: u64,
    client: Option<Arc<C>>,
    cancel: Option<CancellationToken>,
}

pub(crate) struct ConnectionSlot<C> {
    inner: Mutex<SlotInner<C>>,
}

impl<C> Default for ConnectionSlot<C> {
    fn default() -> Self {
        ConnectionSlot {
            inner: Mutex::new(SlotInner {
                state: ConnectionState::Closed,
                generation: 0,
                client: None,
                cancel: None,
            }),
        }
    }
}

impl<C> ConnectionSlot<C> {
    fn lock(&self) -> MutexGuard<'_, SlotInner<C>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> ConnectionState {
        self.lock().state
    }

    pub fn is_open(&self) -> bool {
        self.lock().client.is_some()
    }

    pub fn begin_open(&self) -> Result<OpenTicket, MessagingError> {
        let mut inner = self.lock();
        match inner.state {
            ConnectionState::Open => Ok(OpenTicket::AlreadyOpen),
            ConnectionState::Closed => {
                inner.state = ConnectionState::Opening;
                Ok(OpenTicket::Proceed(inner.generation))
            }
            ConnectionState::Opening => Err(MessagingError::InvalidState(
                "connection is already being opened".to_owned(),
            )),
            ConnectionState::Closing => Err(MessagingError::InvalidState(
                "connection is being closed".to_owned(),
            )),
        }
    }

    /// Installs the client built for `generation`. If `close` ran in the meantime
    /// the client is handed back so the caller can shut it down.
    pub fn complete_open(&self, generation: u64, client: C) -> Result<Lease<C>, C> {
        let mut inner = self.lock();
        if inner.generation != generation || inner.state != ConnectionState::Opening {
            return Err(client);
        }

        let client = Arc::new(client);
        let cancel = CancellationToken::new();
        inner.client = Some(client.clone());
        inner.cancel = Some(cancel.clone());
        inner.state = ConnectionState::Open;

        Ok(Lease {
            client,
            generation,
            cancel,
        })
    }

    pub fn fail_open(&self, generation: u64) {
        let mut inner = self.lock();
        if inner.generation == generation && inner.state == ConnectionState::Opening {
            inner.state = ConnectionState::Closed;
        }
    }

    /// Returns the open client or `InvalidState`.
    pub fn lease(&self) -> Result<Lease<C>, MessagingError> {
        let inner = self.lock();
        match (&inner.client, &inner.cancel) {
            (Some(client), Some(cancel)) if inner.state == ConnectionState::Open => Ok(Lease {
                client: client.clone(),
                generation: inner.generation,
                cancel: cancel.clone(),
            }),
            _ => Err(MessagingError::not_opened("connection")),
        }
    }

    pub fn is_current(&self, generation: u64) -> bool {
        let inner = self.lock();
        inner.generation == generation && inner.state == ConnectionState::Open
    }

    /// Moves to `Closing`, invalidates every outstanding lease and takes over the
    /// client. Returns `None` when there is nothing to close.
    pub fn begin_close(&self) -> Option<Teardown<C>> {
        let mut inner = self.lock();
        match inner.state {
            ConnectionState::Closed | ConnectionState::Closing => None,
            ConnectionState::Opening | ConnectionState::Open => {
                inner.generation += 1;
                inner.state = ConnectionState::Closing;
                Some(Teardown {
                    client: inner.client.take(),
                    cancel: inner.cancel.take(),
                })
            }
        }
    }

    pub fn finish_close(&self) {
        let mut inner = self.lock();
        if inner.state == ConnectionState::Closing {
            inner.state = ConnectionState::Closed;
        }
    }

    /// Starts opening. `None` means the connection is already open.
    ///
    /// Dropping the returned attempt without completing it, because connecting
    /// failed or the caller gave up, puts the slot back to `Closed`.
    pub fn attempt(&self) -> Result<Option<OpenAttempt<'_, C>>, MessagingError> {
        match self.begin_open()? {
            OpenTicket::AlreadyOpen => Ok(None),
            OpenTicket::Proceed(generation) => Ok(Some(OpenAttempt {
                slot: self,
                generation,
                done: false,
            })),
        }
    }
}

pub(crate) struct OpenAttempt<'a, C> {
    slot: &'a ConnectionSlot<C>,
    generation: u64,
    done: bool,
}

impl<C> OpenAttempt<'_, C> {
    /// Installs the client. If `close` ran while connecting it is handed back.
    pub fn complete(mut self, client: C) -> Result<Lease<C>, C> {
        self.done = true;
        self.slot.complete_open(self.generation, client)
    }
}

impl<C> Drop for OpenAttempt<'_, C> {
    fn drop(&mut self) {
        if !self.done {
            self.slot.fail_open(self.generation);
        }
    }
}

pub(crate) fn closed_while(what: &str) -> MessagingError {
    MessagingError::InvalidState(format!("connection was closed while {}", what))
}

/// Registers a subscription built on the lease of `generation`.
///
/// If `close` ran while the subscription was being set up, the entry is taken
/// back out and returned with the error so the caller tears it down. When `close`
/// already drained it, `None` is returned and there is nothing left to tear down.
pub(crate) fn admit<C, H>(
    slot: &ConnectionSlot<C>,
    registry: &SubscriptionRegistry<H>,
    generation: u64,
    subscription: Subscription<H>,
) -> Result<(), (MessagingError, Option<Subscription<H>>)> {
    let key = subscription.key.clone();
    registry
        .add(subscription)
        .map_err(|(err, rejected)| (err, Some(rejected)))?;

    if slot.is_current(generation) {
        return Ok(());
    }

    let stale = registry.remove(&key);
    Err((closed_while("subscribing"), stale))
}
