//! Disconnect grace timers
//!
//! When a peer's transport drops, it gets a grace period to come back
//! before it is declared departed. Each peer has at most one timer. A timer
//! never touches session state itself: on expiry it hands its token to a
//! callback that posts into the session loop, and the loop checks the
//! token with [`DisconnectTimers::fire`] so a timer cancelled after it already
//! fired is ignored.

use crate::model::PeerId;
use crate::{Error, Result};
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;
use tokio::task::AbortHandle;
use tracing::{debug, info};

/// Observable state of one peer's grace timer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TimerState {
    NotStarted,
    Active,
    Ended,
}

#[derive(Debug)]
enum TimerSlot {
    Active {
        token: u64,
        is_self: bool,
        abort: AbortHandle,
    },
    Ended,
}

/// Grace timers of a session, keyed by peer
#[derive(Debug, Default)]
pub struct DisconnectTimers {
    slots: HashMap<PeerId, TimerSlot>,
    next_token: u64,
}

impl DisconnectTimers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self, peer_id: &PeerId) -> TimerState {
        match self.slots.get(peer_id) {
            None => TimerState::NotStarted,
            Some(TimerSlot::Active { .. }) => TimerState::Active,
            Some(TimerSlot::Ended) => TimerState::Ended,
        }
    }

    pub fn is_active(&self, peer_id: &PeerId) -> bool {
        self.state(peer_id) == TimerState::Active
    }

    /// Start the grace timer for `peer_id`
    ///
    /// After `grace`, `on_expiry` is called with the timer's token.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DuplicateDisconnectTimer`] when a timer is already
    /// running for the peer.
    pub fn arm<F>(
        &mut self,
        peer_id: &PeerId,
        is_self: bool,
        grace: Duration,
        on_expiry: F,
    ) -> Result<u64>
    where
        F: FnOnce(u64) + Send + 'static,
    {
        if self.is_active(peer_id) {
            return Err(Error::DuplicateDisconnectTimer(peer_id.to_string()));
        }

        self.next_token += 1;
        let token = self.next_token;

        info!(
            "Starting disconnect grace timer for peer {} ({}s)",
            peer_id,
            grace.as_secs()
        );

        let task = tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            on_expiry(token);
        });

        self.slots.insert(
            peer_id.clone(),
            TimerSlot::Active {
                token,
                is_self,
                abort: task.abort_handle(),
            },
        );
        Ok(token)
    }

    /// Accept an expiry reported by the timer task
    ///
    /// Returns whether the timer was armed for the local user, or `None` if
    /// the token is stale (cancelled or superseded).
    pub fn fire(&mut self, peer_id: &PeerId, token: u64) -> Option<bool> {
        match self.slots.get(peer_id) {
            Some(TimerSlot::Active {
                token: active,
                is_self,
                ..
            }) if *active == token => {
                let is_self = *is_self;
                self.slots.insert(peer_id.clone(), TimerSlot::Ended);
                debug!("Disconnect grace timer expired for peer {}", peer_id);
                Some(is_self)
            }
            _ => None,
        }
    }

    /// Cancel the peer's timer if one is running
    ///
    /// Cancelling a timer that never started or already ended is a no-op.
    pub fn cancel(&mut self, peer_id: &PeerId) -> bool {
        match self.slots.get(peer_id) {
            Some(TimerSlot::Active { abort, .. }) => {
                abort.abort();
                self.slots.insert(peer_id.clone(), TimerSlot::Ended);
                info!("Cancelled disconnect grace timer for peer {}", peer_id);
                true
            }
            _ => false,
        }
    }

    /// Cancel every running timer
    pub fn cancel_all(&mut self) -> usize {
        let mut cancelled = 0;
        for slot in self.slots.values_mut() {
            if let TimerSlot::Active { abort, .. } = slot {
                abort.abort();
                *slot = TimerSlot::Ended;
                cancelled += 1;
            }
        }
        cancelled
    }

    /// Drop the peer's slot entirely (cancelling a running timer)
    pub fn forget(&mut self, peer_id: &PeerId) {
        if let Some(TimerSlot::Active { abort, .. }) = self.slots.remove(peer_id) {
            abort.abort();
        }
    }

    pub fn active_count(&self) -> usize {
        self.slots
            .values()
            .filter(|slot| matches!(slot, TimerSlot::Active { .. }))
            .count()
    }
}
