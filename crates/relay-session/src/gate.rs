//! Per-user dispatch serialization.
//!
//! A second message from the same user waits until the previous one has
//! finished being dispatched, independent of whether a transfer is running
//! (the transfer-in-progress check is a separate, non-blocking state test
//! against the registry). Unlike a plain grow-only lock map, idle entries
//! are evicted when the last holder releases them, so a long-lived process
//! does not accumulate one mutex per user ever seen.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::chat::UserId;

type Slot = Arc<AsyncMutex<()>>;

#[derive(Default)]
pub struct UserGate {
    inner: Mutex<HashMap<UserId, Slot>>,
}

impl UserGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for this user's previous message to finish dispatching.
    pub async fn acquire(self: &Arc<Self>, user_id: UserId) -> GateGuard {
        let slot = self
            .inner
            .lock()
            .entry(user_id)
            .or_default()
            .clone();
        let permit = slot.clone().lock_owned().await;
        GateGuard {
            gate: Arc::clone(self),
            user_id,
            slot,
            _permit: permit,
        }
    }

    #[cfg(test)]
    fn tracked_users(&self) -> usize {
        self.inner.lock().len()
    }
}

pub struct GateGuard {
    gate: Arc<UserGate>,
    user_id: UserId,
    slot: Slot,
    _permit: OwnedMutexGuard<()>,
}

impl Drop for GateGuard {
    fn drop(&mut self) {
        let mut map = self.gate.inner.lock();
        // Three known holders of the slot while this guard is alive: the map
        // entry, `self.slot`, and the Arc inside the owned permit. Anything
        // above that means another task has cloned the slot and is waiting,
        // so the entry must stay. Waiters clone under the map lock, which we
        // hold here, so the count cannot change under us.
        if Arc::strong_count(&self.slot) == 3 {
            map.remove(&self.user_id);
        }
    }
}
