//! User → active-session mapping.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::chat::UserId;
use crate::error::TransferError;
use crate::session::TransferSession;

/// Maps each user to at most one active [`TransferSession`].
///
/// The one-concurrent-transfer-per-user invariant is enforced here:
/// [`SessionRegistry::begin`] is the only compare-and-set style operation
/// and is atomic with respect to concurrent requests from the same user.
/// Entries are removed unconditionally on transfer termination, whether or
/// not secondary cleanup succeeded.
#[derive(Default)]
pub struct SessionRegistry {
    inner: Mutex<HashMap<UserId, Arc<TransferSession>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically claim the user's transfer slot. Fails with
    /// [`TransferError::AlreadyActive`] when a session already holds it.
    pub fn begin(
        &self,
        user_id: UserId,
        session: Arc<TransferSession>,
    ) -> Result<(), TransferError> {
        match self.inner.lock().entry(user_id) {
            Entry::Occupied(_) => Err(TransferError::AlreadyActive),
            Entry::Vacant(slot) => {
                slot.insert(session);
                Ok(())
            }
        }
    }

    pub fn get(&self, user_id: UserId) -> Option<Arc<TransferSession>> {
        self.inner.lock().get(&user_id).cloned()
    }

    pub fn is_active(&self, user_id: UserId) -> bool {
        self.inner.lock().contains_key(&user_id)
    }

    /// Release the user's slot, returning the session that held it.
    pub fn clear(&self, user_id: UserId) -> Option<Arc<TransferSession>> {
        self.inner.lock().remove(&user_id)
    }
}
