use std::{fmt::Display, sync::Arc};

use ahash::RandomState;
use dashmap::DashMap;

use crate::users::User;

/// Opaque identifier of a tunnel connection, chosen when its handshake starts.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId(Arc<[u8]>);

impl SessionId {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<&[u8]> for SessionId {
    fn from(value: &[u8]) -> Self {
        SessionId(value.into())
    }
}

impl From<u64> for SessionId {
    fn from(value: u64) -> Self {
        SessionId(value.to_be_bytes().as_slice().into())
    }
}

impl Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for byte in self.0.iter() {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// Concurrent map from live sessions to the user that authenticated them.
#[derive(Debug, Default)]
pub struct SessionStore {
    sessions: DashMap<SessionId, Arc<User>, RandomState>,
}

impl SessionStore {
    pub fn new() -> Self {
        Default::default()
    }

    // Overwrites any previous binding for the same session.
    pub fn bind(&self, session_id: SessionId, user: Arc<User>) {
        if let Some(previous) = self.sessions.insert(session_id.clone(), user) {
            #[cfg(not(coverage_nightly))]
            tracing::warn!(session = %session_id, user = %previous.name(), "Replaced existing session binding.");
        }
    }

    pub fn get(&self, session_id: &SessionId) -> Option<Arc<User>> {
        self.sessions
            .get(session_id)
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Drop the binding for a session, usually when its connection ends.
    pub fn remove(&self, session_id: &SessionId) -> Option<Arc<User>> {
        self.sessions.remove(session_id).map(|(_, user)| user)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
