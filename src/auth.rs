use std::sync::Arc;

use metrics::counter;

use crate::{
    error::ServerError,
    sessions::{SessionId, SessionStore},
    telemetry::{
        TELEMETRY_COUNTER_AUTHENTICATIONS_TOTAL, TELEMETRY_KEY_OUTCOME, TELEMETRY_OUTCOME_DENIED,
        TELEMETRY_OUTCOME_GRANTED, TELEMETRY_OUTCOME_OPEN,
    },
    users::{User, UserRegistry},
};

/// Outcome of a successful authentication.
#[derive(Debug, Clone)]
pub enum Grant {
    // No users are registered, so anyone is let in and nothing is bound.
    Open,
    // Credentials matched this user, now bound to the session.
    User(Arc<User>),
}

/// Password check performed once per tunnel connection attempt.
#[derive(Debug, Clone)]
pub struct AuthenticationGate {
    users: Arc<UserRegistry>,
    sessions: Arc<SessionStore>,
}

impl AuthenticationGate {
    pub fn new(users: Arc<UserRegistry>, sessions: Arc<SessionStore>) -> Self {
        AuthenticationGate { users, sessions }
    }

    pub fn users(&self) -> &Arc<UserRegistry> {
        &self.users
    }

    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }

    pub fn authentication_required(&self) -> bool {
        self.users.authentication_required()
    }

    /// Check the credentials for a session, binding the session to its user on success.
    ///
    /// With an empty registry every attempt is granted without a binding.
    pub fn authenticate(
        &self,
        username: &str,
        password: &str,
        session_id: &SessionId,
    ) -> Result<Grant, ServerError> {
        if !self.users.authentication_required() {
            counter!(TELEMETRY_COUNTER_AUTHENTICATIONS_TOTAL, TELEMETRY_KEY_OUTCOME => TELEMETRY_OUTCOME_OPEN)
                .increment(1);
            return Ok(Grant::Open);
        }
        match self.users.get(username) {
            Some(user) if user.verify_password(password) => {
                self.sessions.bind(session_id.clone(), Arc::clone(&user));
                counter!(TELEMETRY_COUNTER_AUTHENTICATIONS_TOTAL, TELEMETRY_KEY_OUTCOME => TELEMETRY_OUTCOME_GRANTED)
                    .increment(1);
                Ok(Grant::User(user))
            }
            // Same error whether the user is unknown or the password is wrong
            _ => {
                #[cfg(not(coverage_nightly))]
                tracing::debug!(user = %username, session = %session_id, "Login failed.");
                counter!(TELEMETRY_COUNTER_AUTHENTICATIONS_TOTAL, TELEMETRY_KEY_OUTCOME => TELEMETRY_OUTCOME_DENIED)
                    .increment(1);
                Err(ServerError::InvalidCredentials(username.into()))
            }
        }
    }
}
