//! Remote Credential Management
//!
//! Holds the time-limited access token that authorizes the cloud broker
//! connection. Tokens are obtained through a [`LoginClient`] and replaced,
//! never mutated, on refresh. Only one login exchange runs at a time;
//! callers arriving while one is in flight wait for it and share its result.

#[cfg(test)]
mod tests;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::session::{CredentialSource, SessionError};

/// Default fraction of the TTL treated as already expired
pub const DEFAULT_REFRESH_MARGIN: f64 = 0.1;

/// Login failure
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// The server refused the account credentials
    Rejected(String),
    /// The login request could not be completed
    Transport(String),
    /// The server answered with something unusable
    InvalidResponse(String),
}

impl fmt::Display for AuthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthError::Rejected(msg) => write!(f, "Login rejected: {}", msg),
            AuthError::Transport(msg) => write!(f, "Login request failed: {}", msg),
            AuthError::InvalidResponse(msg) => write!(f, "Invalid login response: {}", msg),
        }
    }
}

impl std::error::Error for AuthError {}

/// Result of one successful login exchange
#[derive(Clone, PartialEq, Eq)]
pub struct LoginGrant {
    pub token: String,
    /// Lifetime reported by the server, if any
    pub expires_in: Option<Duration>,
}

impl fmt::Debug for LoginGrant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoginGrant")
            .field("token", &"<redacted>")
            .field("expires_in", &self.expires_in)
            .finish()
    }
}

/// Performs the login exchange against the cloud
#[async_trait]
pub trait LoginClient: Send + Sync {
    async fn login(&self) -> Result<LoginGrant, AuthError>;
}

/// An access token and its lifetime
#[derive(Clone)]
pub struct Credential {
    token: String,
    issued_at: Instant,
    ttl: Duration,
}

impl Credential {
    pub fn new(token: impl Into<String>, ttl: Duration) -> Self {
        Self {
            token: token.into(),
            issued_at: Instant::now(),
            ttl,
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn issued_at(&self) -> Instant {
        self.issued_at
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn expires_at(&self) -> Instant {
        self.issued_at + self.ttl
    }

    /// Valid iff `now < issued_at + ttl`
    pub fn is_valid_at(&self, now: Instant) -> bool {
        now < self.expires_at()
    }

    /// True once the last `margin` fraction of the TTL has begun
    pub fn needs_refresh_at(&self, now: Instant, margin: f64) -> bool {
        let usable = self.ttl.mul_f64((1.0 - margin).clamp(0.0, 1.0));
        now >= self.issued_at + usable
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("token", &"<redacted>")
            .field("issued_at", &self.issued_at)
            .field("ttl", &self.ttl)
            .finish()
    }
}

#[derive(Default)]
struct State {
    credential: Option<Arc<Credential>>,
    /// Completed login exchanges, successful or not
    attempts: u64,
    last_error: Option<AuthError>,
}

/// Owner of the remote access credential
pub struct CredentialManager {
    login: Arc<dyn LoginClient>,
    state: RwLock<State>,
    /// Held for the duration of a login exchange
    in_flight: Mutex<()>,
    default_ttl: Duration,
    margin: f64,
}

impl CredentialManager {
    /// `default_ttl` applies when the server does not report a lifetime
    pub fn new(login: Arc<dyn LoginClient>, default_ttl: Duration) -> Self {
        Self {
            login,
            state: RwLock::new(State::default()),
            in_flight: Mutex::new(()),
            default_ttl,
            margin: DEFAULT_REFRESH_MARGIN,
        }
    }

    pub fn with_refresh_margin(mut self, margin: f64) -> Self {
        self.margin = margin;
        self
    }

    /// The held credential, without refreshing it
    pub fn current(&self) -> Option<Arc<Credential>> {
        self.state.read().credential.clone()
    }

    /// A currently valid credential, logging in first if none is held or
    /// the held one is within the refresh margin of its expiry.
    ///
    /// If a merely proactive refresh fails, the still-valid credential is
    /// returned and the failure is only logged.
    pub async fn acquire(&self) -> Result<Arc<Credential>, AuthError> {
        let attempts_seen = {
            let state = self.state.read();
            if let Some(credential) = self.usable(&state) {
                return Ok(credential);
            }
            state.attempts
        };

        let _flight = self.in_flight.lock().await;

        // Someone else may have finished a login while we waited
        {
            let state = self.state.read();
            if let Some(credential) = self.usable(&state) {
                debug!("Sharing credential from concurrent login");
                return Ok(credential);
            }
            if state.attempts != attempts_seen {
                if let Some(e) = state.last_error.clone() {
                    drop(state);
                    return self.fall_back(e);
                }
            }
        }

        match self.refresh_locked().await {
            Ok(credential) => Ok(credential),
            Err(e) => self.fall_back(e),
        }
    }

    /// Unconditionally perform a new login exchange.
    ///
    /// On failure the held credential is kept.
    pub async fn force_refresh(&self) -> Result<Arc<Credential>, AuthError> {
        let _flight = self.in_flight.lock().await;
        self.refresh_locked().await
    }

    /// Drop the held credential so the next `acquire` logs in again
    pub fn invalidate(&self) {
        self.state.write().credential = None;
    }

    fn usable(&self, state: &State) -> Option<Arc<Credential>> {
        state
            .credential
            .as_ref()
            .filter(|c| !c.needs_refresh_at(Instant::now(), self.margin))
            .cloned()
    }

    fn fall_back(&self, error: AuthError) -> Result<Arc<Credential>, AuthError> {
        match self.current() {
            Some(held) if held.is_valid_at(Instant::now()) => {
                warn!(
                    "Proactive credential refresh failed, keeping current token: {}",
                    error
                );
                Ok(held)
            }
            _ => Err(error),
        }
    }

    /// Run one login exchange. Caller holds `in_flight`.
    async fn refresh_locked(&self) -> Result<Arc<Credential>, AuthError> {
        let result = self.login.login().await;

        let mut state = self.state.write();
        state.attempts += 1;
        match result {
            Ok(grant) => {
                let ttl = grant
                    .expires_in
                    .filter(|ttl| !ttl.is_zero())
                    .unwrap_or(self.default_ttl);
                let credential = Arc::new(Credential::new(grant.token, ttl));
                state.credential = Some(credential.clone());
                state.last_error = None;
                info!("Obtained cloud access token (ttl={:?})", ttl);
                Ok(credential)
            }
            Err(e) => {
                warn!("Cloud login failed: {}", e);
                state.last_error = Some(e.clone());
                Err(e)
            }
        }
    }
}

#[async_trait]
impl CredentialSource for CredentialManager {
    async fn password(&self) -> Result<Option<Bytes>, SessionError> {
        let credential = self
            .acquire()
            .await
            .map_err(|e| SessionError::Credential(e.to_string()))?;
        Ok(Some(Bytes::copy_from_slice(credential.token().as_bytes())))
    }

    async fn rejected(&self) {
        warn!("Broker refused the access token, logging in again on next connect");
        self.invalidate();
    }
}
