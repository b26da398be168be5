//! Test doubles for exercising session handling without a live backend

use std::{
    collections::VecDeque,
    io,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use tether_clock::UnixTime;
use tokio::sync::Semaphore;

use crate::{
    backend::{AuthBackend, BackendError, LoginResponse, RefreshResponse},
    navigator::Navigator,
    store::StoredCredentials,
    AccessToken, EmailRef, IdentityLabelRef, RefreshToken, RefreshTokenRef, SecretRef,
};

/// Builds an unsigned compact JWT carrying the given payload
pub fn token_with_payload(payload: &serde_json::Value) -> AccessToken {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
    let body = URL_SAFE_NO_PAD.encode(payload.to_string());
    AccessToken::new(format!("{}.{}.c2lnbmF0dXJl", header, body))
}

/// Builds a token expiring at `exp`
///
/// `tag` lands in the `sub` claim so that tokens with equal expiry differ.
pub fn token_expiring_at(exp: UnixTime, tag: &str) -> AccessToken {
    token_with_payload(&serde_json::json!({ "exp": exp.0, "sub": tag }))
}

/// A scripted backend answer
#[derive(Clone, Debug)]
pub enum Reply {
    /// Issue these tokens
    Tokens {
        /// The access token to issue
        access_token: AccessToken,
        /// The refresh token to issue, if any
        refresh_token: Option<RefreshToken>,
    },
    /// Refuse the credentials with a status such as 401
    Reject(u16),
    /// Fail with a status the backend may recover from, such as 503 or 429
    Fail(u16),
    /// Never get an answer, as when the request times out
    Unreachable,
}

impl Reply {
    /// Issue an access token without rotating the refresh token
    pub fn access(access_token: AccessToken) -> Self {
        Self::Tokens {
            access_token,
            refresh_token: None,
        }
    }

    /// Issue both tokens
    pub fn pair(access_token: AccessToken, refresh_token: RefreshToken) -> Self {
        Self::Tokens {
            access_token,
            refresh_token: Some(refresh_token),
        }
    }

    fn into_result(self) -> Result<(AccessToken, Option<RefreshToken>), BackendError> {
        match self {
            Self::Tokens {
                access_token,
                refresh_token,
            } => Ok((access_token, refresh_token)),
            Self::Reject(status) | Self::Fail(status) => {
                Err(BackendError::from_status(status, "scripted failure"))
            }
            Self::Unreachable => Err(BackendError::Transport(Box::new(io::Error::new(
                io::ErrorKind::TimedOut,
                "scripted timeout",
            )))),
        }
    }
}

/// An in-process backend with scripted replies and call counters
#[derive(Debug, Default)]
pub struct MockBackend {
    login_reply: Mutex<Option<Reply>>,
    refresh_replies: Mutex<VecDeque<Reply>>,
    logout_fails: bool,
    gate: Option<Arc<Semaphore>>,
    login_calls: AtomicUsize,
    refresh_calls: AtomicUsize,
    logout_calls: AtomicUsize,
    register_calls: AtomicUsize,
    refreshed_with: Mutex<Vec<RefreshToken>>,
}

impl MockBackend {
    /// Constructs a backend with no scripted replies
    pub fn new() -> Self {
        Self::default()
    }

    /// Answers every login with `reply`
    pub fn with_login(self, reply: Reply) -> Self {
        *self.login_reply.lock().unwrap() = Some(reply);
        self
    }

    /// Queues `reply` for the next unanswered refresh
    pub fn with_refresh(self, reply: Reply) -> Self {
        self.refresh_replies.lock().unwrap().push_back(reply);
        self
    }

    /// Makes logout notifications fail
    pub fn with_failing_logout(mut self) -> Self {
        self.logout_fails = true;
        self
    }

    /// Holds every refresh until [`release_refreshes()`][Self::release_refreshes()] is called
    pub fn with_held_refreshes(mut self) -> Self {
        self.gate = Some(Arc::new(Semaphore::new(0)));
        self
    }

    /// Lets `n` held refreshes proceed
    pub fn release_refreshes(&self, n: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(n);
        }
    }

    /// Number of login calls received
    pub fn login_calls(&self) -> usize {
        self.login_calls.load(Ordering::SeqCst)
    }

    /// Number of refresh calls received
    pub fn refresh_calls(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    /// Number of logout notifications received
    pub fn logout_calls(&self) -> usize {
        self.logout_calls.load(Ordering::SeqCst)
    }

    /// Number of registrations received
    pub fn register_calls(&self) -> usize {
        self.register_calls.load(Ordering::SeqCst)
    }

    /// The refresh tokens presented so far, in order
    pub fn refreshed_with(&self) -> Vec<RefreshToken> {
        self.refreshed_with.lock().unwrap().clone()
    }
}

#[async_trait]
impl AuthBackend for MockBackend {
    async fn login(
        &self,
        _identity: &IdentityLabelRef,
        _secret: &SecretRef,
    ) -> Result<LoginResponse, BackendError> {
        self.login_calls.fetch_add(1, Ordering::SeqCst);
        let reply = self.login_reply.lock().unwrap().clone();
        match reply.unwrap_or(Reply::Reject(401)).into_result()? {
            (access_token, Some(refresh_token)) => Ok(LoginResponse {
                access_token,
                refresh_token,
            }),
            (_, None) => Err(BackendError::from_status(500, "login issued no refresh token")),
        }
    }

    async fn refresh(
        &self,
        refresh_token: &RefreshTokenRef,
    ) -> Result<RefreshResponse, BackendError> {
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        self.refreshed_with
            .lock()
            .unwrap()
            .push(refresh_token.to_owned());

        if let Some(gate) = &self.gate {
            gate.acquire()
                .await
                .map_err(|e| BackendError::Transport(Box::new(e)))?
                .forget();
        }

        let reply = self.refresh_replies.lock().unwrap().pop_front();
        let (access_token, refresh_token) = reply.unwrap_or(Reply::Fail(503)).into_result()?;
        Ok(RefreshResponse {
            access_token,
            refresh_token,
        })
    }

    async fn logout(&self, _credentials: &StoredCredentials) -> Result<(), BackendError> {
        self.logout_calls.fetch_add(1, Ordering::SeqCst);
        if self.logout_fails {
            Err(BackendError::from_status(500, "logout unavailable"))
        } else {
            Ok(())
        }
    }

    async fn register(
        &self,
        _identity: &IdentityLabelRef,
        _email: &EmailRef,
        _secret: &SecretRef,
    ) -> Result<(), BackendError> {
        self.register_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// A navigator that remembers every route it was sent to
#[derive(Clone, Debug, Default)]
pub struct RecordingNavigator {
    routes: Arc<Mutex<Vec<String>>>,
}

impl RecordingNavigator {
    /// Constructs a navigator with an empty history
    pub fn new() -> Self {
        Self::default()
    }

    /// The routes navigated to so far
    pub fn routes(&self) -> Vec<String> {
        self.routes.lock().unwrap().clone()
    }
}

impl Navigator for RecordingNavigator {
    fn navigate(&self, route: &str) {
        self.routes.lock().unwrap().push(route.to_owned());
    }
}
