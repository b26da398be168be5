//! Gating of protected views and operations

use std::{fmt, future::Future};

use crate::{
    backend::AuthBackend,
    coordinator::{RefreshCoordinator, SessionState},
};

/// The verdict of a guard check
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Access {
    /// A usable session exists
    Granted,
    /// No usable session exists; the login route has been requested
    Denied,
}

impl Access {
    /// Whether access was granted
    #[inline]
    pub fn is_granted(self) -> bool {
        self == Self::Granted
    }
}

/// Protects views and operations that require an authenticated session
pub struct SessionGuard<B> {
    coordinator: RefreshCoordinator<B>,
}

impl<B> Clone for SessionGuard<B> {
    fn clone(&self) -> Self {
        Self {
            coordinator: self.coordinator.clone(),
        }
    }
}

impl<B> fmt::Debug for SessionGuard<B> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("SessionGuard")
            .field("coordinator", &self.coordinator)
            .finish()
    }
}

impl<B> SessionGuard<B> {
    /// Constructs a guard over a refresh coordinator
    pub fn new(coordinator: RefreshCoordinator<B>) -> Self {
        Self { coordinator }
    }

    /// Begins one activation of the guard
    ///
    /// An activation corresponds to one attempt to enter a protected view.
    /// It refreshes at most once and redirects at most once, however often
    /// it is checked.
    pub fn activate(&self) -> GuardActivation<B> {
        GuardActivation {
            coordinator: self.coordinator.clone(),
            refresh_attempted: false,
            redirected: false,
        }
    }
}

impl<B: AuthBackend + 'static> SessionGuard<B> {
    /// Runs `op` if a fresh activation grants access
    ///
    /// Returns `None` when access was denied and `op` was not run.
    pub async fn gate<F, Fut>(&self, op: F) -> Option<Fut::Output>
    where
        F: FnOnce() -> Fut,
        Fut: Future,
    {
        match self.activate().check().await {
            Access::Granted => Some(op().await),
            Access::Denied => None,
        }
    }
}

/// A single activation of a [`SessionGuard`]
pub struct GuardActivation<B> {
    coordinator: RefreshCoordinator<B>,
    refresh_attempted: bool,
    redirected: bool,
}

impl<B> fmt::Debug for GuardActivation<B> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("GuardActivation")
            .field("refresh_attempted", &self.refresh_attempted)
            .field("redirected", &self.redirected)
            .finish_non_exhaustive()
    }
}

impl<B> GuardActivation<B> {
    /// Whether this activation has already attempted a refresh
    pub fn refresh_attempted(&self) -> bool {
        self.refresh_attempted
    }

    /// Whether this activation has already redirected to the login route
    pub fn redirected(&self) -> bool {
        self.redirected
    }

    fn has_usable_access_token(&self) -> bool {
        let stored = self.coordinator.store().get();
        stored
            .access_token()
            .is_some_and(|token| self.coordinator.predictor().is_usable(token))
    }

    fn deny(&mut self) -> Access {
        if !self.redirected {
            self.redirected = true;
            tracing::debug!("no usable session, redirecting to login");
            self.coordinator.navigate_to_login();
        }
        Access::Denied
    }
}

impl<B: AuthBackend + 'static> GuardActivation<B> {
    /// Checks whether a usable session exists
    ///
    /// A usable access token grants access immediately, even inside the
    /// proactive threshold. Only when the access token is absent or expired,
    /// a refresh token is available, and this activation has not refreshed
    /// yet is one refresh attempted.
    pub async fn check(&mut self) -> Access {
        let stored = self.coordinator.store().get();
        if let Some(token) = stored.access_token() {
            if self.coordinator.predictor().is_usable(token) {
                return Access::Granted;
            }
        }

        if stored.refresh_token.is_some() && !self.refresh_attempted {
            self.refresh_attempted = true;
            let was_expired = self.coordinator.state() == SessionState::Expired;

            match self.coordinator.refresh().await {
                Ok(()) => return Access::Granted,
                Err(error) => {
                    tracing::debug!(
                        error = (&error as &dyn std::error::Error),
                        "guard refresh failed"
                    );

                    // Expiring the session already sent the navigator to login
                    if !was_expired && self.coordinator.state() == SessionState::Expired {
                        self.redirected = true;
                    }
                }
            }
        }

        if self.has_usable_access_token() {
            return Access::Granted;
        }

        self.deny()
    }
}
