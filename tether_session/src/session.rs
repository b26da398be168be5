//! The session facade offered to the application

use std::fmt;

use tether_clock::Clock;
use thiserror::Error;
use tokio::sync::watch;

use crate::{
    backend::{http::BackendConfigError, AuthBackend, BackendError, HttpAuthBackend},
    config::SessionConfig,
    coordinator::{CoordinatorBuilder, RefreshCoordinator, SessionState},
    guard::SessionGuard,
    navigator::Navigator,
    store::{CredentialPair, StoreError, TokenStore},
    EmailRef, IdentityLabel, IdentityLabelRef, SecretRef,
};

/// An error from an explicit session operation
#[derive(Debug, Error)]
pub enum SessionError {
    /// The backend refused or failed the login
    #[error("login failed")]
    Login(#[source] BackendError),
    /// The backend refused or failed the registration
    #[error("registration failed")]
    Register(#[source] BackendError),
    /// The credentials could not be stored
    #[error(transparent)]
    Storage(#[from] StoreError),
}

/// The authenticated session of one client
///
/// `Session` ties a backend, a token store, and a [`RefreshCoordinator`]
/// together and offers the operations the application itself performs:
/// logging in and out, registering, and finding out who is logged in.
/// Requests are authorized through a middleware built from the session, and
/// protected views are gated through its [`guard()`][Self::guard()].
///
/// Clones share the same session.
pub struct Session<B> {
    coordinator: RefreshCoordinator<B>,
    config: SessionConfig,
}

impl<B> Clone for Session<B> {
    fn clone(&self) -> Self {
        Self {
            coordinator: self.coordinator.clone(),
            config: self.config.clone(),
        }
    }
}

impl<B> fmt::Debug for Session<B> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Session")
            .field("coordinator", &self.coordinator)
            .field("config", &self.config)
            .finish()
    }
}

/// Builder for a [`Session`]
pub struct SessionBuilder<B> {
    coordinator: CoordinatorBuilder<B>,
    config: SessionConfig,
}

impl<B> fmt::Debug for SessionBuilder<B> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("SessionBuilder")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<B> SessionBuilder<B> {
    /// Sets the session configuration
    pub fn with_config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the clock used to judge token expiry
    pub fn with_clock(mut self, clock: impl Clock + Send + Sync + 'static) -> Self {
        self.coordinator = self.coordinator.with_clock(clock);
        self
    }

    /// Sets the navigator used to send the user to the login route
    pub fn with_navigator(mut self, navigator: impl Navigator + 'static) -> Self {
        self.coordinator = self.coordinator.with_navigator(navigator);
        self
    }

    /// Builds the session
    pub fn build(self) -> Session<B> {
        Session {
            coordinator: self.coordinator.with_config(&self.config).build(),
            config: self.config,
        }
    }
}

impl Session<HttpAuthBackend> {
    /// Starts building a session talking to the HTTP backend described by `config`
    pub fn builder_from_config(
        config: SessionConfig,
        store: TokenStore,
    ) -> Result<SessionBuilder<HttpAuthBackend>, BackendConfigError> {
        let backend = HttpAuthBackend::from_config(&config)?;
        Ok(Self::builder(backend, store).with_config(config))
    }
}

impl<B> Session<B> {
    /// Starts building a session over a backend and a token store
    pub fn builder(backend: B, store: TokenStore) -> SessionBuilder<B> {
        SessionBuilder {
            coordinator: RefreshCoordinator::builder(backend, store),
            config: SessionConfig::default(),
        }
    }

    /// The configuration in use
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// The coordinator refreshing this session's credentials
    pub fn coordinator(&self) -> &RefreshCoordinator<B> {
        &self.coordinator
    }

    /// The store holding this session's credentials
    pub fn store(&self) -> &TokenStore {
        self.coordinator.store()
    }

    /// The current session state
    pub fn state(&self) -> SessionState {
        self.coordinator.state()
    }

    /// Subscribes to session state transitions
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.coordinator.subscribe()
    }

    /// The label of the logged in user
    ///
    /// For display only; it carries no authority.
    pub fn current_identity(&self) -> Option<IdentityLabel> {
        self.store().identity()
    }

    /// A guard for protected views and operations
    pub fn guard(&self) -> SessionGuard<B> {
        SessionGuard::new(self.coordinator.clone())
    }
}

impl<B: AuthBackend + 'static> Session<B> {
    /// Exchanges an identity and secret for credentials
    ///
    /// On success the credentials are stored and the session is
    /// authenticated. Navigating away from the login view is left to the
    /// caller.
    #[tracing::instrument(err, skip(self, secret))]
    pub async fn login(
        &self,
        identity: &IdentityLabelRef,
        secret: &SecretRef,
    ) -> Result<(), SessionError> {
        let resp = self
            .coordinator
            .backend()
            .login(identity, secret)
            .await
            .map_err(SessionError::Login)?;

        self.store().set(&CredentialPair {
            access_token: resp.access_token,
            refresh_token: resp.refresh_token,
            identity: identity.to_owned(),
        })?;

        self.coordinator.logged_in();
        Ok(())
    }

    /// Ends the session
    ///
    /// Local credentials are discarded and the user is sent to the login
    /// route right away. The backend is told about the logout in the
    /// background; if that fails, the failure is only logged.
    pub fn logout(&self) {
        let credentials = self.store().get();

        if let Err(error) = self.store().clear() {
            tracing::warn!(
                error = (&error as &dyn std::error::Error),
                "unable to fully clear credentials on logout"
            );
        }

        self.coordinator.logged_out();
        self.coordinator.navigate_to_login();

        if credentials.is_empty() {
            return;
        }

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let coordinator = self.coordinator.clone();
                handle.spawn(async move {
                    if let Err(error) = coordinator.backend().logout(&credentials).await {
                        tracing::warn!(
                            error = (&error as &dyn std::error::Error),
                            "backend logout notification failed"
                        );
                    }
                });
            }
            Err(_) => {
                tracing::debug!("no async runtime available, skipping backend logout notification");
            }
        }
    }

    /// Creates a new account
    ///
    /// Registering does not log in.
    #[tracing::instrument(err, skip(self, email, secret))]
    pub async fn register(
        &self,
        identity: &IdentityLabelRef,
        email: &EmailRef,
        secret: &SecretRef,
    ) -> Result<(), SessionError> {
        self.coordinator
            .backend()
            .register(identity, email, secret)
            .await
            .map_err(SessionError::Register)
    }

    /// Re-validates stored credentials, typically on start-up
    ///
    /// Refreshes when the stored access token is missing or close to expiry
    /// and a refresh token is available, then reports the resulting state.
    pub async fn restore(&self) -> SessionState {
        let stored = self.store().get();

        if stored.refresh_token.is_none() {
            if self.state() == SessionState::Authenticated {
                tracing::debug!("stored refresh token disappeared");
                self.coordinator.logged_out();
            }
            return self.state();
        }

        let needs_refresh = match stored.access_token() {
            Some(token) => self.coordinator.predictor().needs_proactive_refresh(token),
            None => true,
        };

        if needs_refresh {
            if let Err(error) = self.coordinator.refresh().await {
                tracing::debug!(
                    error = (&error as &dyn std::error::Error),
                    "unable to refresh stored credentials on restore"
                );
            }
        }

        self.state()
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use tether_clock::{DurationSecs, TestClock, UnixTime};

    use super::*;
    use crate::{
        storage::MemoryStorage,
        store::StoredCredentials,
        testing::{token_expiring_at, MockBackend, RecordingNavigator, Reply},
        AccessToken, Email, RefreshToken, Secret,
    };

    const NOW: UnixTime = UnixTime(1_700_000_000);

    struct Fixture {
        backend: Arc<MockBackend>,
        navigator: RecordingNavigator,
        session: Session<Arc<MockBackend>>,
    }

    fn fixture(backend: MockBackend) -> Fixture {
        let backend = Arc::new(backend);
        let navigator = RecordingNavigator::new();
        let session = Session::builder(backend.clone(), TokenStore::new(MemoryStorage::new()))
            .with_clock(TestClock::new(NOW))
            .with_navigator(navigator.clone())
            .build();

        Fixture {
            backend,
            navigator,
            session,
        }
    }

    fn expiring_in(secs: u64, tag: &str) -> AccessToken {
        token_expiring_at(NOW + DurationSecs(secs), tag)
    }

    async fn log_in(session: &Session<Arc<MockBackend>>) {
        session
            .login(&IdentityLabel::from_static("alice"), &Secret::from_static("pw"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn login_stores_the_issued_pair() {
        let f = fixture(MockBackend::new().with_login(Reply::pair(
            AccessToken::from_static("A1"),
            RefreshToken::from_static("R1"),
        )));

        log_in(&f.session).await;

        assert_eq!(
            f.session.store().get(),
            StoredCredentials {
                access_token: Some(AccessToken::from_static("A1")),
                refresh_token: Some(RefreshToken::from_static("R1")),
                identity: Some(IdentityLabel::from_static("alice")),
            }
        );
        assert_eq!(f.session.state(), SessionState::Authenticated);
        assert_eq!(
            f.session.current_identity(),
            Some(IdentityLabel::from_static("alice"))
        );
        assert!(f.navigator.routes().is_empty());
    }

    #[tokio::test]
    async fn failed_login_leaves_session_unauthenticated() {
        let f = fixture(MockBackend::new().with_login(Reply::Reject(401)));

        let err = f
            .session
            .login(&IdentityLabel::from_static("alice"), &Secret::from_static("nope"))
            .await
            .unwrap_err();

        assert!(matches!(err, SessionError::Login(ref e) if e.is_rejection()));
        assert!(f.session.store().get().is_empty());
        assert_eq!(f.session.state(), SessionState::Unauthenticated);
    }

    #[tokio::test]
    async fn login_after_expiry_makes_the_session_refreshable_again() {
        let f = fixture(
            MockBackend::new()
                .with_login(Reply::pair(
                    expiring_in(60, "A1"),
                    RefreshToken::from_static("R1"),
                ))
                .with_refresh(Reply::Reject(401))
                .with_refresh(Reply::access(expiring_in(3600, "A2"))),
        );
        log_in(&f.session).await;
        assert!(f.session.coordinator().refresh().await.is_err());
        assert_eq!(f.session.state(), SessionState::Expired);

        log_in(&f.session).await;
        assert_eq!(f.session.state(), SessionState::Authenticated);

        f.session.coordinator().refresh().await.unwrap();
        assert_eq!(f.backend.refresh_calls(), 2);
    }

    mod when_logging_out {
        use super::*;

        #[tokio::test]
        async fn local_credentials_are_cleared_even_if_backend_fails() {
            let f = fixture(
                MockBackend::new()
                    .with_login(Reply::pair(
                        AccessToken::from_static("A1"),
                        RefreshToken::from_static("R1"),
                    ))
                    .with_failing_logout(),
            );
            log_in(&f.session).await;

            f.session.logout();

            assert!(f.session.store().get().is_empty());
            assert_eq!(f.session.state(), SessionState::Unauthenticated);
            assert_eq!(f.session.current_identity(), None);
            assert_eq!(f.navigator.routes(), vec!["/auth/login".to_owned()]);

            tokio::time::sleep(Duration::from_millis(10)).await;
            assert_eq!(f.backend.logout_calls(), 1);
        }

        #[tokio::test]
        async fn backend_is_not_notified_without_credentials() {
            let f = fixture(MockBackend::new());

            f.session.logout();

            tokio::time::sleep(Duration::from_millis(10)).await;
            assert_eq!(f.backend.logout_calls(), 0);
            assert_eq!(f.navigator.routes().len(), 1);
        }

        #[test]
        fn works_outside_of_a_runtime() {
            let f = fixture(MockBackend::new());
            f.session
                .store()
                .set(&CredentialPair {
                    access_token: AccessToken::from_static("A1"),
                    refresh_token: RefreshToken::from_static("R1"),
                    identity: IdentityLabel::from_static("alice"),
                })
                .unwrap();

            f.session.logout();

            assert!(f.session.store().get().is_empty());
            assert_eq!(f.backend.logout_calls(), 0);
        }
    }

    #[tokio::test]
    async fn register_does_not_log_in() {
        let f = fixture(MockBackend::new());

        f.session
            .register(
                &IdentityLabel::from_static("bob"),
                &Email::from_static("bob@example.com"),
                &Secret::from_static("pw"),
            )
            .await
            .unwrap();

        assert_eq!(f.backend.register_calls(), 1);
        assert_eq!(f.session.state(), SessionState::Unauthenticated);
        assert!(f.session.store().get().is_empty());
    }

    mod when_restoring {
        use super::*;

        #[tokio::test]
        async fn near_expiry_token_is_refreshed() {
            let f = fixture(
                MockBackend::new()
                    .with_login(Reply::pair(
                        expiring_in(60, "A1"),
                        RefreshToken::from_static("R1"),
                    ))
                    .with_refresh(Reply::access(expiring_in(3600, "A2"))),
            );
            log_in(&f.session).await;

            assert_eq!(f.session.restore().await, SessionState::Authenticated);
            assert_eq!(f.backend.refresh_calls(), 1);
            assert_eq!(
                f.session.store().get().access_token,
                Some(expiring_in(3600, "A2"))
            );
        }

        #[tokio::test]
        async fn fresh_token_is_kept() {
            let f = fixture(MockBackend::new().with_login(Reply::pair(
                expiring_in(3600, "A1"),
                RefreshToken::from_static("R1"),
            )));
            log_in(&f.session).await;

            assert_eq!(f.session.restore().await, SessionState::Authenticated);
            assert_eq!(f.backend.refresh_calls(), 0);
        }

        #[tokio::test]
        async fn rejected_refresh_expires_the_session() {
            let f = fixture(
                MockBackend::new()
                    .with_login(Reply::pair(
                        expiring_in(0, "A1"),
                        RefreshToken::from_static("R1"),
                    ))
                    .with_refresh(Reply::Reject(401)),
            );
            log_in(&f.session).await;

            assert_eq!(f.session.restore().await, SessionState::Expired);
            assert_eq!(f.navigator.routes().len(), 1);
        }

        #[tokio::test]
        async fn empty_store_stays_unauthenticated() {
            let f = fixture(MockBackend::new());

            assert_eq!(f.session.restore().await, SessionState::Unauthenticated);
            assert_eq!(f.backend.refresh_calls(), 0);
        }
    }
}
