use std::{
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    thread,
};

use tether_clock::{Clock, System};
use thiserror::Error;
use tokio::sync::watch;

use crate::{
    backend::{AuthBackend, BackendError, RefreshResponse},
    config::SessionConfig,
    expiry::ExpiryPredictor,
    navigator::{Navigator, TracingNavigator},
    store::{CredentialPair, StoreError, TokenStore},
    IdentityLabel, RefreshToken, RefreshTokenRef,
};

/// A clock that can be shared between tasks
pub type SharedClock = Arc<dyn Clock + Send + Sync>;

/// The lifecycle state of the session
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// No credentials are held
    Unauthenticated,
    /// Credentials are held and believed usable
    Authenticated,
    /// Credentials are being refreshed
    RefreshInFlight,
    /// The backend refused to refresh the session; a new login is required
    Expired,
}

/// Why a refresh did not produce new credentials
///
/// Every caller waiting on the same refresh receives a clone of the same error.
#[derive(Clone, Debug, Error)]
pub enum RefreshError {
    /// There is no refresh token to present
    #[error("no refresh token available")]
    MissingRefreshToken,
    /// The backend refused the refresh token
    #[error("refresh token rejected by backend")]
    Rejected(#[source] Arc<BackendError>),
    /// The backend could not be reached or failed
    #[error("unable to refresh credentials")]
    Backend(#[source] Arc<BackendError>),
    /// The refreshed credentials could not be stored
    #[error("unable to store refreshed credentials")]
    Storage(#[source] Arc<StoreError>),
    /// The refresh task ended without reporting an outcome
    #[error("refresh interrupted before completing")]
    Interrupted,
}

impl RefreshError {
    /// Whether the session cannot be recovered without a new login
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::MissingRefreshToken | Self::Rejected(_))
    }
}

type RefreshOutcome = Result<(), RefreshError>;
type RefreshHandle = watch::Receiver<Option<RefreshOutcome>>;

struct Shared<B> {
    backend: B,
    store: TokenStore,
    predictor: ExpiryPredictor<SharedClock>,
    navigator: Arc<dyn Navigator>,
    login_route: String,
    state: watch::Sender<SessionState>,
    in_flight: Mutex<Option<RefreshHandle>>,
    rejected: Mutex<Option<RefreshToken>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Coordinates token refreshes so that at most one is in flight at a time
///
/// Any number of callers may ask for a refresh concurrently. The first one
/// starts the backend call; everyone else waits on that same call, and all
/// of them observe the identical outcome. The coordinator also owns the
/// [`SessionState`] and publishes every transition.
///
/// Clones share the same state.
pub struct RefreshCoordinator<B> {
    shared: Arc<Shared<B>>,
}

impl<B> Clone for RefreshCoordinator<B> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<B> fmt::Debug for RefreshCoordinator<B> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("RefreshCoordinator")
            .field("state", &*self.shared.state.borrow())
            .field("in_flight", &lock(&self.shared.in_flight).is_some())
            .finish_non_exhaustive()
    }
}

/// Builder for a [`RefreshCoordinator`]
pub struct CoordinatorBuilder<B> {
    backend: B,
    store: TokenStore,
    predictor: ExpiryPredictor<SharedClock>,
    navigator: Arc<dyn Navigator>,
    login_route: String,
}

impl<B> fmt::Debug for CoordinatorBuilder<B> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("CoordinatorBuilder")
            .field("threshold", &self.predictor.threshold())
            .field("login_route", &self.login_route)
            .finish_non_exhaustive()
    }
}

impl<B> CoordinatorBuilder<B> {
    /// Applies the proactive threshold and login route from `config`
    pub fn with_config(mut self, config: &SessionConfig) -> Self {
        self.predictor = self.predictor.with_threshold(config.proactive_threshold());
        self.login_route = config.login_route().to_owned();
        self
    }

    /// Sets the clock used to judge token expiry
    pub fn with_clock(mut self, clock: impl Clock + Send + Sync + 'static) -> Self {
        self.predictor = self.predictor.with_clock(Arc::new(clock) as SharedClock);
        self
    }

    /// Sets the navigator used when the session expires
    pub fn with_navigator(mut self, navigator: impl Navigator + 'static) -> Self {
        self.navigator = Arc::new(navigator);
        self
    }

    /// Builds the coordinator
    ///
    /// The initial state is derived from the store: a stored refresh token
    /// means the session is considered authenticated.
    pub fn build(self) -> RefreshCoordinator<B> {
        let initial = if self.store.refresh_token().is_some() {
            SessionState::Authenticated
        } else {
            SessionState::Unauthenticated
        };

        let (state, _) = watch::channel(initial);

        RefreshCoordinator {
            shared: Arc::new(Shared {
                backend: self.backend,
                store: self.store,
                predictor: self.predictor,
                navigator: self.navigator,
                login_route: self.login_route,
                state,
                in_flight: Mutex::new(None),
                rejected: Mutex::new(None),
            }),
        }
    }
}

impl<B> RefreshCoordinator<B> {
    /// Starts building a coordinator over a backend and a token store
    pub fn builder(backend: B, store: TokenStore) -> CoordinatorBuilder<B> {
        let defaults = SessionConfig::default();
        CoordinatorBuilder {
            backend,
            store,
            predictor: ExpiryPredictor::new(defaults.proactive_threshold())
                .with_clock(Arc::new(System) as SharedClock),
            navigator: Arc::new(TracingNavigator),
            login_route: defaults.login_route().to_owned(),
        }
    }

    /// The token store refreshed credentials are written to
    pub fn store(&self) -> &TokenStore {
        &self.shared.store
    }

    /// The expiry predictor in use
    pub fn predictor(&self) -> &ExpiryPredictor<SharedClock> {
        &self.shared.predictor
    }

    /// The backend refreshes are requested from
    pub fn backend(&self) -> &B {
        &self.shared.backend
    }

    /// The current session state
    pub fn state(&self) -> SessionState {
        *self.shared.state.borrow()
    }

    /// Subscribes to session state transitions
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.shared.state.subscribe()
    }

    /// Whether a refresh is currently in flight
    pub fn is_refreshing(&self) -> bool {
        lock(&self.shared.in_flight).is_some()
    }

    /// Records that a login stored fresh credentials
    pub(crate) fn logged_in(&self) {
        lock(&self.shared.rejected).take();
        self.shared.transition(SessionState::Authenticated);
    }

    /// Records that local credentials were discarded on purpose
    pub(crate) fn logged_out(&self) {
        self.shared.transition(SessionState::Unauthenticated);
    }

    /// Sends the navigator to the login route
    pub(crate) fn navigate_to_login(&self) {
        self.shared.navigator.navigate(&self.shared.login_route);
    }
}

impl<B: AuthBackend + 'static> RefreshCoordinator<B> {
    /// Refreshes the stored credentials
    ///
    /// If a refresh is already in flight, this waits for it rather than
    /// starting another. On success, the store holds usable credentials.
    ///
    /// # Errors
    ///
    /// Terminal failures ([`RefreshError::is_terminal()`]) expire the session:
    /// the store is cleared and the navigator is sent to the login route.
    /// Other failures leave the store untouched.
    pub async fn refresh(&self) -> Result<(), RefreshError> {
        let mut handle = self.join_or_start()?;

        let outcome = match handle.wait_for(Option::is_some).await {
            Ok(outcome) => outcome.clone(),
            Err(_) => None,
        };

        outcome.unwrap_or(Err(RefreshError::Interrupted))
    }

    fn join_or_start(&self) -> Result<RefreshHandle, RefreshError> {
        let mut slot = lock(&self.shared.in_flight);
        if let Some(handle) = &*slot {
            tracing::debug!("joining refresh already in flight");
            return Ok(handle.clone());
        }

        let Some(refresh_token) = self.usable_refresh_token() else {
            drop(slot);
            self.shared.missing_refresh_token();
            return Err(RefreshError::MissingRefreshToken);
        };

        let (tx, rx) = watch::channel(None);
        *slot = Some(rx.clone());
        self.shared.transition(SessionState::RefreshInFlight);

        tokio::spawn(Arc::clone(&self.shared).run_refresh(refresh_token, tx));
        Ok(rx)
    }

    fn usable_refresh_token(&self) -> Option<RefreshToken> {
        let token = self.shared.store.refresh_token()?;
        if lock(&self.shared.rejected).as_ref() == Some(&token) {
            tracing::warn!("stored refresh token was already rejected, clearing credentials");
            if let Err(error) = self.shared.store.clear() {
                tracing::warn!(
                    error = (&error as &dyn std::error::Error),
                    "unable to clear rejected credentials"
                );
            }
            return None;
        }
        Some(token)
    }
}

impl<B: AuthBackend + 'static> Shared<B> {
    async fn run_refresh(
        self: Arc<Self>,
        refresh_token: RefreshToken,
        tx: watch::Sender<Option<RefreshOutcome>>,
    ) {
        let outcome = {
            let _retire = Retire { shared: &*self };

            tracing::debug!("requesting refreshed credentials");
            let result = self.backend.refresh(&refresh_token).await;
            self.apply(&refresh_token, result)
        };

        tx.send_replace(Some(outcome));
    }
}

impl<B> Shared<B> {
    fn transition(&self, next: SessionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            tracing::info!(?previous, ?next, "session state changed");
        }
    }

    fn apply(
        &self,
        used: &RefreshTokenRef,
        result: Result<RefreshResponse, BackendError>,
    ) -> RefreshOutcome {
        let current = self.store.get();
        if current.refresh_token() != Some(used) {
            return self.superseded(current.refresh_token.is_some());
        }

        match result {
            Ok(resp) => {
                let pair = CredentialPair {
                    access_token: resp.access_token,
                    refresh_token: resp.refresh_token.unwrap_or_else(|| used.to_owned()),
                    identity: current
                        .identity
                        .unwrap_or_else(|| IdentityLabel::from_static("")),
                };

                match self.store.set(&pair) {
                    Ok(()) => {
                        tracing::info!(
                            expires_in = self.predictor.seconds_remaining(&pair.access_token),
                            "refreshed credentials"
                        );
                        self.transition(SessionState::Authenticated);
                        Ok(())
                    }
                    Err(error) => {
                        tracing::warn!(
                            error = (&error as &dyn std::error::Error),
                            "unable to store refreshed credentials"
                        );
                        self.transition(SessionState::Authenticated);
                        Err(RefreshError::Storage(Arc::new(error)))
                    }
                }
            }
            Err(error) if error.is_rejection() => {
                tracing::warn!(
                    error = (&error as &dyn std::error::Error),
                    "refresh token rejected, expiring session"
                );
                *lock(&self.rejected) = Some(used.to_owned());
                self.expire();
                Err(RefreshError::Rejected(Arc::new(error)))
            }
            Err(error) => {
                tracing::warn!(
                    error = (&error as &dyn std::error::Error),
                    "error refreshing credentials, will retry on next trigger"
                );
                self.transition(SessionState::Authenticated);
                Err(RefreshError::Backend(Arc::new(error)))
            }
        }
    }

    fn superseded(&self, has_newer_credentials: bool) -> RefreshOutcome {
        tracing::info!(
            has_newer_credentials,
            "stored credentials changed during refresh, discarding result"
        );

        let derived = if has_newer_credentials {
            SessionState::Authenticated
        } else {
            SessionState::Unauthenticated
        };
        self.state.send_if_modified(|state| {
            if *state == SessionState::RefreshInFlight {
                *state = derived;
                true
            } else {
                false
            }
        });

        if has_newer_credentials {
            Ok(())
        } else {
            Err(RefreshError::MissingRefreshToken)
        }
    }

    fn missing_refresh_token(&self) {
        match *self.state.borrow() {
            SessionState::Authenticated | SessionState::RefreshInFlight => {}
            SessionState::Unauthenticated | SessionState::Expired => {
                tracing::debug!("no refresh token available");
                return;
            }
        }

        tracing::warn!("session lost its refresh token, expiring session");
        self.expire();
    }

    fn expire(&self) {
        if let Err(error) = self.store.clear() {
            tracing::warn!(
                error = (&error as &dyn std::error::Error),
                "unable to fully clear credentials of expired session"
            );
        }

        let previous = self.state.send_replace(SessionState::Expired);
        if previous != SessionState::Expired {
            tracing::info!(?previous, next = ?SessionState::Expired, "session state changed");
            self.navigator.navigate(&self.login_route);
        }
    }
}

/// Empties the in-flight slot when a refresh task finishes or unwinds
struct Retire<'a, B> {
    shared: &'a Shared<B>,
}

impl<B> Drop for Retire<'_, B> {
    fn drop(&mut self) {
        lock(&self.shared.in_flight).take();

        if thread::panicking() {
            tracing::error!("refresh task panicked");
            self.shared.state.send_if_modified(|state| {
                if *state == SessionState::RefreshInFlight {
                    *state = SessionState::Authenticated;
                    true
                } else {
                    false
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tether_clock::{DurationSecs, TestClock, UnixTime};

    use super::*;
    use crate::{
        storage::{MemoryStorage, Storage as _},
        store::{StoredCredentials, REFRESH_TOKEN_KEY},
        testing::{token_expiring_at, MockBackend, RecordingNavigator, Reply},
        AccessToken,
    };

    const NOW: UnixTime = UnixTime(1_700_000_000);

    struct Fixture {
        backend: Arc<MockBackend>,
        store: TokenStore,
        navigator: RecordingNavigator,
        coordinator: RefreshCoordinator<Arc<MockBackend>>,
    }

    fn fixture(backend: MockBackend, stored: Option<(&str, &str)>) -> Fixture {
        let backend = Arc::new(backend);
        let store = TokenStore::new(MemoryStorage::new());
        if let Some((access, refresh)) = stored {
            store
                .set(&CredentialPair {
                    access_token: AccessToken::new(access.to_owned()),
                    refresh_token: RefreshToken::new(refresh.to_owned()),
                    identity: IdentityLabel::from_static("alice"),
                })
                .unwrap();
        }
        let navigator = RecordingNavigator::new();
        let coordinator = RefreshCoordinator::builder(backend.clone(), store.clone())
            .with_clock(TestClock::new(NOW))
            .with_navigator(navigator.clone())
            .build();

        Fixture {
            backend,
            store,
            navigator,
            coordinator,
        }
    }

    fn fresh_token(tag: &str) -> AccessToken {
        token_expiring_at(NOW + DurationSecs(3600), tag)
    }

    #[tokio::test]
    async fn successful_refresh_replaces_access_token_and_keeps_refresh_token() {
        let f = fixture(
            MockBackend::new().with_refresh(Reply::access(fresh_token("A2"))),
            Some(("A1", "R1")),
        );

        f.coordinator.refresh().await.unwrap();

        let stored = f.store.get();
        assert_eq!(stored.access_token, Some(fresh_token("A2")));
        assert_eq!(stored.refresh_token, Some(RefreshToken::from_static("R1")));
        assert_eq!(stored.identity, Some(IdentityLabel::from_static("alice")));
        assert_eq!(f.coordinator.state(), SessionState::Authenticated);
        assert!(!f.coordinator.is_refreshing());
    }

    #[tokio::test]
    async fn rotated_refresh_token_is_stored() {
        let f = fixture(
            MockBackend::new().with_refresh(Reply::pair(
                fresh_token("A2"),
                RefreshToken::from_static("R2"),
            )),
            Some(("A1", "R1")),
        );

        f.coordinator.refresh().await.unwrap();

        assert_eq!(
            f.store.refresh_token(),
            Some(RefreshToken::from_static("R2"))
        );
    }

    mod when_many_callers_refresh_concurrently {
        use super::*;

        #[tokio::test]
        async fn exactly_one_backend_call_is_made() {
            let f = fixture(
                MockBackend::new()
                    .with_held_refreshes()
                    .with_refresh(Reply::access(fresh_token("A2"))),
                Some(("A1", "R1")),
            );

            let callers: Vec<_> = (0..8)
                .map(|_| {
                    let c = f.coordinator.clone();
                    tokio::spawn(async move { c.refresh().await })
                })
                .collect();

            tokio::time::sleep(Duration::from_millis(20)).await;
            assert!(f.coordinator.is_refreshing());
            assert_eq!(f.coordinator.state(), SessionState::RefreshInFlight);
            f.backend.release_refreshes(1);

            for caller in callers {
                caller.await.unwrap().unwrap();
            }

            assert_eq!(f.backend.refresh_calls(), 1);
            assert_eq!(f.store.get().access_token, Some(fresh_token("A2")));
        }

        #[tokio::test]
        async fn every_caller_observes_the_same_failure() {
            let f = fixture(
                MockBackend::new()
                    .with_held_refreshes()
                    .with_refresh(Reply::Reject(401)),
                Some(("A1", "R1")),
            );

            let first = f.coordinator.clone();
            let second = f.coordinator.clone();
            let (a, b, _) = tokio::join!(first.refresh(), second.refresh(), async {
                tokio::time::sleep(Duration::from_millis(10)).await;
                f.backend.release_refreshes(1);
            });

            assert!(matches!(a, Err(RefreshError::Rejected(_))));
            assert!(matches!(b, Err(RefreshError::Rejected(_))));
            assert_eq!(f.backend.refresh_calls(), 1);
            assert_eq!(f.navigator.routes().len(), 1);
        }

        #[tokio::test]
        async fn cancelled_first_caller_does_not_strand_the_others() {
            let f = fixture(
                MockBackend::new()
                    .with_held_refreshes()
                    .with_refresh(Reply::access(fresh_token("A2"))),
                Some(("A1", "R1")),
            );

            let starter = {
                let c = f.coordinator.clone();
                tokio::spawn(async move { c.refresh().await })
            };
            tokio::time::sleep(Duration::from_millis(10)).await;
            starter.abort();

            let waiter = {
                let c = f.coordinator.clone();
                tokio::spawn(async move { c.refresh().await })
            };
            tokio::time::sleep(Duration::from_millis(10)).await;
            f.backend.release_refreshes(1);

            waiter.await.unwrap().unwrap();
            assert_eq!(f.backend.refresh_calls(), 1);
        }
    }

    #[tokio::test]
    async fn refresh_after_completion_starts_a_new_operation() {
        let f = fixture(
            MockBackend::new()
                .with_refresh(Reply::access(fresh_token("A2")))
                .with_refresh(Reply::access(fresh_token("A3"))),
            Some(("A1", "R1")),
        );

        f.coordinator.refresh().await.unwrap();
        f.coordinator.refresh().await.unwrap();

        assert_eq!(f.backend.refresh_calls(), 2);
        assert_eq!(f.store.get().access_token, Some(fresh_token("A3")));
    }

    mod when_refresh_token_is_rejected {
        use super::*;

        #[tokio::test]
        async fn session_expires_and_store_is_cleared() {
            let f = fixture(
                MockBackend::new().with_refresh(Reply::Reject(401)),
                Some(("A1", "R1")),
            );

            let err = f.coordinator.refresh().await.unwrap_err();

            assert!(err.is_terminal());
            assert_eq!(f.coordinator.state(), SessionState::Expired);
            assert!(f.store.get().is_empty());
            assert_eq!(f.navigator.routes(), vec!["/auth/login".to_owned()]);
        }

        #[tokio::test]
        async fn later_refreshes_make_no_backend_call_and_no_second_redirect() {
            let f = fixture(
                MockBackend::new().with_refresh(Reply::Reject(401)),
                Some(("A1", "R1")),
            );
            let _ = f.coordinator.refresh().await;

            let err = f.coordinator.refresh().await.unwrap_err();

            assert!(matches!(err, RefreshError::MissingRefreshToken));
            assert_eq!(f.backend.refresh_calls(), 1);
            assert_eq!(f.navigator.routes().len(), 1);
        }

        #[tokio::test]
        async fn rejected_token_written_back_is_not_presented_again() {
            let f = fixture(
                MockBackend::new().with_refresh(Reply::Reject(401)),
                Some(("A1", "R1")),
            );
            let _ = f.coordinator.refresh().await;

            f.store
                .set(&CredentialPair {
                    access_token: AccessToken::from_static("A1"),
                    refresh_token: RefreshToken::from_static("R1"),
                    identity: IdentityLabel::from_static("alice"),
                })
                .unwrap();

            let err = f.coordinator.refresh().await.unwrap_err();
            assert!(matches!(err, RefreshError::MissingRefreshToken));
            assert_eq!(f.backend.refresh_calls(), 1);
            assert!(f.store.get().is_empty());
        }
    }

    #[tokio::test]
    async fn transient_failure_keeps_credentials() {
        let f = fixture(
            MockBackend::new().with_refresh(Reply::Fail(503)),
            Some(("A1", "R1")),
        );

        let err = f.coordinator.refresh().await.unwrap_err();

        assert!(!err.is_terminal());
        assert!(matches!(err, RefreshError::Backend(_)));
        assert_eq!(f.coordinator.state(), SessionState::Authenticated);
        assert_eq!(f.store.refresh_token(), Some(RefreshToken::from_static("R1")));
        assert!(f.navigator.routes().is_empty());
    }

    #[tokio::test]
    async fn rate_limited_or_timed_out_refresh_keeps_credentials() {
        for status in [408, 429] {
            let f = fixture(
                MockBackend::new().with_refresh(Reply::Fail(status)),
                Some(("A1", "R1")),
            );

            let err = f.coordinator.refresh().await.unwrap_err();

            assert!(!err.is_terminal(), "status {status} ended the session");
            assert_eq!(f.coordinator.state(), SessionState::Authenticated);
            assert_eq!(f.store.get().access_token, Some(AccessToken::from_static("A1")));
            assert_eq!(f.store.refresh_token(), Some(RefreshToken::from_static("R1")));
            assert!(f.navigator.routes().is_empty());
        }
    }

    #[tokio::test]
    async fn unreachable_backend_fails_every_waiter_without_ending_the_session() {
        let f = fixture(
            MockBackend::new()
                .with_held_refreshes()
                .with_refresh(Reply::Unreachable),
            Some(("A1", "R1")),
        );

        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let c = f.coordinator.clone();
                tokio::spawn(async move { c.refresh().await })
            })
            .collect();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(f.coordinator.state(), SessionState::RefreshInFlight);
        f.backend.release_refreshes(1);

        let mut errors = Vec::new();
        for waiter in waiters {
            let err = waiter.await.unwrap().unwrap_err();
            assert!(!err.is_terminal());
            match err {
                RefreshError::Backend(error) => {
                    assert!(matches!(*error, BackendError::Transport(_)));
                    errors.push(error);
                }
                other => panic!("unexpected refresh error: {other:?}"),
            }
        }
        assert!(errors.iter().all(|e| Arc::ptr_eq(e, &errors[0])));
        assert_eq!(f.backend.refresh_calls(), 1);
        assert_eq!(f.coordinator.state(), SessionState::Authenticated);
        assert_eq!(f.store.get().access_token, Some(AccessToken::from_static("A1")));
        assert_eq!(f.store.refresh_token(), Some(RefreshToken::from_static("R1")));
        assert!(f.navigator.routes().is_empty());
        assert!(!f.coordinator.is_refreshing());
    }

    #[tokio::test]
    async fn missing_refresh_token_expires_an_authenticated_session() {
        let f = fixture(MockBackend::new(), Some(("A1", "R1")));
        f.store.clear().unwrap();

        let err = f.coordinator.refresh().await.unwrap_err();

        assert!(matches!(err, RefreshError::MissingRefreshToken));
        assert_eq!(f.backend.refresh_calls(), 0);
        assert_eq!(f.coordinator.state(), SessionState::Expired);
        assert_eq!(f.navigator.routes().len(), 1);
    }

    #[tokio::test]
    async fn refresh_without_any_session_is_a_quiet_failure() {
        let f = fixture(MockBackend::new(), None);

        let err = f.coordinator.refresh().await.unwrap_err();

        assert!(matches!(err, RefreshError::MissingRefreshToken));
        assert_eq!(f.coordinator.state(), SessionState::Unauthenticated);
        assert!(f.navigator.routes().is_empty());
    }

    #[tokio::test]
    async fn refresh_is_eligible_with_only_a_refresh_token() {
        let backend = Arc::new(MockBackend::new().with_refresh(Reply::access(fresh_token("A2"))));
        let storage = MemoryStorage::new();
        storage.set_item(REFRESH_TOKEN_KEY, "R1").unwrap();
        let coordinator = RefreshCoordinator::builder(backend.clone(), TokenStore::new(storage))
            .with_clock(TestClock::new(NOW))
            .build();
        assert_eq!(coordinator.state(), SessionState::Authenticated);

        coordinator.refresh().await.unwrap();

        assert_eq!(coordinator.store().get().access_token, Some(fresh_token("A2")));
        assert_eq!(backend.refreshed_with(), vec![RefreshToken::from_static("R1")]);
    }

    #[tokio::test]
    async fn login_during_refresh_is_not_overwritten() {
        let f = fixture(
            MockBackend::new()
                .with_held_refreshes()
                .with_refresh(Reply::Reject(401)),
            Some(("A1", "R1")),
        );

        let pending = {
            let c = f.coordinator.clone();
            tokio::spawn(async move { c.refresh().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let login = CredentialPair {
            access_token: fresh_token("B1"),
            refresh_token: RefreshToken::from_static("S1"),
            identity: IdentityLabel::from_static("bob"),
        };
        f.store.set(&login).unwrap();
        f.coordinator.logged_in();
        f.backend.release_refreshes(1);

        pending.await.unwrap().unwrap();
        assert_eq!(f.store.get(), StoredCredentials::from(login));
        assert_eq!(f.coordinator.state(), SessionState::Authenticated);
        assert!(f.navigator.routes().is_empty());
    }

    #[tokio::test]
    async fn expired_session_navigates_to_the_configured_login_route() {
        let backend = Arc::new(MockBackend::new().with_refresh(Reply::Reject(403)));
        let storage = MemoryStorage::new();
        storage.set_item(REFRESH_TOKEN_KEY, "R1").unwrap();
        let navigator = RecordingNavigator::new();
        let coordinator = RefreshCoordinator::builder(backend, TokenStore::new(storage))
            .with_config(&SessionConfig::default().with_login_route("/signin"))
            .with_clock(TestClock::new(NOW))
            .with_navigator(navigator.clone())
            .build();

        let err = coordinator.refresh().await.unwrap_err();

        assert!(err.is_terminal());
        assert_eq!(navigator.routes(), vec!["/signin".to_owned()]);
    }

    #[tokio::test]
    async fn state_transitions_are_published() {
        let f = fixture(
            MockBackend::new().with_refresh(Reply::Reject(400)),
            Some(("A1", "R1")),
        );
        let mut states = f.coordinator.subscribe();

        let _ = f.coordinator.refresh().await;

        states.changed().await.unwrap();
        assert_eq!(*states.borrow_and_update(), SessionState::Expired);
    }
}
