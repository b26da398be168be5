//! Middleware to authorize outgoing requests with a refreshable session
//!
//! When using [`ClientWithMiddleware`](reqwest_middleware::ClientWithMiddleware),
//! include the [`AuthenticationMiddleware`] in the middleware stack to attach
//! the session's current access token to each outbound request.
//!
//! Before a request is sent, an access token that is missing or close to
//! expiry is refreshed. If the server still answers `401 Unauthorized`, the
//! request is retried a single time. When another request has already
//! replaced the token that was sent, the retry uses the stored token as is;
//! otherwise the token is refreshed once more first.
//! Concurrent requests share refreshes: however many requests need one at
//! the same moment, only one refresh call is made.
//!
//! If a request already has specified an `Authorization` header value by
//! the time that the middleware executes, the existing value will be left
//! in place, allowing overrides to be specified as required.
//!
//! ```no_run
//! use reqwest::Client;
//! use reqwest_middleware::ClientBuilder;
//! use tether_reqwest::AuthenticationMiddleware;
//! use tether_session::{
//!     config::SessionConfig, storage::MemoryStorage, store::TokenStore, Session,
//! };
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = SessionConfig::new("https://chat.example.com/api/");
//! let session =
//!     Session::builder_from_config(config, TokenStore::new(MemoryStorage::new()))?.build();
//!
//! let client = ClientBuilder::new(Client::default())
//!     .with(AuthenticationMiddleware::from_session(&session)?)
//!     .build();
//!
//! let resp = client
//!     .get("https://chat.example.com/api/conversations/")
//!     .send()
//!     .await?;
//! # let _ = resp;
//! # Ok(())
//! # }
//! ```
//!
//! By default, credentials are only attached to requests sent to the same
//! origin as the session's backend. A custom predicate can be provided with
//! [`with_predicate()`][AuthenticationMiddleware::with_predicate()].

#![warn(
    missing_docs,
    unused_import_braces,
    unused_imports,
    unused_qualifications
)]
#![deny(
    missing_debug_implementations,
    trivial_numeric_casts,
    unsafe_code,
    unused_must_use
)]

use std::fmt;

use bytes::{BufMut, BytesMut};
use predicates::{prelude::*, reflection};
use reqwest::{header, Request, Response, StatusCode, Url};
use reqwest_middleware::{Middleware, Next, Result};
use tether_session::{
    backend::{http::BackendConfigError, AuthBackend},
    AccessToken, AccessTokenRef, RefreshCoordinator, Session,
};

/// A middleware that authorizes outgoing requests with the session's access token
pub struct AuthenticationMiddleware<B, P = SameOrigin> {
    coordinator: RefreshCoordinator<B>,
    predicate: P,
}

impl<B, P: Clone> Clone for AuthenticationMiddleware<B, P> {
    fn clone(&self) -> Self {
        Self {
            coordinator: self.coordinator.clone(),
            predicate: self.predicate.clone(),
        }
    }
}

impl<B, P: fmt::Debug> fmt::Debug for AuthenticationMiddleware<B, P> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("AuthenticationMiddleware")
            .field("coordinator", &self.coordinator)
            .field("predicate", &self.predicate)
            .finish()
    }
}

impl<B> AuthenticationMiddleware<B, SameOrigin> {
    /// Construct a new middleware from a refresh coordinator
    ///
    /// By default, this middleware will only send credentials to the origin
    /// of `backend`. To change this behavior, provide a custom predicate
    /// with [`with_predicate()`][Self::with_predicate()].
    pub fn new(coordinator: RefreshCoordinator<B>, backend: &Url) -> Self {
        Self {
            coordinator,
            predicate: SameOrigin::new(backend),
        }
    }

    /// Construct a new middleware for a session
    ///
    /// Credentials are only sent to the origin of the session's backend.
    pub fn from_session(session: &Session<B>) -> std::result::Result<Self, BackendConfigError> {
        let base_url = session.config().base_url();
        let backend = Url::parse(base_url).map_err(|e| BackendConfigError::InvalidUrl {
            url: base_url.to_owned(),
            reason: e.to_string(),
        })?;

        Ok(Self::new(session.coordinator().clone(), &backend))
    }

    /// Replaces the default predicate with a custom predicate
    pub fn with_predicate<P>(self, predicate: P) -> AuthenticationMiddleware<B, P> {
        AuthenticationMiddleware {
            coordinator: self.coordinator,
            predicate,
        }
    }
}

fn bearer(token: &AccessTokenRef) -> Option<header::HeaderValue> {
    let mut header_value = BytesMut::with_capacity(token.as_str().len() + 7);
    header_value.put_slice(b"Bearer ");
    header_value.put_slice(token.as_str().as_bytes());

    let mut value = header::HeaderValue::from_maybe_shared(header_value.freeze()).ok()?;
    value.set_sensitive(true);
    Some(value)
}

impl<B: AuthBackend + 'static, P> AuthenticationMiddleware<B, P> {
    async fn refresh_if_needed(&self) {
        let stored = self.coordinator.store().get();
        if stored.refresh_token.is_none() {
            return;
        }

        let needs_refresh = match stored.access_token() {
            Some(token) => {
                let predictor = self.coordinator.predictor();
                tracing::trace!(
                    token.until_expired = predictor.seconds_remaining(token),
                    "read access token"
                );
                predictor.needs_proactive_refresh(token)
            }
            None => true,
        };

        if needs_refresh {
            tracing::debug!("access token missing or near expiry, refreshing before sending");
            if let Err(error) = self.coordinator.refresh().await {
                tracing::debug!(
                    error = (&error as &dyn std::error::Error),
                    "unable to refresh before sending, using remaining credentials"
                );
            }
        }
    }

    /// Attaches the stored access token, returning the token attached
    fn authorize(&self, req: &mut Request) -> Option<AccessToken> {
        let token = self.coordinator.store().get().access_token;
        let value = token.as_deref().and_then(|token| {
            let value = bearer(token);
            if value.is_none() {
                tracing::warn!("stored access token is not a valid header value");
            }
            value
        });

        match value {
            Some(value) => {
                req.headers_mut().insert(header::AUTHORIZATION, value);
                token
            }
            None => {
                req.headers_mut().remove(header::AUTHORIZATION);
                None
            }
        }
    }

    /// Whether the store now holds a usable token other than the one sent
    fn replaced_since(&self, attached: Option<&AccessTokenRef>) -> bool {
        let stored = self.coordinator.store().get();
        stored.access_token().is_some_and(|current| {
            attached != Some(current) && self.coordinator.predictor().is_usable(current)
        })
    }
}

#[async_trait::async_trait]
impl<B, P> Middleware for AuthenticationMiddleware<B, P>
where
    B: AuthBackend + 'static,
    P: Predicate<Request> + Send + Sync + 'static,
{
    async fn handle(
        &self,
        mut req: Request,
        extensions: &mut http::Extensions,
        next: Next<'_>,
    ) -> Result<Response> {
        if req.headers().contains_key(header::AUTHORIZATION) {
            tracing::trace!("request already carries authorization, leaving it in place");
            return next.run(req, extensions).await;
        }

        if !self.predicate.eval(&req) {
            return next.run(req, extensions).await;
        }

        self.refresh_if_needed().await;
        let attached = self.authorize(&mut req);

        let retry = req.try_clone();
        let resp = next.clone().run(req, extensions).await?;

        if resp.status() != StatusCode::UNAUTHORIZED {
            return Ok(resp);
        }

        let Some(mut retry) = retry else {
            tracing::debug!("unauthorized request cannot be replayed, returning response");
            return Ok(resp);
        };

        if self.replaced_since(attached.as_deref()) {
            tracing::debug!("credentials were replaced while the request was in flight, retrying");
            self.authorize(&mut retry);
            return next.run(retry, extensions).await;
        }

        match self.coordinator.refresh().await {
            Ok(()) => {
                tracing::debug!("retrying unauthorized request with refreshed credentials");
                self.authorize(&mut retry);
                next.run(retry, extensions).await
            }
            Err(error) => {
                tracing::debug!(
                    error = (&error as &dyn std::error::Error),
                    "unable to refresh after unauthorized response"
                );
                Ok(resp)
            }
        }
    }
}

/// Only attach credentials if the request is being sent to the given origin
///
/// Two URLs share an origin when their scheme, host, and port all match,
/// with default ports filled in for well-known schemes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SameOrigin {
    scheme: String,
    host: Option<String>,
    port: Option<u16>,
}

impl SameOrigin {
    /// Construct a new predicate from the origin of `url`
    pub fn new(url: &Url) -> Self {
        Self {
            scheme: url.scheme().to_owned(),
            host: url.host_str().map(str::to_owned),
            port: url.port_or_known_default(),
        }
    }

    fn matches(&self, url: &Url) -> bool {
        url.scheme() == self.scheme
            && url.host_str() == self.host.as_deref()
            && url.port_or_known_default() == self.port
    }
}

impl Predicate<Request> for SameOrigin {
    #[inline]
    fn eval(&self, req: &Request) -> bool {
        self.matches(req.url())
    }

    fn find_case(&self, expected: bool, req: &Request) -> Option<reflection::Case> {
        let result = self.eval(req);
        if result != expected {
            Some(
                reflection::Case::new(Some(self), result).add_product(reflection::Product::new(
                    "origin",
                    req.url().origin().ascii_serialization(),
                )),
            )
        } else {
            None
        }
    }
}

impl reflection::PredicateReflection for SameOrigin {}
impl fmt::Display for SameOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "origin == {}://", self.scheme)?;
        if let Some(host) = &self.host {
            f.write_str(host)?;
        }
        if let Some(port) = self.port {
            write!(f, ":{}", port)?;
        }
        Ok(())
    }
}
