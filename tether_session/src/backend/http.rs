//! A backend reached over HTTP with JSON bodies

use async_trait::async_trait;
use reqwest::Url;
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

use super::{dto, AuthBackend, BackendError, LoginResponse, RefreshResponse};
use crate::{
    config::SessionConfig, store::StoredCredentials, AccessTokenRef, EmailRef, IdentityLabelRef,
    RefreshTokenRef, SecretRef,
};

/// An error in the backend configuration
#[derive(Debug, Error)]
pub enum BackendConfigError {
    /// A configured URL could not be parsed
    #[error("invalid backend URL `{url}`: {reason}")]
    InvalidUrl {
        /// The offending URL or path
        url: String,
        /// Why it was refused
        reason: String,
    },
    /// The HTTP client could not be constructed
    #[error("unable to construct HTTP client")]
    Client(#[source] reqwest::Error),
}

/// Talks to the token-issuing backend over HTTP
#[derive(Clone, Debug)]
pub struct HttpAuthBackend {
    client: reqwest::Client,
    login_url: Url,
    refresh_url: Url,
    logout_url: Url,
    register_url: Url,
}

fn join(base: &Url, path: &str) -> Result<Url, BackendConfigError> {
    base.join(path).map_err(|e| BackendConfigError::InvalidUrl {
        url: path.to_owned(),
        reason: e.to_string(),
    })
}

fn transport(error: reqwest::Error) -> BackendError {
    BackendError::Transport(Box::new(error))
}

impl HttpAuthBackend {
    /// Constructs a backend from configuration, using a dedicated HTTP client
    ///
    /// The client applies the configured request timeout, which is what
    /// eventually fails a refresh that would otherwise hang.
    pub fn from_config(config: &SessionConfig) -> Result<Self, BackendConfigError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(BackendConfigError::Client)?;
        Self::with_client(client, config)
    }

    /// Constructs a backend from configuration, using the provided HTTP client
    pub fn with_client(
        client: reqwest::Client,
        config: &SessionConfig,
    ) -> Result<Self, BackendConfigError> {
        let base = Url::parse(config.base_url()).map_err(|e| BackendConfigError::InvalidUrl {
            url: config.base_url().to_owned(),
            reason: e.to_string(),
        })?;

        Ok(Self {
            client,
            login_url: join(&base, config.login_path())?,
            refresh_url: join(&base, config.refresh_path())?,
            logout_url: join(&base, config.logout_path())?,
            register_url: join(&base, config.register_path())?,
        })
    }

    async fn post<P: Serialize + ?Sized>(
        &self,
        url: &Url,
        bearer: Option<&AccessTokenRef>,
        payload: &P,
    ) -> Result<reqwest::Response, BackendError> {
        let mut req = self.client.post(url.clone()).json(payload);
        if let Some(token) = bearer {
            req = req.bearer_auth(token.as_str());
        }

        let resp = req.send().await.map_err(transport)?;

        tracing::debug!(
            response.status = resp.status().as_u16(),
            "received response from backend"
        );

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.map_err(transport)?;
            return Err(BackendError::from_status(status.as_u16(), body));
        }

        Ok(resp)
    }

    async fn post_for<T: DeserializeOwned, P: Serialize + ?Sized>(
        &self,
        url: &Url,
        payload: &P,
    ) -> Result<T, BackendError> {
        let resp = self.post(url, None, payload).await?;
        let body = resp.bytes().await.map_err(transport)?;
        Ok(serde_json::from_slice(&body)?)
    }
}

#[async_trait]
impl AuthBackend for HttpAuthBackend {
    #[tracing::instrument(err, skip(self, secret), fields(url = %self.login_url))]
    async fn login(
        &self,
        identity: &IdentityLabelRef,
        secret: &SecretRef,
    ) -> Result<LoginResponse, BackendError> {
        tracing::trace!("requesting credentials from backend");
        let request = dto::LoginRequest {
            username: identity,
            password: secret,
        };
        self.post_for(&self.login_url, &request).await
    }

    #[tracing::instrument(err, skip(self, refresh_token), fields(url = %self.refresh_url))]
    async fn refresh(
        &self,
        refresh_token: &RefreshTokenRef,
    ) -> Result<RefreshResponse, BackendError> {
        tracing::trace!("requesting refreshed credentials from backend");
        let request = dto::RefreshRequest { refresh_token };
        let resp: RefreshResponse = self.post_for(&self.refresh_url, &request).await?;

        tracing::info!(
            rotated_refresh_token = resp.refresh_token.is_some(),
            "received refreshed tokens"
        );

        Ok(resp)
    }

    #[tracing::instrument(err, skip(self, credentials), fields(url = %self.logout_url))]
    async fn logout(&self, credentials: &StoredCredentials) -> Result<(), BackendError> {
        let request = dto::LogoutRequest {
            refresh_token: credentials.refresh_token(),
        };
        self.post(&self.logout_url, credentials.access_token(), &request)
            .await?;
        Ok(())
    }

    #[tracing::instrument(err, skip(self, email, secret), fields(url = %self.register_url))]
    async fn register(
        &self,
        identity: &IdentityLabelRef,
        email: &EmailRef,
        secret: &SecretRef,
    ) -> Result<(), BackendError> {
        let request = dto::RegisterRequest {
            username: identity,
            email,
            password: secret,
        };
        self.post(&self.register_url, None, &request).await?;
        Ok(())
    }
}
