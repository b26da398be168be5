//! The token-issuing backend

use std::{error, sync::Arc};

use async_trait::async_trait;
use thiserror::Error;

use crate::{
    store::StoredCredentials, EmailRef, IdentityLabelRef, RefreshTokenRef, SecretRef,
};

pub mod dto;
pub mod http;

pub use dto::{LoginResponse, RefreshResponse};
pub use http::HttpAuthBackend;

/// An error while talking to the backend
#[derive(Debug, Error)]
pub enum BackendError {
    /// The backend refused the credentials presented (400, 401, or 403)
    #[error("backend rejected the request with status {status}: {body}")]
    Rejected {
        /// The HTTP status code
        status: u16,
        /// The body of the error response
        body: String,
    },
    /// The backend failed to handle the request (anything else that is not a success)
    #[error("backend failed with status {status}: {body}")]
    Server {
        /// The HTTP status code
        status: u16,
        /// The body of the error response
        body: String,
    },
    /// Unable to deserialize the response body
    #[error("error deserializing response body from backend")]
    Decode(#[from] serde_json::Error),
    /// Unable to send the request or read the response
    #[error("error communicating with backend")]
    Transport(#[source] Box<dyn error::Error + Send + Sync + 'static>),
}

impl BackendError {
    /// Classifies a non-success status code
    ///
    /// Only 400, 401, and 403 refuse the credentials themselves. Any other
    /// status, including 408 and 429, is treated as a passing failure.
    pub fn from_status(status: u16, body: impl Into<String>) -> Self {
        let body = body.into();
        if matches!(status, 400 | 401 | 403) {
            Self::Rejected { status, body }
        } else {
            Self::Server { status, body }
        }
    }

    /// Whether the backend explicitly refused the credentials presented
    ///
    /// Rejections are final; every other error may clear up on its own.
    pub fn is_rejection(&self) -> bool {
        matches!(self, Self::Rejected { .. })
    }
}

/// The operations offered by the token-issuing backend
#[async_trait]
pub trait AuthBackend: Send + Sync {
    /// Exchanges an identity and secret for a credential pair
    async fn login(
        &self,
        identity: &IdentityLabelRef,
        secret: &SecretRef,
    ) -> Result<LoginResponse, BackendError>;

    /// Exchanges a refresh token for a new access token
    async fn refresh(&self, refresh_token: &RefreshTokenRef)
        -> Result<RefreshResponse, BackendError>;

    /// Tells the backend the session is over
    async fn logout(&self, credentials: &StoredCredentials) -> Result<(), BackendError>;

    /// Creates a new account
    async fn register(
        &self,
        identity: &IdentityLabelRef,
        email: &EmailRef,
        secret: &SecretRef,
    ) -> Result<(), BackendError>;
}

#[async_trait]
impl<B: AuthBackend + ?Sized> AuthBackend for Arc<B> {
    async fn login(
        &self,
        identity: &IdentityLabelRef,
        secret: &SecretRef,
    ) -> Result<LoginResponse, BackendError> {
        (**self).login(identity, secret).await
    }

    async fn refresh(
        &self,
        refresh_token: &RefreshTokenRef,
    ) -> Result<RefreshResponse, BackendError> {
        (**self).refresh(refresh_token).await
    }

    async fn logout(&self, credentials: &StoredCredentials) -> Result<(), BackendError> {
        (**self).logout(credentials).await
    }

    async fn register(
        &self,
        identity: &IdentityLabelRef,
        email: &EmailRef,
        secret: &SecretRef,
    ) -> Result<(), BackendError> {
        (**self).register(identity, email, secret).await
    }
}
