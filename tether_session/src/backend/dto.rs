//! DTOs for interacting with the token-issuing backend

use serde::{Deserialize, Serialize};

use crate::{AccessToken, EmailRef, IdentityLabelRef, RefreshToken, RefreshTokenRef, SecretRef};

#[derive(Debug, Serialize)]
pub(super) struct LoginRequest<'a> {
    pub username: &'a IdentityLabelRef,
    pub password: &'a SecretRef,
}

#[derive(Debug, Serialize)]
pub(super) struct RefreshRequest<'a> {
    pub refresh_token: &'a RefreshTokenRef,
}

#[derive(Debug, Serialize)]
pub(super) struct LogoutRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<&'a RefreshTokenRef>,
}

#[derive(Debug, Serialize)]
pub(super) struct RegisterRequest<'a> {
    pub username: &'a IdentityLabelRef,
    pub email: &'a EmailRef,
    pub password: &'a SecretRef,
}

/// Tokens issued in exchange for a successful login
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct LoginResponse {
    /// The new access token
    pub access_token: AccessToken,
    /// The new refresh token
    pub refresh_token: RefreshToken,
}

/// Tokens issued in exchange for a refresh token
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct RefreshResponse {
    /// The new access token
    pub access_token: AccessToken,
    /// A replacement refresh token, when the backend rotates them
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<RefreshToken>,
}
