//! Persistence of the credential pair

use std::{fmt, sync::Arc};

use thiserror::Error;

use crate::{
    storage::{Storage, StorageError},
    AccessToken, AccessTokenRef, IdentityLabel, IdentityLabelRef, RefreshToken, RefreshTokenRef,
};

/// Storage key of the access token
pub const ACCESS_TOKEN_KEY: &str = "access_token";
/// Storage key of the refresh token
pub const REFRESH_TOKEN_KEY: &str = "refresh_token";
/// Storage key of the identity label
pub const IDENTITY_KEY: &str = "username";

/// A complete set of credentials for an authenticated session
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CredentialPair {
    /// The short-lived access token
    pub access_token: AccessToken,
    /// The long-lived refresh token
    pub refresh_token: RefreshToken,
    /// The label the user logged in with
    pub identity: IdentityLabel,
}

/// Credentials as read back from storage
///
/// Any field may be missing: storage offers no multi-key transactions, so a
/// read can interleave with another writer.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StoredCredentials {
    /// The stored access token, if any
    pub access_token: Option<AccessToken>,
    /// The stored refresh token, if any
    pub refresh_token: Option<RefreshToken>,
    /// The stored identity label, if any
    pub identity: Option<IdentityLabel>,
}

impl StoredCredentials {
    /// Whether nothing at all is stored
    pub fn is_empty(&self) -> bool {
        self.access_token.is_none() && self.refresh_token.is_none() && self.identity.is_none()
    }

    /// The stored access token
    pub fn access_token(&self) -> Option<&AccessTokenRef> {
        self.access_token.as_deref()
    }

    /// The stored refresh token
    pub fn refresh_token(&self) -> Option<&RefreshTokenRef> {
        self.refresh_token.as_deref()
    }

    /// The stored identity label
    pub fn identity(&self) -> Option<&IdentityLabelRef> {
        self.identity.as_deref()
    }
}

impl From<CredentialPair> for StoredCredentials {
    fn from(pair: CredentialPair) -> Self {
        Self {
            access_token: Some(pair.access_token),
            refresh_token: Some(pair.refresh_token),
            identity: Some(pair.identity),
        }
    }
}

/// An error writing credentials to storage
#[derive(Debug, Error)]
#[error("unable to update `{key}` in credential storage")]
pub struct StoreError {
    key: &'static str,
    #[source]
    source: StorageError,
}

impl StoreError {
    /// The storage key that could not be updated
    pub fn key(&self) -> &'static str {
        self.key
    }
}

/// Reads and writes the credential pair in a shared [`Storage`]
///
/// Clones refer to the same storage area.
#[derive(Clone)]
pub struct TokenStore {
    storage: Arc<dyn Storage>,
}

impl fmt::Debug for TokenStore {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TokenStore").finish_non_exhaustive()
    }
}

impl TokenStore {
    /// Constructs a token store over a storage area
    pub fn new(storage: impl Storage + 'static) -> Self {
        Self {
            storage: Arc::new(storage),
        }
    }

    /// Constructs a token store over a shared storage area
    pub fn from_shared(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    fn read(&self, key: &'static str) -> Option<String> {
        match self.storage.get_item(key) {
            Ok(value) => value.filter(|v| !v.is_empty()),
            Err(error) => {
                tracing::warn!(
                    key,
                    error = (&*error as &dyn std::error::Error),
                    "unable to read credential storage, treating key as absent"
                );
                None
            }
        }
    }

    fn write(&self, key: &'static str, value: &str) -> Result<(), StoreError> {
        self.storage
            .set_item(key, value)
            .map_err(|source| StoreError { key, source })
    }

    fn remove(&self, key: &'static str) -> Result<(), StoreError> {
        self.storage
            .remove_item(key)
            .map_err(|source| StoreError { key, source })
    }

    /// Reads the currently stored credentials
    pub fn get(&self) -> StoredCredentials {
        StoredCredentials {
            access_token: self.read(ACCESS_TOKEN_KEY).map(AccessToken::new),
            refresh_token: self.read(REFRESH_TOKEN_KEY).map(RefreshToken::new),
            identity: self.read(IDENTITY_KEY).map(IdentityLabel::new),
        }
    }

    /// Reads the stored refresh token
    pub fn refresh_token(&self) -> Option<RefreshToken> {
        self.read(REFRESH_TOKEN_KEY).map(RefreshToken::new)
    }

    /// Reads the stored identity label
    pub fn identity(&self) -> Option<IdentityLabel> {
        self.read(IDENTITY_KEY).map(IdentityLabel::new)
    }

    /// Stores a complete credential pair
    ///
    /// Keys are written access token first and identity last, so a concurrent
    /// reader sees at worst a fresh access token next to an older refresh
    /// token, which remains refreshable.
    pub fn set(&self, pair: &CredentialPair) -> Result<(), StoreError> {
        self.write(ACCESS_TOKEN_KEY, pair.access_token.as_str())?;
        self.write(REFRESH_TOKEN_KEY, pair.refresh_token.as_str())?;
        self.write(IDENTITY_KEY, pair.identity.as_str())?;
        tracing::trace!("stored credential pair");
        Ok(())
    }

    /// Removes all stored credentials
    ///
    /// Keys are removed in the reverse of the order [`set()`][Self::set()]
    /// writes them. Every key is attempted; the first failure is returned.
    pub fn clear(&self) -> Result<(), StoreError> {
        let mut first_error = None;
        for key in [IDENTITY_KEY, REFRESH_TOKEN_KEY, ACCESS_TOKEN_KEY] {
            if let Err(error) = self.remove(key) {
                tracing::warn!(
                    key,
                    error = (&error as &dyn std::error::Error),
                    "unable to remove credential"
                );
                first_error.get_or_insert(error);
            }
        }

        match first_error {
            Some(error) => Err(error),
            None => {
                tracing::trace!("cleared credentials");
                Ok(())
            }
        }
    }
}
