//! Client-side session management with single-flight token refresh
//!
//! This library keeps a short-lived access token and a long-lived refresh
//! token usable for the lifetime of a client session. Credentials live in a
//! plain key/value [`Storage`][storage::Storage] area that other processes
//! may share and modify, so every decision is re-derived from what is read
//! rather than from cached state.
//!
//! The heart of the crate is the [`RefreshCoordinator`]. However many
//! requests, views, and background tasks notice at the same moment that the
//! access token is about to expire, only one refresh call reaches the
//! backend, and every one of them observes its outcome. When the backend
//! refuses to refresh, the session is expired: stored credentials are
//! cleared and the application is sent to its login route exactly once.
//!
//! Consumers rarely talk to the coordinator directly. The [`Session`]
//! facade handles login, logout, and registration, a [`SessionGuard`]
//! protects views, and the `tether_reqwest` crate attaches credentials to
//! outbound requests.
//!
//! ```no_run
//! use tether_session::{
//!     config::SessionConfig, storage::MemoryStorage, store::TokenStore, IdentityLabel, Secret,
//!     Session,
//! };
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = SessionConfig::new("https://chat.example.com/api/");
//! let session = Session::builder_from_config(config, TokenStore::new(MemoryStorage::new()))?
//!     .with_navigator(|route: &str| println!("navigating to {route}"))
//!     .build();
//!
//! session
//!     .login(&IdentityLabel::from_static("alice"), &Secret::from_static("pw"))
//!     .await?;
//!
//! let conversations = session
//!     .guard()
//!     .gate(|| async { "showing conversations" })
//!     .await;
//! # let _ = conversations;
//! # Ok(())
//! # }
//! ```
//!
//! # Features
//!
//! * `file` (default): Provides [`FileStorage`][storage::FileStorage], which
//!   persists credentials in a directory on the local filesystem.
//! * `testing`: Exposes in-process test doubles for the backend and
//!   navigator in the [`testing`] module.

#![cfg_attr(docsrs, feature(doc_cfg))]
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

pub mod backend;
mod braids;
pub mod config;
pub mod coordinator;
pub mod expiry;
pub mod guard;
pub mod navigator;
pub mod session;
pub mod storage;
pub mod store;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use braids::*;
pub use coordinator::{RefreshCoordinator, RefreshError, SessionState};
pub use guard::{Access, GuardActivation, SessionGuard};
pub use navigator::Navigator;
pub use session::{Session, SessionError};
