//! Session configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tether_clock::DurationSecs;

use crate::expiry::PROACTIVE_REFRESH_THRESHOLD;

/// Configuration for talking to the token-issuing backend and for routing
///
/// Deserializable with every field optional, falling back to the defaults.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct SessionConfig {
    base_url: String,
    login_path: String,
    refresh_path: String,
    logout_path: String,
    register_path: String,
    proactive_threshold: DurationSecs,
    request_timeout: DurationSecs,
    login_route: String,
}

impl Default for SessionConfig {
    /// Default session configuration
    ///
    /// Talks to a backend at `http://localhost:8000/api/`, refreshes tokens
    /// with five minutes or less remaining, and gives backend calls 30 seconds
    /// to complete.
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000/api/".to_owned(),
            login_path: "login/".to_owned(),
            refresh_path: "refresh/".to_owned(),
            logout_path: "logout/".to_owned(),
            register_path: "register/".to_owned(),
            proactive_threshold: PROACTIVE_REFRESH_THRESHOLD,
            request_timeout: DurationSecs(30),
            login_route: "/auth/login".to_owned(),
        }
    }
}

impl SessionConfig {
    /// Constructs a configuration for the backend at `base_url`
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::default().with_base_url(base_url)
    }

    /// Sets the backend base URL
    ///
    /// Endpoint paths are resolved relative to it, so it should usually end
    /// with a `/`.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Sets the endpoint paths used for login, refresh, logout, and registration
    pub fn with_endpoints(
        mut self,
        login: impl Into<String>,
        refresh: impl Into<String>,
        logout: impl Into<String>,
        register: impl Into<String>,
    ) -> Self {
        self.login_path = login.into();
        self.refresh_path = refresh.into();
        self.logout_path = logout.into();
        self.register_path = register.into();
        self
    }

    /// Sets how close to expiry an access token may get before being refreshed
    pub fn with_proactive_threshold(mut self, threshold: DurationSecs) -> Self {
        self.proactive_threshold = threshold;
        self
    }

    /// Sets the timeout applied to every backend call
    pub fn with_request_timeout(mut self, timeout: DurationSecs) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Sets the route the application is sent to when a new login is required
    pub fn with_login_route(mut self, route: impl Into<String>) -> Self {
        self.login_route = route.into();
        self
    }

    /// The backend base URL
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// The login endpoint path
    pub fn login_path(&self) -> &str {
        &self.login_path
    }

    /// The refresh endpoint path
    pub fn refresh_path(&self) -> &str {
        &self.refresh_path
    }

    /// The logout endpoint path
    pub fn logout_path(&self) -> &str {
        &self.logout_path
    }

    /// The registration endpoint path
    pub fn register_path(&self) -> &str {
        &self.register_path
    }

    /// The proactive refresh threshold
    pub fn proactive_threshold(&self) -> DurationSecs {
        self.proactive_threshold
    }

    /// The backend call timeout
    pub fn request_timeout(&self) -> Duration {
        self.request_timeout.into()
    }

    /// The unauthenticated entry point
    pub fn login_route(&self) -> &str {
        &self.login_route
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let config: SessionConfig = serde_json::from_str(
            r#"{ "base_url": "https://chat.example.com/api/", "proactive_threshold": 120 }"#,
        )
        .unwrap();

        assert_eq!(config.base_url(), "https://chat.example.com/api/");
        assert_eq!(config.proactive_threshold(), DurationSecs(120));
        assert_eq!(config.refresh_path(), "refresh/");
        assert_eq!(config.login_route(), "/auth/login");
        assert_eq!(config.request_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn login_route_can_be_overridden() {
        let config = SessionConfig::default().with_login_route("/signin");
        assert_eq!(config.login_route(), "/signin");
    }

    #[test]
    fn default_threshold_is_five_minutes() {
        assert_eq!(
            SessionConfig::default().proactive_threshold(),
            DurationSecs(300)
        );
    }
}
