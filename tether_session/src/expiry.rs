//! Expiry prediction for access tokens
//!
//! Access tokens are treated as opaque bearer credentials, except that their
//! payload is peeked at to learn when they expire. The signature is never
//! checked here; the server remains the final authority on validity.

use base64::{
    alphabet,
    engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig},
    Engine as _,
};
use serde::Deserialize;
use tether_clock::{Clock, DurationSecs, System, UnixTime};

use crate::AccessTokenRef;

/// How close to expiry a token may get before it is proactively refreshed
pub const PROACTIVE_REFRESH_THRESHOLD: DurationSecs = DurationSecs(300);

const PAYLOAD_ENGINE: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

macro_rules! expect_three {
    ($iter:expr) => {{
        let mut i = $iter;
        match (i.next(), i.next(), i.next(), i.next()) {
            (Some(first), Some(second), Some(third), None) => Some((first, second, third)),
            _ => None,
        }
    }};
}

/// The claims of an access token that matter to the client
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TokenClaims {
    expiry: UnixTime,
    issued_at: Option<UnixTime>,
    subject: Option<String>,
}

#[derive(Deserialize)]
struct RawClaims {
    #[serde(default)]
    exp: Option<serde_json::Number>,
    #[serde(default)]
    iat: Option<serde_json::Number>,
    #[serde(default)]
    sub: Option<serde_json::Value>,
}

fn as_unix_time(n: &serde_json::Number) -> Option<UnixTime> {
    n.as_u64()
        .or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64))
        .map(UnixTime)
}

impl TokenClaims {
    /// Decodes the claims of a compact JWT without verifying it
    ///
    /// Returns `None` when the token is not made of three dot-separated
    /// segments, the payload is not base64url-encoded JSON, or the payload
    /// has no usable `exp` claim.
    pub fn decode(token: &AccessTokenRef) -> Option<Self> {
        let (_header, payload, _signature) = expect_three!(token.as_str().split('.'))?;
        let raw = PAYLOAD_ENGINE.decode(payload).ok()?;
        let claims: RawClaims = serde_json::from_slice(&raw).ok()?;

        Some(Self {
            expiry: as_unix_time(claims.exp.as_ref()?)?,
            issued_at: claims.iat.as_ref().and_then(as_unix_time),
            subject: claims.sub.map(|s| match s {
                serde_json::Value::String(s) => s,
                other => other.to_string(),
            }),
        })
    }

    /// The instant the token expires
    #[inline]
    pub fn expiry(&self) -> UnixTime {
        self.expiry
    }

    /// The instant the token was issued, if stated
    #[inline]
    pub fn issued_at(&self) -> Option<UnixTime> {
        self.issued_at
    }

    /// The subject of the token, if stated
    #[inline]
    pub fn subject(&self) -> Option<&str> {
        self.subject.as_deref()
    }
}

/// Decides how long an access token remains usable and when to refresh it
#[derive(Clone, Debug)]
pub struct ExpiryPredictor<C = System> {
    threshold: DurationSecs,
    clock: C,
}

impl Default for ExpiryPredictor {
    /// Uses the system clock and a five minute proactive threshold
    fn default() -> Self {
        Self {
            threshold: PROACTIVE_REFRESH_THRESHOLD,
            clock: System,
        }
    }
}

impl ExpiryPredictor {
    /// Constructs a predictor using the system clock
    pub fn new(threshold: DurationSecs) -> Self {
        Self {
            threshold,
            clock: System,
        }
    }
}

impl<C> ExpiryPredictor<C> {
    /// Sets a custom clock to be used
    ///
    /// Useful for testing purposes
    pub fn with_clock<D>(self, clock: D) -> ExpiryPredictor<D> {
        ExpiryPredictor {
            threshold: self.threshold,
            clock,
        }
    }

    /// Sets the proactive refresh threshold
    pub fn with_threshold(self, threshold: DurationSecs) -> Self {
        Self { threshold, ..self }
    }

    /// The configured proactive refresh threshold
    #[inline]
    pub fn threshold(&self) -> DurationSecs {
        self.threshold
    }
}

impl<C: Clock> ExpiryPredictor<C> {
    /// Seconds until the token expires
    ///
    /// Zero or negative when the token has expired or cannot be decoded.
    pub fn seconds_remaining(&self, token: &AccessTokenRef) -> i64 {
        match TokenClaims::decode(token) {
            Some(claims) => self.clock.now().seconds_until(claims.expiry()),
            None => 0,
        }
    }

    /// Whether the token is still usable right now
    #[inline]
    pub fn is_usable(&self, token: &AccessTokenRef) -> bool {
        self.seconds_remaining(token) > 0
    }

    /// Whether the token is within the configured threshold of expiring
    #[inline]
    pub fn needs_proactive_refresh(&self, token: &AccessTokenRef) -> bool {
        self.needs_refresh_within(token, self.threshold)
    }

    /// Whether the token expires within `threshold`
    pub fn needs_refresh_within(&self, token: &AccessTokenRef, threshold: DurationSecs) -> bool {
        let remaining = self.seconds_remaining(token);
        remaining <= i64::try_from(threshold.0).unwrap_or(i64::MAX)
    }
}
