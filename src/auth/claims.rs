//! Access-token claim decoding and expiry helpers.
//!
//! Tokens are decoded without signature verification: they arrive over TLS
//! straight from the issuing authority and are only inspected locally for
//! scopes, identity and expiry.

use crate::error::AuthError;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::Deserialize;
use serde_json::{Map, Value};

/// Claims carried in an Entra ID access token payload.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct DecodedClaims {
    /// Audience (resource the token is for).
    #[serde(default, deserialize_with = "string_or_first")]
    pub aud: Option<String>,
    /// Subject.
    pub sub: Option<String>,
    /// Issuer.
    pub iss: Option<String>,
    /// Tenant id.
    pub tid: Option<String>,
    /// Object id of the signed-in user.
    pub oid: Option<String>,
    pub upn: Option<String>,
    pub preferred_username: Option<String>,
    pub unique_name: Option<String>,
    pub name: Option<String>,
    /// Space-delimited delegated scopes.
    pub scp: Option<String>,
    /// Expiry, seconds since the epoch.
    pub exp: Option<i64>,
    /// Issued at, seconds since the epoch.
    pub iat: Option<i64>,
    /// Everything else in the payload.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl DecodedClaims {
    /// The `scp` claim split on whitespace.
    pub fn scopes(&self) -> Vec<&str> {
        self.scp
            .as_deref()
            .map(|s| s.split_whitespace().collect())
            .unwrap_or_default()
    }

    /// Best available user name: `upn`, then `preferred_username`, then `unique_name`.
    pub fn username(&self) -> Option<&str> {
        self.upn
            .as_deref()
            .or(self.preferred_username.as_deref())
            .or(self.unique_name.as_deref())
    }

    /// Expiry as a timestamp.
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.exp.and_then(|exp| Utc.timestamp_opt(exp, 0).single())
    }

    /// True if the token expires within `margin` of now. Tokens without `exp` never expire.
    pub fn expires_within(&self, margin: Duration) -> bool {
        match self.expires_at() {
            Some(expiry) => expiry <= Utc::now() + margin,
            None => false,
        }
    }

    /// Look up an arbitrary claim by name.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.extra.get(key)
    }
}

/// `aud` is a string in Entra tokens but an array is legal JWT.
fn string_or_first<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::String(s)) => Some(s),
        Some(Value::Array(items)) => items
            .into_iter()
            .find_map(|v| v.as_str().map(str::to_string)),
        _ => None,
    })
}

/// Decode the payload segment of a JWT.
pub fn decode_claims(token: &str) -> Result<DecodedClaims, AuthError> {
    let mut parts = token.split('.');
    let (Some(_header), Some(payload), Some(_signature), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(AuthError::InvalidToken("expected three segments".into()));
    };

    let bytes = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .map_err(|e| AuthError::InvalidToken(format!("payload is not base64url: {}", e)))?;

    serde_json::from_slice(&bytes)
        .map_err(|e| AuthError::InvalidToken(format!("payload is not JSON: {}", e)))
}

/// Format duration as human-readable string (e.g., "45 min", "1 hour").
pub fn format_duration(duration: Duration) -> String {
    let total_minutes = duration.num_minutes();

    if total_minutes < 1 {
        "< 1 min".to_string()
    } else if total_minutes < 60 {
        format!("{} min", total_minutes)
    } else {
        let hours = total_minutes / 60;
        let mins = total_minutes % 60;
        if mins == 0 {
            format!("{} hour{}", hours, if hours == 1 { "" } else { "s" })
        } else {
            format!("{}h {}m", hours, mins)
        }
    }
}

/// Build an unsigned JWT around `claims`.
#[cfg(test)]
pub(crate) fn make_token(claims: &Value) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(claims.to_string());
    format!("{}.{}.sig", header, payload)
}
