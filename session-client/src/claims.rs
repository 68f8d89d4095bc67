use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{SessionError, SessionResult};

/// Application-focused representation of decoded token claims.
///
/// Claims are decoded structurally, never verified: this layer feeds UI
/// decisions (identity, role gates, refresh scheduling) and is not a
/// security boundary. The server re-checks every request.
#[derive(Debug, Clone, Serialize)]
pub struct Claims {
    pub subject: String,
    pub email: String,
    pub name: String,
    pub roles: Vec<String>,
    pub permissions: Vec<String>,
    pub expires_at: DateTime<Utc>,
    pub issued_at: Option<DateTime<Utc>>,
    pub raw: serde_json::Value,
}

impl Claims {
    /// Convenience helper for role checks.
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|value| value == role)
    }

    pub fn has_permission(&self, permission: &str) -> bool {
        self.permissions.iter().any(|value| value == permission)
    }

    /// A token past its `exp` claim is treated as absent everywhere.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }
}

#[derive(Debug, Deserialize)]
struct ClaimsRepr {
    sub: String,
    email: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    roles: Vec<String>,
    #[serde(default)]
    permissions: Vec<String>,
    exp: i64,
    #[serde(default)]
    iat: Option<i64>,
}

impl TryFrom<ClaimsRepr> for Claims {
    type Error = SessionError;

    fn try_from(value: ClaimsRepr) -> SessionResult<Self> {
        if value.sub.trim().is_empty() {
            return Err(SessionError::Decode("empty 'sub' claim".to_string()));
        }
        if value.email.trim().is_empty() {
            return Err(SessionError::Decode("empty 'email' claim".to_string()));
        }

        let expires_at = Utc
            .timestamp_opt(value.exp, 0)
            .single()
            .ok_or_else(|| SessionError::Decode(format!("invalid 'exp' claim {}", value.exp)))?;

        let issued_at = match value.iat {
            Some(iat) => Some(
                Utc.timestamp_opt(iat, 0)
                    .single()
                    .ok_or_else(|| SessionError::Decode(format!("invalid 'iat' claim {iat}")))?,
            ),
            None => None,
        };

        Ok(Self {
            subject: value.sub,
            email: value.email,
            name: value.name,
            roles: value.roles,
            permissions: value.permissions,
            expires_at,
            issued_at,
            raw: serde_json::Value::Null,
        })
    }
}

impl TryFrom<serde_json::Value> for Claims {
    type Error = SessionError;

    fn try_from(value: serde_json::Value) -> SessionResult<Self> {
        let repr: ClaimsRepr = serde_json::from_value(value.clone())
            .map_err(|err| SessionError::Decode(err.to_string()))?;
        let mut claims = Claims::try_from(repr)?;
        claims.raw = value;
        Ok(claims)
    }
}

/// Decode the payload segment of a JWT without verifying its signature.
///
/// Fails with [`SessionError::Decode`] when the token is not three
/// dot-separated segments, the payload is not base64url JSON, or a required
/// claim (`sub`, `email`, `exp`) is missing.
pub fn decode_unverified(token: &str) -> SessionResult<Claims> {
    let segments: Vec<&str> = token.split('.').collect();
    if segments.len() != 3 {
        return Err(SessionError::Decode(format!(
            "expected 3 token segments, found {}",
            segments.len()
        )));
    }

    let payload = URL_SAFE_NO_PAD
        .decode(segments[1])
        .map_err(|err| SessionError::Decode(format!("payload is not base64url: {err}")))?;
    let value: serde_json::Value = serde_json::from_slice(&payload)
        .map_err(|err| SessionError::Decode(format!("payload is not JSON: {err}")))?;

    Claims::try_from(value)
}
