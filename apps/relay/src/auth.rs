//! Socket token module.
//!
//! `POST /register` issues an HS256 token carrying the device identity;
//! `GET /ws?token=` trusts only what the token says.

use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, TokenData, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use tandem_core::protocol::RegisterRequest;
use tandem_core::Role;

use crate::error::RelayError;

/// JWT claims structure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    /// Subject (device_id)
    pub sub: String,

    pub device_name: String,

    /// "master" or "slave"
    pub device_type: Role,

    /// Master the slave belongs to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub master_device_id: Option<String>,

    /// Issued at (Unix timestamp)
    pub iat: i64,

    /// Expiration (Unix timestamp)
    pub exp: i64,

    /// JWT ID (unique identifier for this token)
    pub jti: String,
}

/// Issues and checks socket tokens.
pub struct TokenIssuer {
    secret: String,
    lifetime_secs: i64,
}

impl TokenIssuer {
    pub fn new(secret: String, lifetime_secs: i64) -> Self {
        TokenIssuer { secret, lifetime_secs }
    }

    /// Generate a socket token for a registered device.
    pub fn issue(&self, request: &RegisterRequest) -> Result<String, RelayError> {
        let now = Utc::now();
        let exp = now + Duration::seconds(self.lifetime_secs);

        let claims = Claims {
            sub: request.device_id.clone(),
            device_name: request.device_name.clone(),
            device_type: request.device_type,
            master_device_id: request.master_device_id.clone(),
            iat: now.timestamp(),
            exp: exp.timestamp(),
            jti: Uuid::new_v4().to_string(),
        };

        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(self.secret.as_bytes()),
        )
        .map_err(|e| RelayError::Internal(format!("Failed to generate token: {}", e)))
    }

    /// Validate and decode a token.
    pub fn validate(&self, token: &str) -> Result<Claims, RelayError> {
        let token_data: TokenData<Claims> = decode(
            token,
            &DecodingKey::from_secret(self.secret.as_bytes()),
            &Validation::default(),
        )
        .map_err(|e| RelayError::AuthFailed(format!("Invalid token: {}", e)))?;

        Ok(token_data.claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slave_request() -> RegisterRequest {
        RegisterRequest {
            device_type: Role::Slave,
            device_id: "slave-1".into(),
            device_name: "Customer Display".into(),
            master_device_id: Some("master-1".into()),
        }
    }

    #[test]
    fn test_token_carries_identity() {
        let issuer = TokenIssuer::new("test-secret".to_string(), 300);
        let token = issuer.issue(&slave_request()).unwrap();

        let claims = issuer.validate(&token).unwrap();
        assert_eq!(claims.sub, "slave-1");
        assert_eq!(claims.device_type, Role::Slave);
        assert_eq!(claims.master_device_id.as_deref(), Some("master-1"));
        assert!(claims.exp > claims.iat);
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let issuer = TokenIssuer::new("test-secret".to_string(), 300);
        let token = issuer.issue(&slave_request()).unwrap();

        let other = TokenIssuer::new("other-secret".to_string(), 300);
        assert!(matches!(other.validate(&token), Err(RelayError::AuthFailed(_))));
    }

    #[test]
    fn test_expired_token_rejected() {
        // Past the default 60 s validation leeway.
        let issuer = TokenIssuer::new("test-secret".to_string(), -120);
        let token = issuer.issue(&slave_request()).unwrap();
        assert!(issuer.validate(&token).is_err());
    }
}
