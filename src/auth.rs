//! Bearer Token Validation
//!
//! The gateway consumes access tokens issued by the external auth service:
//! HS256 JWTs with the user id in `sub`. This module only validates; it
//! never issues tokens.

use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub exp: usize,
}

pub struct TokenValidator {
    key: DecodingKey,
    validation: Validation,
}

impl TokenValidator {
    pub fn new(secret: &[u8]) -> Self {
        let validation = Validation::new(Algorithm::HS256);
        Self {
            key: DecodingKey::from_secret(secret),
            validation,
        }
    }

    /// Resolve an `Authorization` header value to a user id.
    /// Returns `None` for anything other than a valid, unexpired token
    /// whose subject parses as a numeric user id.
    pub fn user_id(&self, header_value: &str) -> Option<i64> {
        let token = header_value
            .strip_prefix("Bearer ")
            .unwrap_or(header_value);
        let data = decode::<Claims>(token, &self.key, &self.validation).ok()?;
        data.claims.sub.parse().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};

    fn mint(secret: &[u8], sub: &str, exp_offset_secs: i64) -> String {
        let exp = (chrono::Utc::now().timestamp() + exp_offset_secs) as usize;
        let claims = Claims {
            sub: sub.to_string(),
            exp,
        };
        encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(secret),
        )
        .unwrap()
    }

    #[test]
    fn test_valid_bearer_token() {
        let validator = TokenValidator::new(b"test-secret");
        let token = mint(b"test-secret", "42", 600);

        assert_eq!(validator.user_id(&format!("Bearer {token}")), Some(42));
        // Raw token without the scheme prefix also accepted
        assert_eq!(validator.user_id(&token), Some(42));
    }

    #[test]
    fn test_rejects_bad_tokens() {
        let validator = TokenValidator::new(b"test-secret");

        // Wrong secret
        let forged = mint(b"other-secret", "42", 600);
        assert_eq!(validator.user_id(&forged), None);

        // Expired
        let expired = mint(b"test-secret", "42", -600);
        assert_eq!(validator.user_id(&expired), None);

        // Non-numeric subject
        let odd = mint(b"test-secret", "alice", 600);
        assert_eq!(validator.user_id(&odd), None);

        assert_eq!(validator.user_id("Bearer not-a-jwt"), None);
        assert_eq!(validator.user_id(""), None);
    }
}
