use jsonwebtoken::{decode, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    config::JwtConfig,
    error::{AppError, AppResult},
};

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Claims {
    pub sub: String, // user_id
    pub iss: String, // issuer
    pub exp: i64,    // expiry
    pub iat: i64,    // issued at
}

/// Authorization guard. Tokens are minted by the external identity provider;
/// this side only verifies them and extracts the caller id. Every mutation,
/// query, and subscription handshake goes through here before any
/// persistence or bus work.
pub struct AuthGuard {
    config: JwtConfig,
}

impl AuthGuard {
    pub fn new(config: JwtConfig) -> Self {
        Self { config }
    }

    pub fn validate_token(&self, token: &str) -> AppResult<Claims> {
        let mut validation = Validation::default();
        validation.set_issuer(&[&self.config.issuer]);

        let data = decode::<Claims>(
            token,
            &DecodingKey::from_secret(self.config.secret.as_bytes()),
            &validation,
        )
        .map_err(|_| AppError::Unauthorized)?;

        Ok(data.claims)
    }
}

/// Extract the verified caller id from validated claims.
pub fn get_user_id(claims: &Claims) -> AppResult<Uuid> {
    Uuid::parse_str(&claims.sub).map_err(|_| AppError::InvalidToken)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use jsonwebtoken::{encode, EncodingKey, Header};

    fn config() -> JwtConfig {
        JwtConfig {
            secret: "test-secret".to_string(),
            issuer: "parley".to_string(),
        }
    }

    fn mint(sub: &str, secret: &str, issuer: &str, exp_offset: i64) -> String {
        let now = Utc::now().timestamp();
        let claims = Claims {
            sub: sub.to_string(),
            iss: issuer.to_string(),
            exp: now + exp_offset,
            iat: now,
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    #[test]
    fn valid_token_round_trips_to_caller_id() {
        let user_id = Uuid::new_v4();
        let guard = AuthGuard::new(config());
        let token = mint(&user_id.to_string(), "test-secret", "parley", 3600);

        let claims = guard.validate_token(&token).unwrap();
        assert_eq!(get_user_id(&claims).unwrap(), user_id);
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let guard = AuthGuard::new(config());
        let token = mint("u1", "other-secret", "parley", 3600);

        assert!(matches!(
            guard.validate_token(&token),
            Err(AppError::Unauthorized)
        ));
    }

    #[test]
    fn wrong_issuer_is_rejected() {
        let guard = AuthGuard::new(config());
        let token = mint("u1", "test-secret", "someone-else", 3600);

        assert!(matches!(
            guard.validate_token(&token),
            Err(AppError::Unauthorized)
        ));
    }

    #[test]
    fn expired_token_is_rejected() {
        let guard = AuthGuard::new(config());
        let token = mint("u1", "test-secret", "parley", -3600);

        assert!(matches!(
            guard.validate_token(&token),
            Err(AppError::Unauthorized)
        ));
    }

    #[test]
    fn garbage_token_is_rejected() {
        let guard = AuthGuard::new(config());
        assert!(matches!(
            guard.validate_token("not-a-jwt"),
            Err(AppError::Unauthorized)
        ));
    }

    #[test]
    fn non_uuid_subject_is_invalid() {
        let claims = Claims {
            sub: "not-a-uuid".to_string(),
            iss: "parley".to_string(),
            exp: 0,
            iat: 0,
        };
        assert!(matches!(
            get_user_id(&claims),
            Err(AppError::InvalidToken)
        ));
    }
}
