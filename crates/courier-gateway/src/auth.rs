use jsonwebtoken::{DecodingKey, Validation, decode};
use uuid::Uuid;

use courier_types::api::Claims;

use crate::error::GatewayError;

/// Who a connection belongs to, established once at admission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: Uuid,
    pub username: String,
}

/// Turns a bearer credential into a stable user identity.
pub trait CredentialVerifier: Send + Sync {
    fn verify(&self, credential: &str) -> Result<Identity, GatewayError>;
}

/// HS256 JWT verification against a shared secret.
pub struct JwtVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl JwtVerifier {
    pub fn new(secret: &str) -> Self {
        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation: Validation::default(),
        }
    }
}

impl CredentialVerifier for JwtVerifier {
    fn verify(&self, credential: &str) -> Result<Identity, GatewayError> {
        let credential = credential.trim();
        if credential.is_empty() {
            return Err(GatewayError::Authentication("missing credential".into()));
        }

        let token_data = decode::<Claims>(credential, &self.key, &self.validation)
            .map_err(|e| GatewayError::Authentication(e.to_string()))?;

        Ok(Identity {
            user_id: token_data.claims.sub,
            username: token_data.claims.username,
        })
    }
}

/// Pull the token out of an `Authorization: Bearer <token>` header value.
pub fn bearer_token(header: &str) -> Option<&str> {
    header
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{EncodingKey, Header, encode};

    fn token(secret: &str, user_id: Uuid, exp_offset: i64) -> String {
        let claims = Claims {
            sub: user_id,
            username: "ada".into(),
            exp: (chrono::Utc::now().timestamp() + exp_offset) as usize,
        };
        encode(&Header::default(), &claims, &EncodingKey::from_secret(secret.as_bytes())).unwrap()
    }

    #[test]
    fn test_valid_token() {
        let user = Uuid::new_v4();
        let verifier = JwtVerifier::new("s3cret");
        let identity = verifier.verify(&token("s3cret", user, 3600)).unwrap();
        assert_eq!(identity.user_id, user);
        assert_eq!(identity.username, "ada");
    }

    #[test]
    fn test_rejects_wrong_secret_expired_and_empty() {
        let verifier = JwtVerifier::new("s3cret");
        let user = Uuid::new_v4();
        assert!(matches!(
            verifier.verify(&token("other", user, 3600)),
            Err(GatewayError::Authentication(_))
        ));
        assert!(verifier.verify(&token("s3cret", user, -3600)).is_err());
        assert!(verifier.verify("   ").is_err());
        assert!(verifier.verify("not-a-jwt").is_err());
    }

    #[test]
    fn test_bearer_token() {
        assert_eq!(bearer_token("Bearer abc"), Some("abc"));
        assert_eq!(bearer_token("Bearer "), None);
        assert_eq!(bearer_token("Basic abc"), None);
    }
}
