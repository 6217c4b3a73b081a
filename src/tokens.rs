//! HS256 tokens: verification of participant access tokens and signing of
//! meeting SDK tokens.

use chrono::Utc;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::error::RepositoryError;
use crate::types::UserId;

/// Role that is allowed to join games.
pub const USER_ROLE: &str = "user";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessClaims {
    pub user_id: UserId,
    pub access: String,
    pub exp: i64,
}

/// Verifies access tokens issued by the account service.
#[derive(Clone)]
pub struct TokenVerifier {
    decoding: DecodingKey,
    encoding: EncodingKey,
    validation: Validation,
}

impl TokenVerifier {
    pub fn new(secret: &str) -> Self {
        Self {
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            validation: Validation::new(Algorithm::HS256),
        }
    }

    /// Returns the participant id and role carried by `token`.
    pub fn verify(&self, token: &str) -> Result<(UserId, String), RepositoryError> {
        let data = jsonwebtoken::decode::<AccessClaims>(token, &self.decoding, &self.validation)?;
        Ok((data.claims.user_id, data.claims.access))
    }

    /// Signs an access token valid for `ttl_secs`. Used by local tooling and tests.
    pub fn issue(&self, user_id: UserId, access: &str, ttl_secs: i64) -> Result<String, RepositoryError> {
        let claims = AccessClaims {
            user_id,
            access: access.to_string(),
            exp: Utc::now().timestamp() + ttl_secs,
        };
        Ok(jsonwebtoken::encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)?)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeetingClaims {
    #[serde(rename = "appKey")]
    pub app_key: String,
    #[serde(rename = "sdkKey")]
    pub sdk_key: String,
    pub mn: String,
    pub role: u8,
    pub iat: i64,
    pub exp: i64,
    #[serde(rename = "tokenExp")]
    pub token_exp: i64,
}

/// Signs tokens that let a participant join a meeting from the client SDK.
#[derive(Clone)]
pub struct MeetingTokenGenerator {
    sdk_key: String,
    encoding: EncodingKey,
}

impl MeetingTokenGenerator {
    pub fn new(sdk_key: &str, sdk_secret: &str) -> Self {
        Self {
            sdk_key: sdk_key.to_string(),
            encoding: EncodingKey::from_secret(sdk_secret.as_bytes()),
        }
    }

    pub fn generate(&self, meeting_number: &str, role: u8) -> Result<String, RepositoryError> {
        let now = Utc::now().timestamp();
        let claims = MeetingClaims {
            app_key: self.sdk_key.clone(),
            sdk_key: self.sdk_key.clone(),
            mn: meeting_number.to_string(),
            role,
            iat: now - 30,
            exp: now + 3600,
            token_exp: now + 7200,
        };
        Ok(jsonwebtoken::encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn issued_token_verifies() {
        let verifier = TokenVerifier::new("secret");
        let id = Uuid::new_v4();
        let token = verifier.issue(id, USER_ROLE, 60).unwrap();
        assert_eq!(verifier.verify(&token).unwrap(), (id, USER_ROLE.to_string()));
    }

    #[test]
    fn foreign_signature_is_rejected() {
        let token = TokenVerifier::new("other").issue(Uuid::new_v4(), USER_ROLE, 60).unwrap();
        let err = TokenVerifier::new("secret").verify(&token).unwrap_err();
        assert!(matches!(err, RepositoryError::Token(_)));
    }

    #[test]
    fn expired_token_is_rejected() {
        let verifier = TokenVerifier::new("secret");
        let token = verifier.issue(Uuid::new_v4(), USER_ROLE, -3600).unwrap();
        assert!(verifier.verify(&token).is_err());
    }

    #[test]
    fn meeting_token_carries_meeting_number() {
        let generator = MeetingTokenGenerator::new("sdk-key", "sdk-secret");
        let token = generator.generate("8675309", 0).unwrap();

        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        let data = jsonwebtoken::decode::<MeetingClaims>(
            &token,
            &DecodingKey::from_secret(b"sdk-secret"),
            &validation,
        )
        .unwrap();
        assert_eq!(data.claims.mn, "8675309");
        assert_eq!(data.claims.app_key, "sdk-key");
        assert_eq!(data.claims.role, 0);
        assert_eq!(data.claims.token_exp - data.claims.exp, 3600);
    }
}
