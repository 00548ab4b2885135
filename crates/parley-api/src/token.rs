//! Bearer token minting and validation.

use chrono::{Duration, Utc};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const TOKEN_ISSUER: &str = "http://localhost:8080";
const SUBJECT_PREFIX: &str = "user_id:";

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub iss: String,
    pub sub: String,
    pub iat: i64,
    pub exp: i64,
}

/// Outcome of validating a bearer whose signature checked out.
#[derive(Debug, PartialEq, Eq)]
pub enum TokenStatus {
    Valid(Uuid),
    /// Signature valid but past expiry — the refresh path decides what
    /// happens next.
    Expired(Uuid),
}

#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("invalid token: {0}")]
    Invalid(String),
    #[error("invalid token subject")]
    InvalidSubject,
}

/// Mint an HS512 bearer for `user_id` with a one hour TTL.
pub fn issue_token(user_id: Uuid, secret: &str) -> jsonwebtoken::errors::Result<String> {
    issue_token_with_ttl(user_id, secret, Duration::hours(1))
}

pub fn issue_token_with_ttl(
    user_id: Uuid,
    secret: &str,
    ttl: Duration,
) -> jsonwebtoken::errors::Result<String> {
    let now = Utc::now();
    let claims = Claims {
        iss: TOKEN_ISSUER.to_string(),
        sub: format!("{SUBJECT_PREFIX}{user_id}"),
        iat: now.timestamp(),
        exp: (now + ttl).timestamp(),
    };
    encode(
        &Header::new(Algorithm::HS512),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
}

/// Validate a bearer. An expired-but-authentic token is reported as
/// [`TokenStatus::Expired`] with the subject recovered, so the caller
/// can consult the refresh credential.
pub fn check_token(token: &str, secret: &str) -> Result<TokenStatus, TokenError> {
    let key = DecodingKey::from_secret(secret.as_bytes());
    let validation = Validation::new(Algorithm::HS512);

    match decode::<Claims>(token, &key, &validation) {
        Ok(data) => Ok(TokenStatus::Valid(parse_subject(&data.claims.sub)?)),
        Err(e) if matches!(e.kind(), ErrorKind::ExpiredSignature) => {
            let mut lenient = Validation::new(Algorithm::HS512);
            lenient.validate_exp = false;
            let data = decode::<Claims>(token, &key, &lenient)
                .map_err(|e| TokenError::Invalid(e.to_string()))?;
            Ok(TokenStatus::Expired(parse_subject(&data.claims.sub)?))
        }
        Err(e) => Err(TokenError::Invalid(e.to_string())),
    }
}

fn parse_subject(subject: &str) -> Result<Uuid, TokenError> {
    subject
        .strip_prefix(SUBJECT_PREFIX)
        .and_then(|raw| raw.parse().ok())
        .ok_or(TokenError::InvalidSubject)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "test-secret";

    #[test]
    fn fresh_token_validates_with_subject() {
        let user_id = Uuid::new_v4();
        let token = issue_token(user_id, SECRET).unwrap();
        assert_eq!(
            check_token(&token, SECRET).unwrap(),
            TokenStatus::Valid(user_id)
        );
    }

    #[test]
    fn expired_token_reports_expired_with_subject() {
        let user_id = Uuid::new_v4();
        let token = issue_token_with_ttl(user_id, SECRET, Duration::hours(-2)).unwrap();
        assert_eq!(
            check_token(&token, SECRET).unwrap(),
            TokenStatus::Expired(user_id)
        );
    }

    #[test]
    fn wrong_secret_is_rejected_even_when_expired() {
        let token = issue_token_with_ttl(Uuid::new_v4(), SECRET, Duration::hours(-2)).unwrap();
        assert!(matches!(
            check_token(&token, "other-secret"),
            Err(TokenError::Invalid(_))
        ));
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(matches!(
            check_token("not-a-jwt", SECRET),
            Err(TokenError::Invalid(_))
        ));
    }

    #[test]
    fn subject_must_carry_the_user_id_prefix() {
        assert!(parse_subject("user_id:7f8de5ba-0000-0000-0000-000000000000").is_ok());
        assert!(parse_subject("7f8de5ba-0000-0000-0000-000000000000").is_err());
        assert!(parse_subject("user_id:nonsense").is_err());
    }
}
