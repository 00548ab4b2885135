use argon2::password_hash::rand_core::OsRng as HashOsRng;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::{Extension, Json};
use chrono::{Duration, Utc};
use rand::RngCore;
use tracing::{debug, warn};

use parley_gateway::codec::rfc1123;
use parley_types::api::{
    LoginRequest, LoginResponse, RegisterRequest, RegisterResponse, SendOtpRequest,
};

use crate::error::ApiError;
use crate::middleware::AuthContext;
use crate::state::AppState;
use crate::token;
use crate::validate;

/// Refresh credentials outlive bearers by two months.
const REFRESH_TOKEN_TTL_DAYS: i64 = 60;

pub async fn send_otp(
    State(state): State<AppState>,
    Json(req): Json<SendOtpRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if !validate::valid_phonenumber(&req.phonenumber) {
        return Err(ApiError::bad_request("invalid phonenumber"));
    }

    state
        .otp
        .send_otp(&req.phonenumber)
        .await
        .map_err(ApiError::internal)?;

    Ok(StatusCode::OK)
}

/// Same as [`send_otp`] but for the authenticated user's stored
/// phonenumber, used ahead of password changes.
pub async fn send_otp_registered(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
) -> Result<impl IntoResponse, ApiError> {
    let profile = state
        .db
        .get_user_by_id(ctx.user_id)
        .await
        .map_err(ApiError::internal)?
        .ok_or_else(|| ApiError::not_found("user not found"))?;

    state
        .otp
        .send_otp(&profile.phonenumber)
        .await
        .map_err(ApiError::internal)?;

    Ok(StatusCode::OK)
}

pub async fn register(
    State(state): State<AppState>,
    Json(req): Json<RegisterRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if !validate::valid_phonenumber(&req.phonenumber) {
        return Err(ApiError::not_acceptable("invalid phonenumber"));
    }

    state
        .otp
        .verify_otp(&req.phonenumber, &req.otp)
        .await
        .map_err(|e| ApiError::not_acceptable(e.to_string()))?;

    if state
        .db
        .user_exists(&req.phonenumber)
        .await
        .map_err(ApiError::internal)?
    {
        warn!(
            phonenumber = req.phonenumber,
            "registration attempt for existing user"
        );
        return Err(ApiError::bad_request("user already exists"));
    }

    if !validate::valid_username(&req.username) {
        return Err(ApiError::not_acceptable("invalid username"));
    }
    if !validate::valid_password(&req.password) {
        return Err(ApiError::not_acceptable("invalid password"));
    }

    // Argon2 hashing runs off the async runtime
    let password = req.password.clone();
    let password_hash = tokio::task::spawn_blocking(move || {
        let salt = SaltString::generate(&mut HashOsRng);
        Argon2::default()
            .hash_password(password.as_bytes(), &salt)
            .map(|hash| hash.to_string())
    })
    .await
    .map_err(ApiError::internal)?
    .map_err(ApiError::internal)?;

    let user = state
        .db
        .create_user(&req.phonenumber, &req.username, &password_hash)
        .await
        .map_err(ApiError::internal)?;

    Ok((
        StatusCode::CREATED,
        Json(RegisterResponse {
            id: user.id,
            username: user.username,
            phonenumber: user.phonenumber,
            created_at: rfc1123(user.created_at),
            updated_at: rfc1123(user.updated_at),
        }),
    ))
}

pub async fn login(
    State(state): State<AppState>,
    Json(req): Json<LoginRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if !validate::valid_phonenumber(&req.phonenumber) {
        return Err(ApiError::not_acceptable("invalid phonenumber"));
    }

    let user = state
        .db
        .get_user_by_phonenumber(&req.phonenumber)
        .await
        .map_err(ApiError::internal)?
        .ok_or_else(|| ApiError::not_found("user not found"))?;

    // Argon2 verification runs off the async runtime
    let password = req.password.clone();
    let stored_hash = user.password.clone();
    let verified = tokio::task::spawn_blocking(move || {
        let parsed = PasswordHash::new(&stored_hash)?;
        Argon2::default().verify_password(password.as_bytes(), &parsed)
    })
    .await
    .map_err(ApiError::internal)?;
    if verified.is_err() {
        return Err(ApiError::bad_request("incorrect password"));
    }

    let access_token =
        token::issue_token(user.id, &state.jwt_secret).map_err(ApiError::internal)?;

    let refresh_token = generate_refresh_token();
    state
        .db
        .upsert_refresh_token(
            &refresh_token,
            user.id,
            Utc::now() + Duration::days(REFRESH_TOKEN_TTL_DAYS),
        )
        .await
        .map_err(ApiError::internal)?;

    // everything that arrived since the user was last reachable
    let since = user.last_available.unwrap_or(chrono::DateTime::UNIX_EPOCH);
    let one_to_one = match state.db.latest_messages_for_receiver(user.id, since).await {
        Ok(messages) if !messages.is_empty() => Some(messages),
        Ok(_) => None,
        Err(e) => {
            debug!(error = %e, "no new one-to-one messages loaded");
            None
        }
    };
    let group = match state
        .db
        .latest_group_messages_for_member(user.id, since)
        .await
    {
        Ok(messages) if !messages.is_empty() => Some(messages),
        Ok(_) => None,
        Err(e) => {
            debug!(error = %e, "no new group messages loaded");
            None
        }
    };

    Ok(Json(LoginResponse {
        one_to_one_messages: one_to_one,
        group_messages: group,
        access_token,
    }))
}

fn generate_refresh_token() -> String {
    let mut bytes = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refresh_tokens_are_high_entropy_hex() {
        let a = generate_refresh_token();
        let b = generate_refresh_token();
        assert_eq!(a.len(), 64);
        assert!(a.bytes().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }
}
