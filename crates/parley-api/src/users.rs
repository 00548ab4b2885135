use argon2::Argon2;
use argon2::password_hash::rand_core::OsRng as HashOsRng;
use argon2::password_hash::{PasswordHasher, SaltString};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::{Extension, Json};

use parley_gateway::codec::rfc1123;
use parley_types::api::{
    EmptyResponse, UpdatePasswordRequest, UpdatePhonenumberRequest, UpdateUsernameRequest,
    UpdateUsernameResponse, UserInfoRequest, UserInfoResponse,
};

use crate::error::ApiError;
use crate::middleware::AuthContext;
use crate::state::AppState;
use crate::validate;

pub async fn update_username(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Json(req): Json<UpdateUsernameRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if !validate::valid_username(&req.username) {
        return Err(ApiError::not_acceptable("invalid username"));
    }

    let username = state
        .db
        .update_username(ctx.user_id, &req.username)
        .await
        .map_err(ApiError::internal)?
        .ok_or_else(|| ApiError::not_found("user not found"))?;

    Ok(Json(UpdateUsernameResponse {
        username,
        access_token: ctx.access_token,
    }))
}

/// Changing the phonenumber re-verifies ownership via OTP and revokes
/// the refresh credential so stale sessions die with the old number.
pub async fn update_phonenumber(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Json(req): Json<UpdatePhonenumberRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if !validate::valid_phonenumber(&req.phonenumber) {
        return Err(ApiError::not_acceptable("invalid phonenumber"));
    }

    state
        .otp
        .verify_otp(&req.phonenumber, &req.otp)
        .await
        .map_err(|e| ApiError::bad_request(e.to_string()))?;

    state
        .db
        .update_phonenumber(ctx.user_id, &req.phonenumber)
        .await
        .map_err(ApiError::internal)?;
    state
        .db
        .remove_refresh_token(ctx.user_id)
        .await
        .map_err(ApiError::internal)?;

    Ok(Json(EmptyResponse {
        access_token: ctx.access_token,
    }))
}

pub async fn update_password(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Json(req): Json<UpdatePasswordRequest>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .otp
        .verify_otp(&req.phonenumber, &req.otp)
        .await
        .map_err(|e| ApiError::bad_request(e.to_string()))?;

    if !validate::valid_password(&req.password) {
        return Err(ApiError::bad_request("invalid password"));
    }

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

    state
        .db
        .update_password(ctx.user_id, &password_hash)
        .await
        .map_err(ApiError::internal)?;
    state
        .db
        .remove_refresh_token(ctx.user_id)
        .await
        .map_err(ApiError::internal)?;

    Ok(Json(EmptyResponse {
        access_token: ctx.access_token,
    }))
}

pub async fn user_info(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Json(req): Json<UserInfoRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let user = state
        .db
        .get_user_by_phonenumber(&req.phonenumber)
        .await
        .map_err(ApiError::internal)?
        .ok_or_else(|| ApiError::not_found("user not found"))?;

    Ok(Json(UserInfoResponse {
        username: user.username,
        created_at: rfc1123(user.created_at),
        access_token: ctx.access_token,
    }))
}

pub async fn remove_user(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .db
        .remove_user(ctx.user_id)
        .await
        .map_err(|e| ApiError::not_found(e.to_string()))?;

    Ok(Json(EmptyResponse {
        access_token: ctx.access_token,
    }))
}
