use axum::extract::{Request, State};
use axum::http::header;
use axum::middleware::Next;
use axum::response::Response;
use chrono::Utc;
use uuid::Uuid;

use crate::error::ApiError;
use crate::state::AppState;
use crate::token::{self, TokenStatus};

/// Identity established by the auth gate, inserted as a request
/// extension. `access_token` is the refreshed bearer when the
/// submitted one had expired, empty otherwise; handlers echo it in
/// the response body.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub user_id: Uuid,
    pub access_token: String,
}

/// Validate the bearer on every protected route. An expired bearer is
/// honored once more if the user's refresh credential is still live,
/// in which case a fresh bearer rides along to the handler.
pub async fn require_auth(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let header = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::unauthorized("malformed request header"))?;
    let bearer = header
        .strip_prefix("Bearer ")
        .ok_or_else(|| ApiError::unauthorized("malformed request header"))?;

    let context = match token::check_token(bearer, &state.jwt_secret) {
        Ok(TokenStatus::Valid(user_id)) => AuthContext {
            user_id,
            access_token: String::new(),
        },
        Ok(TokenStatus::Expired(user_id)) => {
            let expiry = state
                .db
                .refresh_token_expiry(user_id)
                .await
                .map_err(ApiError::internal)?;

            match expiry {
                Some(expires_at) if expires_at > Utc::now() => {
                    let refreshed = token::issue_token(user_id, &state.jwt_secret)
                        .map_err(ApiError::internal)?;
                    AuthContext {
                        user_id,
                        access_token: refreshed,
                    }
                }
                _ => return Err(ApiError::unauthorized("please log in again")),
            }
        }
        Err(e) => return Err(ApiError::unauthorized(e.to_string())),
    };

    req.extensions_mut().insert(context);
    Ok(next.run(req).await)
}
