//! REST API surface: authentication, user management, messaging, and
//! group administration. Handlers translate HTTP requests into store
//! operations, keep the message cache in step, and emit events for
//! the push side to fan out.

pub mod auth;
pub mod error;
pub mod groups;
pub mod messages;
pub mod middleware;
pub mod otp;
pub mod state;
pub mod token;
pub mod users;
pub mod validate;

use axum::middleware::from_fn_with_state;
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};

use crate::state::AppState;

/// Assemble the `/api/v1` router. Protected routes pass through the
/// bearer-validation gate, which refreshes expired tokens when the
/// user still holds a live refresh token.
pub fn router(state: AppState) -> Router {
    let public = Router::new()
        .route("/healthz", get(healthz))
        .route("/auth/otp/send", post(auth::send_otp))
        .route("/auth/register", post(auth::register))
        .route("/auth/login", post(auth::login));

    let protected = Router::new()
        .route("/auth/otp/send/registered", post(auth::send_otp_registered))
        .route("/users/update/username", put(users::update_username))
        .route("/users/update/phonenumber", put(users::update_phonenumber))
        .route("/users/update/password", put(users::update_password))
        .route("/users/info", get(users::user_info))
        .route("/users/remove", delete(users::remove_user))
        .route("/message/create", post(messages::create_message))
        .route("/message/update", put(messages::update_message))
        .route("/message/delete", delete(messages::delete_message))
        .route("/message/conversation", get(messages::get_conversation))
        .route(
            "/message/conversation/delete",
            delete(messages::delete_conversation),
        )
        .route("/message/conversations", get(messages::get_conversations))
        .route("/message/group/all", get(messages::get_group_messages))
        .route(
            "/message/mark/received",
            put(messages::mark_message_received),
        )
        .route("/message/mark/read", put(messages::mark_message_read))
        .route(
            "/message/group/mark/received",
            put(messages::mark_group_message_received),
        )
        .route(
            "/message/group/mark/read",
            put(messages::mark_group_message_read),
        )
        .route("/group/create", post(groups::create_group))
        .route("/group/update", put(groups::update_group))
        .route("/group/remove", delete(groups::remove_group))
        .route("/group/members", get(groups::get_members))
        .route("/group/add/user", put(groups::add_user))
        .route("/group/member/remove", put(groups::remove_member))
        .route("/group/make/user/admin", put(groups::make_admin))
        .route("/group/remove/user/admin", put(groups::remove_admin))
        .layer(from_fn_with_state(state.clone(), middleware::require_auth));

    Router::new().nest("/api/v1", public.merge(protected).with_state(state))
}

async fn healthz() -> Json<&'static str> {
    Json("OK")
}
