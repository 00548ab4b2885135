use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::{Extension, Json};
use chrono::Utc;
use uuid::Uuid;

use parley_cache::{MessageUpdate, conversation_key};
use parley_gateway::codec::rfc1123;
use parley_gateway::events::{MessageEvent, MessageEventKind, MessagePayload};
use parley_types::api::{
    ConversationRequest, ConversationSummary, ConversationsResponse, CreateMessageRequest,
    CreateMessageResponse, DeleteConversationRequest, DeleteMessageRequest, EmptyResponse,
    GroupMessagesRequest, MarkGroupMessageRequest, MarkMessageRequest, MessagesResponse,
    UpdateMessageRequest,
};

use crate::error::ApiError;
use crate::middleware::AuthContext;
use crate::state::{ApiState, AppState};

/// Where a message is headed. Exactly one of the two request fields
/// must be set; everything downstream (cache key, push targets) hangs
/// off this.
enum MessageTarget {
    User(Uuid),
    Group(Uuid),
}

impl MessageTarget {
    fn resolve(receiver_id: Option<Uuid>, group_id: Option<Uuid>) -> Result<Self, ApiError> {
        match (receiver_id, group_id) {
            (Some(user), None) => Ok(Self::User(user)),
            (None, Some(group)) => Ok(Self::Group(group)),
            _ => Err(ApiError::not_acceptable("invalid message body")),
        }
    }

    /// Cache key as seen by `viewer`: the group id, or the viewer-first
    /// pair key for one-to-one conversations.
    fn cache_key(&self, viewer: Uuid) -> String {
        match self {
            Self::Group(group_id) => group_id.to_string(),
            Self::User(other) => conversation_key(viewer, *other),
        }
    }
}

/// Phone identifiers the event for this target fans out to.
async fn target_phonenumbers(
    state: &ApiState,
    target: &MessageTarget,
) -> Result<Vec<String>, ApiError> {
    match target {
        MessageTarget::Group(group_id) => state
            .db
            .group_member_phonenumbers(*group_id)
            .await
            .map_err(ApiError::internal),
        MessageTarget::User(receiver_id) => {
            let phonenumber = state
                .db
                .get_phonenumber_by_id(*receiver_id)
                .await
                .map_err(ApiError::internal)?
                .ok_or_else(|| ApiError::bad_request("receiver not found"))?;
            Ok(vec![phonenumber])
        }
    }
}

async fn sender_username(state: &ApiState, sender_id: Uuid) -> Result<String, ApiError> {
    Ok(state
        .db
        .get_user_by_id(sender_id)
        .await
        .map_err(ApiError::internal)?
        .ok_or_else(|| ApiError::internal("sender not found"))?
        .username)
}

pub async fn create_message(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Json(req): Json<CreateMessageRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let target = MessageTarget::resolve(req.receiver_id, req.group_id)?;
    if req.description.is_empty() {
        return Err(ApiError::not_acceptable("empty message description"));
    }

    let message = state
        .db
        .create_message(&req.description, ctx.user_id, req.receiver_id, req.group_id)
        .await
        .map_err(ApiError::internal)?;

    if let Some(group_id) = message.group_id {
        state
            .db
            .init_group_statuses(message.id, group_id, ctx.user_id)
            .await
            .map_err(ApiError::internal)?;
    }

    state
        .cache
        .set(&target.cache_key(ctx.user_id), message.clone());

    let phonenumbers = target_phonenumbers(&state, &target).await?;
    let username = sender_username(&state, ctx.user_id).await?;

    state
        .emit_message_event(MessageEvent {
            kind: MessageEventKind::NewMessage,
            phonenumbers,
            message: MessagePayload {
                id: message.id,
                description: message.description.clone(),
                sender_id: message.sender_id,
                sender_username: Some(username),
                group_id: message.group_id,
                created_at: Some(rfc1123(message.created_at)),
                ..Default::default()
            },
            emitted_at: Utc::now(),
        })
        .await;

    Ok((
        StatusCode::CREATED,
        Json(CreateMessageResponse {
            id: message.id,
            description: message.description,
            updated_at: rfc1123(message.updated_at),
            access_token: ctx.access_token,
        }),
    ))
}

pub async fn update_message(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Json(req): Json<UpdateMessageRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let target = MessageTarget::resolve(req.receiver_id, req.group_id)?;
    if req.description.is_empty() {
        return Err(ApiError::not_acceptable("empty message description"));
    }

    let updated = state
        .db
        .update_message(req.id, ctx.user_id, &req.description)
        .await
        .map_err(ApiError::internal)?
        .ok_or_else(|| ApiError::not_found("message not found"))?;

    state.cache.update(
        &target.cache_key(ctx.user_id),
        req.id,
        &MessageUpdate {
            description: updated.description.clone(),
            received: updated.received,
            read: updated.read,
            visible: true,
            updated_at: updated.updated_at,
        },
    );

    let phonenumbers = target_phonenumbers(&state, &target).await?;
    let username = sender_username(&state, updated.sender_id).await?;

    state
        .emit_message_event(MessageEvent {
            kind: MessageEventKind::EditMessage,
            phonenumbers,
            message: MessagePayload {
                id: req.id,
                description: updated.description.clone(),
                sender_id: updated.sender_id,
                sender_username: Some(username),
                group_id: updated.group_id,
                updated_at: Some(rfc1123(updated.updated_at)),
                ..Default::default()
            },
            emitted_at: Utc::now(),
        })
        .await;

    Ok(Json(CreateMessageResponse {
        id: req.id,
        description: updated.description,
        updated_at: rfc1123(updated.updated_at),
        access_token: ctx.access_token,
    }))
}

/// Soft delete. Who the requester is decides how far the delete
/// reaches:
/// - one-to-one, sender: hidden for both sides, dropped from the
///   sender's cache window;
/// - one-to-one, receiver: hidden for the receiver only, monotone
///   visibility update on the sender-view cache key;
/// - group, sender: hidden for everyone, dropped from the group
///   window;
/// - group, recipient: that member's status row only.
pub async fn delete_message(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Json(req): Json<DeleteMessageRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let target = MessageTarget::resolve(req.receiver_id, req.group_id)?;

    let deleted = match &target {
        MessageTarget::User(peer) => {
            if let Some(message) = state
                .db
                .hide_message_for_both(req.id, ctx.user_id)
                .await
                .map_err(ApiError::internal)?
            {
                state
                    .cache
                    .remove_message(&conversation_key(ctx.user_id, *peer), req.id);
                message
            } else if let Some(message) = state
                .db
                .hide_message_for_receiver(req.id, ctx.user_id)
                .await
                .map_err(ApiError::internal)?
            {
                state.cache.update(
                    &conversation_key(message.sender_id, ctx.user_id),
                    req.id,
                    &MessageUpdate {
                        visible: false,
                        updated_at: message.updated_at,
                        ..Default::default()
                    },
                );
                message
            } else {
                return Err(ApiError::not_found("message not found"));
            }
        }
        MessageTarget::Group(group_id) => {
            if let Some(message) = state
                .db
                .hide_group_message_for_all(req.id, ctx.user_id)
                .await
                .map_err(ApiError::internal)?
            {
                state.cache.remove_message(&group_id.to_string(), req.id);
                message
            } else if state
                .db
                .hide_group_message_for_member(req.id, ctx.user_id)
                .await
                .map_err(ApiError::internal)?
            {
                state
                    .db
                    .get_message(req.id)
                    .await
                    .map_err(ApiError::internal)?
                    .ok_or_else(|| ApiError::not_found("message not found"))?
            } else {
                return Err(ApiError::not_found("message not found"));
            }
        }
    };

    let phonenumbers = target_phonenumbers(&state, &target).await?;

    state
        .emit_message_event(MessageEvent {
            kind: MessageEventKind::DeleteMessage,
            phonenumbers,
            message: MessagePayload {
                id: req.id,
                sender_id: deleted.sender_id,
                group_id: deleted.group_id,
                ..Default::default()
            },
            emitted_at: Utc::now(),
        })
        .await;

    Ok(Json(EmptyResponse {
        access_token: ctx.access_token,
    }))
}

pub async fn get_conversation(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Json(req): Json<ConversationRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let key = conversation_key(ctx.user_id, req.receiver_id);

    if let Some(window) = state.cache.get(&key, req.created_at) {
        let messages = window
            .into_iter()
            .filter(|m| m.visible_to(ctx.user_id))
            .collect();
        return Ok(Json(MessagesResponse {
            messages,
            access_token: ctx.access_token,
        }));
    }

    let messages = state
        .db
        .get_conversation(ctx.user_id, req.receiver_id, req.created_at)
        .await
        .map_err(ApiError::internal)?;

    Ok(Json(MessagesResponse {
        messages,
        access_token: ctx.access_token,
    }))
}

pub async fn delete_conversation(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Json(req): Json<DeleteConversationRequest>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .db
        .delete_conversation(ctx.user_id, req.receiver_id)
        .await
        .map_err(ApiError::internal)?;

    state
        .cache
        .remove(&conversation_key(ctx.user_id, req.receiver_id));

    Ok(Json(EmptyResponse {
        access_token: ctx.access_token,
    }))
}

pub async fn get_conversations(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
) -> Result<impl IntoResponse, ApiError> {
    let conversations = state
        .db
        .list_conversations(ctx.user_id)
        .await
        .map_err(ApiError::internal)?
        .into_iter()
        .map(|row| ConversationSummary {
            peer_id: row.peer_id,
            peer_username: row.peer_username,
            last_message: row.last_message,
            last_message_at: row.last_message_at,
        })
        .collect();

    Ok(Json(ConversationsResponse {
        conversations,
        access_token: ctx.access_token,
    }))
}

pub async fn get_group_messages(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Json(req): Json<GroupMessagesRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let key = req.group_id.to_string();

    if let Some(window) = state.cache.get(&key, req.created_at) {
        // cached entries carry no per-member state; gate non-sender
        // views on the status rows
        let mut messages = Vec::with_capacity(window.len());
        for message in window {
            if message.sender_id == ctx.user_id {
                if message.sender_visible {
                    messages.push(message);
                }
            } else if state
                .db
                .is_group_message_visible(message.id, ctx.user_id)
                .await
                .map_err(ApiError::internal)?
            {
                messages.push(message);
            }
        }
        return Ok(Json(MessagesResponse {
            messages,
            access_token: ctx.access_token,
        }));
    }

    let messages = state
        .db
        .get_group_messages(req.group_id, ctx.user_id, req.created_at)
        .await
        .map_err(ApiError::internal)?;

    Ok(Json(MessagesResponse {
        messages,
        access_token: ctx.access_token,
    }))
}

pub async fn mark_message_received(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Json(req): Json<MarkMessageRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let updated_at = state
        .db
        .mark_message_received(req.message_id, ctx.user_id, req.sender_id)
        .await
        .map_err(ApiError::internal)?
        .ok_or_else(|| ApiError::bad_request("message not found"))?;

    state.cache.update(
        &conversation_key(req.sender_id, ctx.user_id),
        req.message_id,
        &MessageUpdate {
            received: true,
            updated_at,
            ..Default::default()
        },
    );

    let sender_phone = state
        .db
        .get_phonenumber_by_id(req.sender_id)
        .await
        .map_err(ApiError::internal)?
        .ok_or_else(|| ApiError::internal("sender not found"))?;

    state
        .emit_message_event(MessageEvent {
            kind: MessageEventKind::MarkMessageReceived,
            phonenumbers: vec![sender_phone],
            message: MessagePayload {
                id: req.message_id,
                receiver_id: Some(ctx.user_id),
                ..Default::default()
            },
            emitted_at: Utc::now(),
        })
        .await;

    Ok(Json(EmptyResponse {
        access_token: ctx.access_token,
    }))
}

pub async fn mark_message_read(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Json(req): Json<MarkMessageRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let updated_at = state
        .db
        .mark_message_read(req.message_id, ctx.user_id, req.sender_id)
        .await
        .map_err(ApiError::internal)?
        .ok_or_else(|| ApiError::bad_request("message not found"))?;

    state.cache.update(
        &conversation_key(req.sender_id, ctx.user_id),
        req.message_id,
        &MessageUpdate {
            received: true,
            read: true,
            updated_at,
            ..Default::default()
        },
    );

    let sender_phone = state
        .db
        .get_phonenumber_by_id(req.sender_id)
        .await
        .map_err(ApiError::internal)?
        .ok_or_else(|| ApiError::internal("sender not found"))?;

    state
        .emit_message_event(MessageEvent {
            kind: MessageEventKind::MarkMessageRead,
            phonenumbers: vec![sender_phone],
            message: MessagePayload {
                id: req.message_id,
                sender_id: req.sender_id,
                receiver_id: Some(ctx.user_id),
                ..Default::default()
            },
            emitted_at: Utc::now(),
        })
        .await;

    Ok(Json(EmptyResponse {
        access_token: ctx.access_token,
    }))
}

pub async fn mark_group_message_received(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Json(req): Json<MarkGroupMessageRequest>,
) -> Result<impl IntoResponse, ApiError> {
    mark_group_message(state, ctx, req, GroupMark::Received).await
}

pub async fn mark_group_message_read(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Json(req): Json<MarkGroupMessageRequest>,
) -> Result<impl IntoResponse, ApiError> {
    mark_group_message(state, ctx, req, GroupMark::Read).await
}

#[derive(Clone, Copy)]
enum GroupMark {
    Received,
    Read,
}

/// Update the member's status row; when the last recipient reaches
/// the state, flip the aggregate row and tell the sender.
async fn mark_group_message(
    state: AppState,
    ctx: AuthContext,
    req: MarkGroupMessageRequest,
    mark: GroupMark,
) -> Result<Json<EmptyResponse>, ApiError> {
    let marked = match mark {
        GroupMark::Received => {
            state
                .db
                .mark_group_message_received(req.message_id, ctx.user_id)
                .await
        }
        GroupMark::Read => {
            state
                .db
                .mark_group_message_read(req.message_id, ctx.user_id)
                .await
        }
    }
    .map_err(ApiError::internal)?;
    if !marked {
        return Err(ApiError::bad_request("not a recipient of this message"));
    }

    let (reached, total) = match mark {
        GroupMark::Received => state.db.group_received_counts(req.message_id).await,
        GroupMark::Read => state.db.group_read_counts(req.message_id).await,
    }
    .map_err(ApiError::internal)?;

    if total == 0 || reached < total {
        return Ok(Json(EmptyResponse {
            access_token: ctx.access_token,
        }));
    }

    let updated_at = match mark {
        GroupMark::Received => state.db.set_message_received(req.message_id).await,
        GroupMark::Read => state.db.set_message_read(req.message_id).await,
    }
    .map_err(ApiError::internal)?
    .unwrap_or_else(Utc::now);

    state.cache.update(
        &req.group_id.to_string(),
        req.message_id,
        &MessageUpdate {
            received: true,
            read: matches!(mark, GroupMark::Read),
            updated_at,
            ..Default::default()
        },
    );

    let message = state
        .db
        .get_message(req.message_id)
        .await
        .map_err(ApiError::internal)?
        .ok_or_else(|| ApiError::not_found("message not found"))?;
    let member = state
        .db
        .get_user_by_id(ctx.user_id)
        .await
        .map_err(ApiError::internal)?
        .ok_or_else(|| ApiError::internal("member not found"))?;
    let sender_phone = state
        .db
        .get_phonenumber_by_id(message.sender_id)
        .await
        .map_err(ApiError::internal)?
        .ok_or_else(|| ApiError::internal("sender not found"))?;

    state
        .emit_message_event(MessageEvent {
            kind: match mark {
                GroupMark::Received => MessageEventKind::GroupMessageReceived,
                GroupMark::Read => MessageEventKind::GroupMessageRead,
            },
            phonenumbers: vec![sender_phone],
            message: MessagePayload {
                id: req.message_id,
                group_id: Some(req.group_id),
                group_member_id: Some(ctx.user_id),
                group_member_username: Some(member.username),
                ..Default::default()
            },
            emitted_at: Utc::now(),
        })
        .await;

    Ok(Json(EmptyResponse {
        access_token: ctx.access_token,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_requires_exactly_one_destination() {
        assert!(MessageTarget::resolve(None, None).is_err());
        assert!(MessageTarget::resolve(Some(Uuid::new_v4()), Some(Uuid::new_v4())).is_err());
        assert!(matches!(
            MessageTarget::resolve(Some(Uuid::new_v4()), None),
            Ok(MessageTarget::User(_))
        ));
        assert!(matches!(
            MessageTarget::resolve(None, Some(Uuid::new_v4())),
            Ok(MessageTarget::Group(_))
        ));
    }

    #[test]
    fn cache_keys_follow_the_viewer_first_convention() {
        let viewer = Uuid::new_v4();
        let peer = Uuid::new_v4();
        let group = Uuid::new_v4();

        assert_eq!(
            MessageTarget::User(peer).cache_key(viewer),
            conversation_key(viewer, peer)
        );
        assert_eq!(
            MessageTarget::Group(group).cache_key(viewer),
            group.to_string()
        );
    }
}
