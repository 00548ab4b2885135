use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::{Extension, Json};
use chrono::Utc;
use tracing::warn;
use uuid::Uuid;

use parley_gateway::codec::rfc1123;
use parley_gateway::events::{GroupAction, GroupEvent, GroupEventKind};
use parley_types::api::{
    AddGroupMemberRequest, CreateGroupRequest, CreateGroupResponse, EmptyResponse, GroupIdRequest,
    GroupMember, GroupMemberRequest, GroupMembersResponse, UpdateGroupRequest,
    UpdateGroupResponse,
};

use crate::error::ApiError;
use crate::middleware::AuthContext;
use crate::state::{ApiState, AppState};

async fn require_admin(state: &ApiState, group_id: Uuid, user_id: Uuid) -> Result<(), ApiError> {
    if state
        .db
        .is_group_admin(group_id, user_id)
        .await
        .map_err(ApiError::internal)?
    {
        Ok(())
    } else {
        Err(ApiError::unauthorized("requesting user is not group admin"))
    }
}

/// Build and emit a group event describing `affected_user`, fanned
/// out to the whole group.
async fn emit_group_action(
    state: &ApiState,
    kind: GroupEventKind,
    group_id: Uuid,
    affected_user: Uuid,
) -> Result<(), ApiError> {
    let user = state
        .db
        .get_user_by_id(affected_user)
        .await
        .map_err(ApiError::internal)?
        .ok_or_else(|| ApiError::internal("affected user not found"))?;

    let phonenumbers = state
        .db
        .group_member_phonenumbers(group_id)
        .await
        .map_err(ApiError::internal)?;

    state
        .emit_group_event(GroupEvent {
            kind,
            group: GroupAction {
                id: group_id,
                username: user.username,
                phonenumber: user.phonenumber,
            },
            phonenumbers,
            emitted_at: Utc::now(),
        })
        .await;

    Ok(())
}

/// The creator becomes the group's first member and admin.
pub async fn create_group(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Json(req): Json<CreateGroupRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if req.name.is_empty() {
        return Err(ApiError::not_acceptable("empty name field"));
    }

    let group = state
        .db
        .create_group(&req.name)
        .await
        .map_err(|e| ApiError::bad_request(e.to_string()))?;

    let setup = async {
        state.db.add_group_member(group.id, ctx.user_id).await?;
        state.db.make_group_admin(group.id, ctx.user_id).await?;
        Ok::<_, anyhow::Error>(())
    };
    if let Err(e) = setup.await {
        // half-created group is useless; tear it down
        if let Err(remove_err) = state.db.delete_group(group.id).await {
            warn!(group_id = %group.id, error = %remove_err, "failed to remove group");
        }
        return Err(ApiError::internal(e));
    }

    Ok((
        StatusCode::CREATED,
        Json(CreateGroupResponse {
            id: group.id,
            name: group.name,
            created_at: rfc1123(group.created_at),
            access_token: ctx.access_token,
        }),
    ))
}

pub async fn update_group(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Json(req): Json<UpdateGroupRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if req.name.is_empty() {
        return Err(ApiError::not_acceptable("empty name field"));
    }
    require_admin(&state, req.group_id, ctx.user_id).await?;

    let group = state
        .db
        .update_group(req.group_id, &req.name)
        .await
        .map_err(ApiError::internal)?
        .ok_or_else(|| ApiError::not_found("group not found"))?;

    Ok(Json(UpdateGroupResponse {
        name: group.name,
        updated_at: rfc1123(group.updated_at),
        access_token: ctx.access_token,
    }))
}

pub async fn remove_group(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Json(req): Json<GroupIdRequest>,
) -> Result<impl IntoResponse, ApiError> {
    require_admin(&state, req.group_id, ctx.user_id).await?;

    state
        .db
        .delete_group(req.group_id)
        .await
        .map_err(ApiError::internal)?;

    // the whole window goes with the group
    state.cache.remove(&req.group_id.to_string());

    Ok(Json(EmptyResponse {
        access_token: ctx.access_token,
    }))
}

pub async fn get_members(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Json(req): Json<GroupIdRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let members = state
        .db
        .get_group_members(req.group_id, ctx.user_id)
        .await
        .map_err(|e| ApiError::bad_request(e.to_string()))?
        .into_iter()
        .map(|m| GroupMember {
            id: m.id,
            username: m.username,
            phonenumber: m.phonenumber,
        })
        .collect();

    Ok(Json(GroupMembersResponse {
        members,
        access_token: ctx.access_token,
    }))
}

pub async fn add_user(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Json(req): Json<AddGroupMemberRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if !crate::validate::valid_phonenumber(&req.member_phonenumber) {
        return Err(ApiError::not_acceptable("invalid member phonenumber"));
    }

    let user = state
        .db
        .get_user_by_phonenumber(&req.member_phonenumber)
        .await
        .map_err(ApiError::internal)?
        .ok_or_else(|| ApiError::not_found("user not found"))?;

    require_admin(&state, req.group_id, ctx.user_id).await?;

    state
        .db
        .add_group_member(req.group_id, user.id)
        .await
        .map_err(ApiError::internal)?;

    // a returning member sees the group's history again
    state
        .db
        .restore_member_visibility(req.group_id, user.id)
        .await
        .map_err(ApiError::internal)?;

    emit_group_action(&state, GroupEventKind::AddUserToGroup, req.group_id, user.id).await?;

    Ok(Json(EmptyResponse {
        access_token: ctx.access_token,
    }))
}

pub async fn remove_member(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Json(req): Json<GroupMemberRequest>,
) -> Result<impl IntoResponse, ApiError> {
    require_admin(&state, req.group_id, ctx.user_id).await?;

    state
        .db
        .remove_group_member(req.group_id, req.user_id)
        .await
        .map_err(ApiError::internal)?;

    emit_group_action(
        &state,
        GroupEventKind::RemoveUserFromGroup,
        req.group_id,
        req.user_id,
    )
    .await?;

    Ok(Json(EmptyResponse {
        access_token: ctx.access_token,
    }))
}

pub async fn make_admin(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Json(req): Json<GroupMemberRequest>,
) -> Result<impl IntoResponse, ApiError> {
    require_admin(&state, req.group_id, ctx.user_id).await?;

    let promoted = state
        .db
        .make_group_admin(req.group_id, req.user_id)
        .await
        .map_err(ApiError::internal)?;
    if !promoted {
        return Err(ApiError::bad_request("user is not a group member"));
    }

    emit_group_action(&state, GroupEventKind::MadeAdmin, req.group_id, req.user_id).await?;

    Ok(Json(EmptyResponse {
        access_token: ctx.access_token,
    }))
}

pub async fn remove_admin(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Json(req): Json<GroupMemberRequest>,
) -> Result<impl IntoResponse, ApiError> {
    require_admin(&state, req.group_id, ctx.user_id).await?;

    state
        .db
        .remove_group_admin(req.group_id, req.user_id)
        .await
        .map_err(ApiError::internal)?;

    emit_group_action(&state, GroupEventKind::RemoveAdmin, req.group_id, req.user_id).await?;

    Ok(Json(EmptyResponse {
        access_token: ctx.access_token,
    }))
}
