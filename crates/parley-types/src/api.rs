use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::Message;

// -- Auth --

#[derive(Debug, Deserialize)]
pub struct SendOtpRequest {
    pub phonenumber: String,
}

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub username: String,
    pub phonenumber: String,
    pub password: String,
    pub otp: String,
}

#[derive(Debug, Serialize)]
pub struct RegisterResponse {
    pub id: Uuid,
    pub username: String,
    pub phonenumber: String,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub phonenumber: String,
    pub password: String,
}

/// Login hands back a bearer token plus everything that arrived while
/// the user was offline. The `one_to_messages` wire name is what
/// clients already parse.
#[derive(Debug, Serialize)]
pub struct LoginResponse {
    #[serde(rename = "one_to_messages", skip_serializing_if = "Option::is_none")]
    pub one_to_one_messages: Option<Vec<Message>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_messages: Option<Vec<Message>>,
    pub access_token: String,
}

// -- Users --

#[derive(Debug, Deserialize)]
pub struct UpdateUsernameRequest {
    pub username: String,
}

#[derive(Debug, Serialize)]
pub struct UpdateUsernameResponse {
    pub username: String,
    pub access_token: String,
}

#[derive(Debug, Deserialize)]
pub struct UpdatePhonenumberRequest {
    pub phonenumber: String,
    pub otp: String,
}

#[derive(Debug, Deserialize)]
pub struct UpdatePasswordRequest {
    pub password: String,
    pub phonenumber: String,
    pub otp: String,
}

#[derive(Debug, Deserialize)]
pub struct UserInfoRequest {
    pub phonenumber: String,
}

#[derive(Debug, Serialize)]
pub struct UserInfoResponse {
    pub username: String,
    pub created_at: String,
    pub access_token: String,
}

// -- Messages --

#[derive(Debug, Deserialize)]
pub struct CreateMessageRequest {
    pub description: String,
    #[serde(default)]
    pub receiver_id: Option<Uuid>,
    #[serde(default)]
    pub group_id: Option<Uuid>,
}

#[derive(Debug, Serialize)]
pub struct CreateMessageResponse {
    pub id: Uuid,
    pub description: String,
    pub updated_at: String,
    pub access_token: String,
}

#[derive(Debug, Deserialize)]
pub struct UpdateMessageRequest {
    pub id: Uuid,
    pub description: String,
    #[serde(default)]
    pub receiver_id: Option<Uuid>,
    #[serde(default)]
    pub group_id: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
pub struct DeleteMessageRequest {
    pub id: Uuid,
    #[serde(default)]
    pub receiver_id: Option<Uuid>,
    #[serde(default)]
    pub group_id: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
pub struct ConversationRequest {
    pub receiver_id: Uuid,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct DeleteConversationRequest {
    pub receiver_id: Uuid,
}

#[derive(Debug, Serialize)]
pub struct MessagesResponse {
    pub messages: Vec<Message>,
    pub access_token: String,
}

/// One row of `GET /message/conversations`: a peer the user has a
/// visible exchange with, plus the most recent visible message.
#[derive(Debug, Serialize)]
pub struct ConversationSummary {
    pub peer_id: Uuid,
    pub peer_username: String,
    pub last_message: String,
    pub last_message_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct ConversationsResponse {
    pub conversations: Vec<ConversationSummary>,
    pub access_token: String,
}

#[derive(Debug, Deserialize)]
pub struct GroupMessagesRequest {
    pub group_id: Uuid,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct MarkMessageRequest {
    pub message_id: Uuid,
    pub sender_id: Uuid,
}

#[derive(Debug, Deserialize)]
pub struct MarkGroupMessageRequest {
    pub message_id: Uuid,
    pub group_id: Uuid,
}

// -- Groups --

#[derive(Debug, Deserialize)]
pub struct CreateGroupRequest {
    pub name: String,
}

#[derive(Debug, Serialize)]
pub struct CreateGroupResponse {
    pub id: Uuid,
    pub name: String,
    pub created_at: String,
    pub access_token: String,
}

#[derive(Debug, Deserialize)]
pub struct UpdateGroupRequest {
    pub group_id: Uuid,
    pub name: String,
}

#[derive(Debug, Serialize)]
pub struct UpdateGroupResponse {
    pub name: String,
    pub updated_at: String,
    pub access_token: String,
}

#[derive(Debug, Deserialize)]
pub struct GroupIdRequest {
    pub group_id: Uuid,
}

#[derive(Debug, Deserialize)]
pub struct AddGroupMemberRequest {
    pub member_phonenumber: String,
    pub group_id: Uuid,
}

#[derive(Debug, Deserialize)]
pub struct GroupMemberRequest {
    pub user_id: Uuid,
    pub group_id: Uuid,
}

#[derive(Debug, Serialize)]
pub struct GroupMember {
    pub id: Uuid,
    pub username: String,
    pub phonenumber: String,
}

#[derive(Debug, Serialize)]
pub struct GroupMembersResponse {
    pub members: Vec<GroupMember>,
    pub access_token: String,
}

/// Responses that only need to echo the (possibly refreshed) token.
#[derive(Debug, Serialize)]
pub struct EmptyResponse {
    pub access_token: String,
}
