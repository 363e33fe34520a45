use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

use crate::{
    error::ServiceError,
    models::{
        eventmodel::{ChannelEventType, MembershipEvent},
        usermodel::{User, UserAttrs, UserId},
    },
};

/// One line of input to the binary, tagged by `op`.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Command {
    FirstContact(FirstContactDto),
    Membership(MembershipEventDto),
    Status(ProgressQueryDto),
    Claim(ProgressQueryDto),
    Stats(AdminQueryDto),
    Referrals(UserQueryDto),
}

impl Command {
    pub fn op(&self) -> &'static str {
        match self {
            Command::FirstContact(_) => "first_contact",
            Command::Membership(_) => "membership",
            Command::Status(_) => "status",
            Command::Claim(_) => "claim",
            Command::Stats(_) => "stats",
            Command::Referrals(_) => "referrals",
        }
    }
}

#[derive(Validate, Debug, Default, Clone, Serialize, Deserialize)]
pub struct FirstContactDto {
    #[validate(range(min = 1, message = "user_id must be positive"))]
    pub user_id: i64,

    #[validate(length(max = 64, message = "username is too long"))]
    pub username: Option<String>,

    #[validate(length(max = 128, message = "first_name is too long"))]
    pub first_name: Option<String>,

    #[validate(length(max = 128, message = "last_name is too long"))]
    pub last_name: Option<String>,

    #[validate(
        length(min = 1, max = 128, message = "referral_code must be 1-128 characters"),
        custom = "validate_code_charset"
    )]
    pub referral_code: Option<String>,
}

impl FirstContactDto {
    pub fn attrs(&self) -> UserAttrs {
        UserAttrs {
            username: self.username.clone(),
            first_name: self.first_name.clone(),
            last_name: self.last_name.clone(),
        }
    }
}

fn validate_code_charset(code: &str) -> Result<(), ValidationError> {
    if code
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        Ok(())
    } else {
        Err(ValidationError::new("referral_code_charset"))
    }
}

#[derive(Validate, Debug, Clone, Serialize, Deserialize)]
pub struct MembershipEventDto {
    #[validate(range(min = 1, message = "user_id must be positive"))]
    pub user_id: i64,

    pub event: ChannelEventType,

    #[validate(range(min = 0, message = "sequence must not be negative"))]
    pub sequence: Option<i64>,
}

impl From<&MembershipEventDto> for MembershipEvent {
    fn from(dto: &MembershipEventDto) -> Self {
        MembershipEvent {
            user_id: dto.user_id,
            kind: dto.event,
            sequence: dto.sequence,
        }
    }
}

#[derive(Validate, Debug, Default, Clone, Serialize, Deserialize)]
pub struct ProgressQueryDto {
    #[validate(range(min = 1, message = "user_id must be positive"))]
    pub user_id: i64,

    /// Falls back to the configured target.
    pub target: Option<i64>,
}

#[derive(Validate, Debug, Default, Clone, Serialize, Deserialize)]
pub struct UserQueryDto {
    #[validate(range(min = 1, message = "user_id must be positive"))]
    pub user_id: i64,
}

#[derive(Validate, Debug, Default, Clone, Serialize, Deserialize)]
pub struct AdminQueryDto {
    #[validate(range(min = 1, message = "requester_id must be positive"))]
    pub requester_id: i64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FilterUserDto {
    pub user_id: UserId,
    pub display_name: String,
    pub username: Option<String>,
    pub referral_code: String,
    pub referred_by: Option<UserId>,
    pub is_channel_member: bool,
    pub reward_claimed: bool,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
}

impl FilterUserDto {
    pub fn filter_user(user: &User) -> Self {
        FilterUserDto {
            user_id: user.user_id,
            display_name: user.display_name().to_string(),
            username: user.username.clone(),
            referral_code: user.referral_code.to_owned(),
            referred_by: user.referred_by,
            is_channel_member: user.is_channel_member,
            reward_claimed: user.reward_claimed,
            created_at: user.created_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct Response<T: Serialize> {
    pub status: &'static str,
    pub op: &'static str,
    pub data: T,
}

impl<T: Serialize> Response<T> {
    pub fn success(op: &'static str, data: T) -> Self {
        Response {
            status: "success",
            op,
            data,
        }
    }
}

/// `fail` for business outcomes the caller should act on, `error` for faults.
#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct ErrorResponse {
    pub status: String,
    pub kind: String,
    pub code: String,
    pub message: String,
}

impl ErrorResponse {
    pub fn fail(kind: &str, code: &str, message: impl Into<String>) -> Self {
        ErrorResponse {
            status: "fail".to_string(),
            kind: kind.to_string(),
            code: code.to_string(),
            message: message.into(),
        }
    }
}

impl From<ServiceError> for ErrorResponse {
    fn from(err: ServiceError) -> Self {
        let status = if err.is_expected() { "fail" } else { "error" };
        ErrorResponse {
            status: status.to_string(),
            kind: err.kind().to_str().to_string(),
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}
