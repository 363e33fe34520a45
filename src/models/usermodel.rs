use chrono::prelude::*;
use serde::{Deserialize, Serialize};

/// Externally assigned user id (the messaging platform's numeric id).
pub type UserId = i64;

#[derive(Debug, Deserialize, Serialize, sqlx::FromRow, Clone, PartialEq)]
pub struct User {
    pub user_id: UserId,
    pub username: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub referral_code: String,
    pub referred_by: Option<UserId>,
    pub is_channel_member: bool,
    pub reward_claimed: bool,

    /// Sequence of the last membership event applied to this user, when the
    /// event source supplies one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub membership_seq: Option<i64>,

    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub reward_claimed_at: Option<DateTime<Utc>>,
}

impl User {
    pub fn display_name(&self) -> &str {
        self.first_name
            .as_deref()
            .or(self.username.as_deref())
            .unwrap_or("User")
    }

    pub fn membership_state(&self) -> MembershipState {
        if self.is_channel_member {
            MembershipState::Member
        } else {
            MembershipState::NonMember
        }
    }
}

/// Optional profile fields captured on first contact.
#[derive(Debug, Default, Clone, Deserialize, Serialize, PartialEq)]
pub struct UserAttrs {
    pub username: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MembershipState {
    Unknown,
    Member,
    NonMember,
}

impl MembershipState {
    pub fn of(user: Option<&User>) -> Self {
        user.map(User::membership_state)
            .unwrap_or(MembershipState::Unknown)
    }

    pub fn to_str(&self) -> &str {
        match self {
            MembershipState::Unknown => "unknown",
            MembershipState::Member => "member",
            MembershipState::NonMember => "non_member",
        }
    }
}

/// Result of an idempotent create: the stored record plus whether this call
/// inserted it.
#[derive(Debug, Clone, PartialEq)]
pub enum CreateUserOutcome {
    Created(User),
    Existing(User),
}

impl CreateUserOutcome {
    pub fn user(&self) -> &User {
        match self {
            CreateUserOutcome::Created(user) | CreateUserOutcome::Existing(user) => user,
        }
    }

    pub fn into_user(self) -> User {
        match self {
            CreateUserOutcome::Created(user) | CreateUserOutcome::Existing(user) => user,
        }
    }

    pub fn was_created(&self) -> bool {
        matches!(self, CreateUserOutcome::Created(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetReferrerOutcome {
    Applied,
    /// Carries the referrer already on record.
    AlreadyReferred(UserId),
    SelfReferral,
    NotRegistered,
}
