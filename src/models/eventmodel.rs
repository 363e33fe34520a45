use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::usermodel::UserId;

#[derive(Debug, Deserialize, Serialize, Clone, Copy, sqlx::Type, PartialEq, Eq)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ChannelEventType {
    Joined,
    Left,
}

impl ChannelEventType {
    pub fn to_str(&self) -> &str {
        match self {
            ChannelEventType::Joined => "joined",
            ChannelEventType::Left => "left",
        }
    }

    /// The membership flag this event assigns.
    pub fn implied_membership(&self) -> bool {
        matches!(self, ChannelEventType::Joined)
    }

    pub fn from_membership(is_member: bool) -> Self {
        if is_member {
            ChannelEventType::Joined
        } else {
            ChannelEventType::Left
        }
    }
}

/// Row of the append-only `channel_events` audit log.
#[derive(Debug, Deserialize, Serialize, sqlx::FromRow, Clone, PartialEq)]
pub struct ChannelEvent {
    pub id: i64,
    pub user_id: UserId,
    pub event_type: ChannelEventType,
    pub sequence: Option<i64>,
    pub applied: bool,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
pub struct MembershipEvent {
    pub user_id: UserId,
    pub kind: ChannelEventType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence: Option<i64>,
}

impl MembershipEvent {
    pub fn joined(user_id: UserId) -> Self {
        MembershipEvent {
            user_id,
            kind: ChannelEventType::Joined,
            sequence: None,
        }
    }

    pub fn left(user_id: UserId) -> Self {
        MembershipEvent {
            user_id,
            kind: ChannelEventType::Left,
            sequence: None,
        }
    }

    pub fn with_sequence(mut self, sequence: i64) -> Self {
        self.sequence = Some(sequence);
        self
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Transition {
    Applied,
    /// Stored membership already matched the event.
    Duplicate,
    /// Event sequence was not newer than the last applied one.
    Stale,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct MembershipOutcome {
    pub user_id: UserId,
    pub kind: ChannelEventType,
    pub transition: Transition,
    /// Referrer whose edge was activated by a join.
    pub activated_referrer: Option<UserId>,
    /// Referrers whose active count dropped because of a leave.
    pub decreased_referrers: Vec<UserId>,
}

impl MembershipOutcome {
    pub fn unchanged(event: &MembershipEvent, transition: Transition) -> Self {
        MembershipOutcome {
            user_id: event.user_id,
            kind: event.kind,
            transition,
            activated_referrer: None,
            decreased_referrers: Vec::new(),
        }
    }

    pub fn is_applied(&self) -> bool {
        self.transition == Transition::Applied
    }
}
