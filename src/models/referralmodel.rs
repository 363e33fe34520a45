use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::usermodel::UserId;

#[derive(Debug, Deserialize, Serialize, sqlx::FromRow, Clone, PartialEq)]
pub struct ReferralEdge {
    pub referrer_id: UserId,
    pub referred_id: UserId,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EdgeInsert {
    Inserted(ReferralEdge),
    Duplicate,
}

/// A referred user as seen from the referrer's side.
#[derive(Debug, Deserialize, Serialize, sqlx::FromRow, Clone, PartialEq)]
pub struct ReferralUser {
    pub referred_id: UserId,
    pub username: Option<String>,
    pub first_name: Option<String>,
    pub is_active: bool,
    pub referred_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReferralCounts {
    pub active: i64,
    pub total: i64,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq)]
pub struct ProgressView {
    pub active_referrals: i64,
    pub total_referrals: i64,
    pub target: i64,
    pub remaining: i64,
    pub target_reached: bool,
    pub progress_percentage: f64,
}

impl ProgressView {
    pub fn compute(counts: ReferralCounts, target: i64) -> Self {
        let active = counts.active;
        let progress_percentage = if target > 0 {
            (active as f64 / target as f64 * 100.0).min(100.0)
        } else {
            0.0
        };

        ProgressView {
            active_referrals: active,
            total_referrals: counts.total,
            target,
            remaining: target.saturating_sub(active).max(0),
            target_reached: active >= target,
            progress_percentage,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, sqlx::FromRow, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub total_users: i64,
    pub channel_members: i64,
    pub active_referrals: i64,
    pub total_referrals: i64,
    pub rewards_claimed: i64,
}

#[derive(Debug, Deserialize, Serialize, sqlx::FromRow, Clone, PartialEq)]
pub struct InviteLink {
    pub user_id: UserId,
    pub referral_code: String,
    pub invite_link: String,
    pub link_name: Option<String>,
    pub created_at: DateTime<Utc>,
}
