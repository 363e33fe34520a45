use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::{
    db::{DBClient, ReferralExt, UserExt},
    error::ServiceError,
    models::{referralmodel::ProgressView, usermodel::UserId},
};

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ClaimReceipt {
    pub user_id: UserId,
    pub progress: ProgressView,
    #[serde(rename = "claimedAt")]
    pub claimed_at: DateTime<Utc>,
}

/// One-shot reward claim. The eligibility check and the claim flag are
/// written under the write gate, so two concurrent claims cannot both pass.
#[derive(Debug, Clone)]
pub struct RewardGate {
    db_client: Arc<DBClient>,
}

impl RewardGate {
    pub fn new(db_client: Arc<DBClient>) -> Self {
        Self { db_client }
    }

    pub async fn claim(&self, user_id: UserId, target: i64) -> Result<ClaimReceipt, ServiceError> {
        let mut tx = self.db_client.begin_write().await?;

        let user = self
            .db_client
            .get_user_tx(user_id, &mut tx)
            .await?
            .ok_or(ServiceError::NotRegistered(user_id))?;

        if user.reward_claimed {
            return Err(ServiceError::AlreadyClaimed(user_id));
        }

        let counts = self
            .db_client
            .get_referral_counts_tx(user_id, &mut tx)
            .await?;
        let progress = ProgressView::compute(counts, target);
        if !progress.target_reached {
            return Err(ServiceError::TargetNotReached {
                active: progress.active_referrals,
                target: progress.target,
            });
        }

        self.db_client.mark_reward_claimed_tx(user_id, &mut tx).await?;
        let claimed_at = self
            .db_client
            .get_user_tx(user_id, &mut tx)
            .await?
            .and_then(|u| u.reward_claimed_at)
            .unwrap_or_else(Utc::now);
        tx.commit().await?;

        tracing::info!(
            "User {} claimed the referral reward with {}/{} active referrals",
            user_id,
            progress.active_referrals,
            progress.target
        );

        Ok(ClaimReceipt {
            user_id,
            progress,
            claimed_at,
        })
    }
}
