use std::sync::Arc;

use crate::{
    db::{DBClient, ReferralExt},
    error::ServiceError,
    models::{referralmodel::ProgressView, usermodel::UserId},
};

/// Derives referral progress from the ledger on every call; nothing is cached.
#[derive(Debug, Clone)]
pub struct ProgressEvaluator {
    db_client: Arc<DBClient>,
}

impl ProgressEvaluator {
    pub fn new(db_client: Arc<DBClient>) -> Self {
        Self { db_client }
    }

    /// Unknown users simply have no edges, so they evaluate to zero progress.
    pub async fn evaluate(
        &self,
        user_id: UserId,
        target: i64,
    ) -> Result<ProgressView, ServiceError> {
        let counts = self.db_client.get_referral_counts(user_id).await?;
        Ok(ProgressView::compute(counts, target))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        db::UserExt,
        models::{referralmodel::ReferralCounts, usermodel::UserAttrs},
    };

    fn counts(active: i64, total: i64) -> ReferralCounts {
        ReferralCounts { active, total }
    }

    #[test]
    fn compute_caps_percentage_and_remaining() {
        let view = ProgressView::compute(counts(7, 9), 5);
        assert_eq!(view.remaining, 0);
        assert!(view.target_reached);
        assert_eq!(view.progress_percentage, 100.0);

        let view = ProgressView::compute(counts(1, 4), 4);
        assert_eq!(view.remaining, 3);
        assert!(!view.target_reached);
        assert_eq!(view.progress_percentage, 25.0);
    }

    #[test]
    fn non_positive_target_has_zero_percentage() {
        let zero = ProgressView::compute(counts(3, 3), 0);
        assert_eq!(zero.progress_percentage, 0.0);
        assert!(zero.target_reached);
        assert_eq!(zero.remaining, 0);

        let negative = ProgressView::compute(ReferralCounts::default(), -2);
        assert_eq!(negative.progress_percentage, 0.0);
        assert_eq!(negative.remaining, 0);
    }

    #[test]
    fn extreme_targets_do_not_overflow() {
        let two_active = counts(2, 3);

        let lowest = ProgressView::compute(two_active, i64::MIN);
        assert_eq!(lowest.remaining, 0);
        assert!(lowest.target_reached);
        assert_eq!(lowest.progress_percentage, 0.0);

        let highest = ProgressView::compute(two_active, i64::MAX);
        assert_eq!(highest.remaining, i64::MAX - 2);
        assert!(!highest.target_reached);
    }

    #[tokio::test]
    async fn evaluates_from_current_edges() {
        let db = Arc::new(DBClient::in_memory().await.unwrap());
        for id in 1..=3 {
            db.create_user(id, &UserAttrs::default(), &format!("ref_{id}")).await.unwrap();
        }
        db.add_edge(1, 2, true).await.unwrap();
        db.add_edge(1, 3, false).await.unwrap();

        let evaluator = ProgressEvaluator::new(db);
        let view = evaluator.evaluate(1, 2).await.unwrap();
        assert_eq!(view.active_referrals, 1);
        assert_eq!(view.total_referrals, 2);
        assert_eq!(view.remaining, 1);
        assert_eq!(view.progress_percentage, 50.0);
    }

    #[tokio::test]
    async fn unknown_user_with_zero_target_is_not_an_error() {
        let db = Arc::new(DBClient::in_memory().await.unwrap());
        let view = ProgressEvaluator::new(db).evaluate(404, 0).await.unwrap();
        assert_eq!(view.progress_percentage, 0.0);
        assert_eq!(view.total_referrals, 0);
    }
}
