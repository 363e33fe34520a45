use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

use crate::{
    db::{DBClient, UserExt},
    error::{ExternalError, ServiceError},
    models::{
        eventmodel::{ChannelEventType, MembershipEvent, MembershipOutcome},
        usermodel::UserId,
    },
    service::{membership::MembershipProcessor, referral::validate_user_id},
};

/// Authoritative answer to "is this user in the channel right now".
#[async_trait]
pub trait MembershipOracle: Send + Sync {
    async fn is_current_member(&self, user_id: UserId) -> Result<bool, ExternalError>;
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub checked: usize,
    pub corrected: usize,
    pub failed: usize,
}

/// Corrects drift between stored membership and the oracle by replaying the
/// missing transition through the regular membership path.
#[derive(Clone)]
pub struct Reconciler {
    db_client: Arc<DBClient>,
    processor: MembershipProcessor,
    oracle: Arc<dyn MembershipOracle>,
}

impl Reconciler {
    pub fn new(
        db_client: Arc<DBClient>,
        processor: MembershipProcessor,
        oracle: Arc<dyn MembershipOracle>,
    ) -> Self {
        Self {
            db_client,
            processor,
            oracle,
        }
    }

    /// Returns the applied outcome, or `None` when the stored flag already
    /// agreed with the oracle.
    pub async fn reconcile(
        &self,
        user_id: UserId,
    ) -> Result<Option<MembershipOutcome>, ServiceError> {
        validate_user_id(user_id)?;

        let user = self
            .db_client
            .get_user(user_id)
            .await?
            .ok_or(ServiceError::NotRegistered(user_id))?;

        let is_member = self.oracle.is_current_member(user_id).await?;
        if is_member == user.is_channel_member {
            return Ok(None);
        }

        tracing::warn!(
            "Membership drift for user {}: stored {}, source says {}",
            user_id,
            user.is_channel_member,
            is_member
        );
        let event = MembershipEvent {
            user_id,
            kind: ChannelEventType::from_membership(is_member),
            sequence: None,
        };
        let outcome = self.processor.apply(event).await?;
        Ok(outcome.is_applied().then_some(outcome))
    }

    /// Sweep every known user. Per-user failures are counted, not propagated;
    /// only failing to list users aborts the sweep.
    pub async fn reconcile_all(&self) -> Result<ReconcileReport, ServiceError> {
        let mut report = ReconcileReport::default();

        for user_id in self.db_client.list_user_ids().await? {
            report.checked += 1;
            match self.reconcile(user_id).await {
                Ok(Some(_)) => report.corrected += 1,
                Ok(None) => {}
                Err(e) => {
                    report.failed += 1;
                    tracing::error!("Reconciliation failed for user {}: {}", user_id, e);
                }
            }
        }

        tracing::info!(
            "Reconciled {} users: {} corrected, {} failed",
            report.checked,
            report.corrected,
            report.failed
        );
        Ok(report)
    }
}

#[cfg(test)]
pub mod testing {
    use std::collections::HashSet;

    use super::*;

    /// Oracle backed by a fixed member set; ids in `unreachable` error out.
    #[derive(Debug, Default)]
    pub struct FixedOracle {
        pub members: HashSet<UserId>,
        pub unreachable: HashSet<UserId>,
    }

    #[async_trait]
    impl MembershipOracle for FixedOracle {
        async fn is_current_member(&self, user_id: UserId) -> Result<bool, ExternalError> {
            if self.unreachable.contains(&user_id) {
                return Err(ExternalError::new("chat member lookup failed"));
            }
            Ok(self.members.contains(&user_id))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::{testing::FixedOracle, *};
    use crate::{
        db::ReferralExt,
        models::usermodel::UserAttrs,
        service::{
            notification::testing::RecordingNotifier,
            referral::{CodeGenerator, HashedCodeGenerator, ReferralService},
        },
    };

    async fn setup(oracle: FixedOracle) -> (Arc<DBClient>, MembershipProcessor, Reconciler) {
        let db = Arc::new(DBClient::in_memory().await.unwrap());
        let codes: Arc<dyn CodeGenerator> = Arc::new(HashedCodeGenerator::default());
        let notifier = Arc::new(RecordingNotifier::default());

        let referrals = ReferralService::new(db.clone(), codes.clone(), 5, notifier.clone(), 5);
        let referrer = referrals.register_user(1, &UserAttrs::default()).await.unwrap();
        for id in [2, 3] {
            referrals
                .on_first_contact(id, &UserAttrs::default(), Some(&referrer.user().referral_code))
                .await
                .unwrap();
        }

        let processor = MembershipProcessor::new(db.clone(), codes, 5, notifier, 5);
        let reconciler = Reconciler::new(db.clone(), processor.clone(), Arc::new(oracle));
        (db, processor, reconciler)
    }

    #[tokio::test]
    async fn missed_leave_is_corrected() {
        let (db, processor, reconciler) = setup(FixedOracle::default()).await;
        processor.handle_joined(2).await.unwrap();

        let outcome = reconciler.reconcile(2).await.unwrap().unwrap();
        assert_eq!(outcome.kind, ChannelEventType::Left);
        assert_eq!(outcome.decreased_referrers, vec![1]);
        assert_eq!(db.count_active(1).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn agreeing_state_is_left_alone() {
        let (_, _, reconciler) = setup(FixedOracle::default()).await;
        assert_eq!(reconciler.reconcile(2).await.unwrap(), None);
    }

    #[tokio::test]
    async fn unknown_user_is_not_found() {
        let (_, _, reconciler) = setup(FixedOracle::default()).await;
        assert!(matches!(
            reconciler.reconcile(40).await,
            Err(ServiceError::NotRegistered(40))
        ));
    }

    #[tokio::test]
    async fn sweep_counts_corrections_and_failures() {
        let oracle = FixedOracle {
            members: HashSet::from([2]),
            unreachable: HashSet::from([3]),
        };
        let (db, _, reconciler) = setup(oracle).await;

        let report = reconciler.reconcile_all().await.unwrap();
        assert_eq!(
            report,
            ReconcileReport {
                checked: 3,
                corrected: 1,
                failed: 1
            }
        );
        assert_eq!(db.count_active(1).await.unwrap(), 1);
    }
}
