use async_trait::async_trait;
use serde::Serialize;

use crate::{
    error::ExternalError,
    models::{referralmodel::ProgressView, usermodel::UserId},
};

/// Structured event emitted after a committed state change. Rendering and
/// delivery belong to the collaborator.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Notification {
    ReferralAttributed {
        referred_id: UserId,
        progress: ProgressView,
    },
    ReferralJoined {
        referred_id: UserId,
        progress: ProgressView,
    },
    ReferralLost {
        referred_id: UserId,
        progress: ProgressView,
    },
    TargetReached {
        progress: ProgressView,
    },
}

impl Notification {
    pub fn kind(&self) -> &'static str {
        match self {
            Notification::ReferralAttributed { .. } => "referral_attributed",
            Notification::ReferralJoined { .. } => "referral_joined",
            Notification::ReferralLost { .. } => "referral_lost",
            Notification::TargetReached { .. } => "target_reached",
        }
    }

    pub fn progress(&self) -> &ProgressView {
        match self {
            Notification::ReferralAttributed { progress, .. }
            | Notification::ReferralJoined { progress, .. }
            | Notification::ReferralLost { progress, .. }
            | Notification::TargetReached { progress } => progress,
        }
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(
        &self,
        user_id: UserId,
        notification: Notification,
    ) -> Result<(), ExternalError>;
}

/// Logs every notification; the default sink when nothing renders them.
#[derive(Debug, Clone, Default)]
pub struct TracingNotifier;

#[async_trait]
impl Notifier for TracingNotifier {
    async fn notify(
        &self,
        user_id: UserId,
        notification: Notification,
    ) -> Result<(), ExternalError> {
        let payload = serde_json::to_string(&notification)
            .map_err(|e| ExternalError::new(e.to_string()))?;
        let progress = notification.progress();
        tracing::info!(
            user_id,
            kind = notification.kind(),
            active = progress.active_referrals,
            target = progress.target,
            %payload,
            "notification"
        );
        Ok(())
    }
}

/// Deliver a batch, logging failures. State is already committed, so a
/// failed delivery never rolls anything back.
pub async fn deliver(notifier: &dyn Notifier, batch: Vec<(UserId, Notification)>) {
    for (user_id, notification) in batch {
        let kind = notification.kind();
        if let Err(e) = notifier.notify(user_id, notification).await {
            tracing::warn!("Failed to deliver {} notification to user {}: {}", kind, user_id, e);
        }
    }
}

/// Whether a referrer who now stands at `progress` has just crossed the target
/// by gaining one active referral.
pub fn crossed_target(progress: &ProgressView) -> bool {
    progress.target > 0 && progress.active_referrals == progress.target
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::referralmodel::ReferralCounts;

    struct FailingNotifier;

    #[async_trait]
    impl Notifier for FailingNotifier {
        async fn notify(&self, _: UserId, _: Notification) -> Result<(), ExternalError> {
            Err(ExternalError::new("bot blocked by user"))
        }
    }

    fn counts(active: i64, total: i64) -> ReferralCounts {
        ReferralCounts { active, total }
    }

    #[test]
    fn crossing_only_at_exact_target() {
        let at = ProgressView::compute(counts(2, 3), 2);
        let above = ProgressView::compute(counts(3, 3), 2);
        let zero_target = ProgressView::compute(counts(0, 0), 0);

        assert!(crossed_target(&at));
        assert!(!crossed_target(&above));
        assert!(!crossed_target(&zero_target));
    }

    #[test]
    fn serializes_with_kind_tag() {
        let progress = ProgressView::compute(counts(1, 1), 2);
        let value = serde_json::to_value(Notification::ReferralLost {
            referred_id: 9,
            progress,
        })
        .unwrap();
        assert_eq!(value["kind"], "referral_lost");
        assert_eq!(value["referred_id"], 9);
        assert_eq!(value["progress"]["remaining"], 1);
    }

    #[tokio::test]
    async fn delivery_failures_are_swallowed() {
        let progress = ProgressView::compute(ReferralCounts::default(), 1);
        deliver(
            &FailingNotifier,
            vec![(1, Notification::TargetReached { progress })],
        )
        .await;
    }
}
