use std::sync::Arc;

use crate::{
    db::{ChannelEventExt, DBClient, ReferralExt, UserExt},
    error::ServiceError,
    models::{
        eventmodel::{MembershipEvent, MembershipOutcome, Transition},
        referralmodel::ProgressView,
        usermodel::{MembershipState, UserAttrs, UserId},
    },
    service::{
        notification::{crossed_target, deliver, Notification, Notifier},
        referral::{create_with_fresh_code, validate_user_id, CodeGenerator},
    },
};

/// Applies channel join/leave events as level-set assignments of the user's
/// membership flag, keeping the user's inbound referral edge in step.
///
/// Duplicates are no-ops. Reordering is only detected when the event source
/// supplies sequence numbers; without them a stale event wins.
#[derive(Clone)]
pub struct MembershipProcessor {
    db_client: Arc<DBClient>,
    codes: Arc<dyn CodeGenerator>,
    code_attempts: u32,
    notifier: Arc<dyn Notifier>,
    referral_target: i64,
}

impl MembershipProcessor {
    pub fn new(
        db_client: Arc<DBClient>,
        codes: Arc<dyn CodeGenerator>,
        code_attempts: u32,
        notifier: Arc<dyn Notifier>,
        referral_target: i64,
    ) -> Self {
        Self {
            db_client,
            codes,
            code_attempts: code_attempts.max(1),
            notifier,
            referral_target,
        }
    }

    pub async fn handle_joined(&self, user_id: UserId) -> Result<Option<UserId>, ServiceError> {
        let outcome = self.apply(MembershipEvent::joined(user_id)).await?;
        Ok(outcome.activated_referrer)
    }

    pub async fn handle_left(&self, user_id: UserId) -> Result<Vec<UserId>, ServiceError> {
        let outcome = self.apply(MembershipEvent::left(user_id)).await?;
        Ok(outcome.decreased_referrers)
    }

    pub async fn apply(&self, event: MembershipEvent) -> Result<MembershipOutcome, ServiceError> {
        validate_user_id(event.user_id)?;

        let user_id = event.user_id;
        let is_member = event.kind.implied_membership();
        let mut tx = self.db_client.begin_write().await?;

        let existing = self.db_client.get_user_tx(user_id, &mut tx).await?;
        let previous = MembershipState::of(existing.as_ref());
        let user = match existing {
            Some(user) => user,
            None => create_with_fresh_code(
                &self.db_client,
                self.codes.as_ref(),
                self.code_attempts,
                user_id,
                &UserAttrs::default(),
                &mut tx,
            )
            .await?
            .into_user(),
        };

        if let (Some(sequence), Some(last)) = (event.sequence, user.membership_seq) {
            if sequence <= last {
                self.db_client
                    .log_channel_event_tx(user_id, event.kind, event.sequence, false, &mut tx)
                    .await?;
                tx.commit().await?;
                tracing::debug!(
                    "Ignoring stale {} event #{} for user {} (last applied #{})",
                    event.kind.to_str(),
                    sequence,
                    user_id,
                    last
                );
                return Ok(MembershipOutcome::unchanged(&event, Transition::Stale));
            }
        }

        let already = match previous {
            MembershipState::Unknown => false,
            MembershipState::Member => is_member,
            MembershipState::NonMember => !is_member,
        };
        if already {
            if event.sequence.is_some() {
                self.db_client
                    .set_membership_tx(user_id, is_member, event.sequence, &mut tx)
                    .await?;
            }
            self.db_client
                .log_channel_event_tx(user_id, event.kind, event.sequence, false, &mut tx)
                .await?;
            tx.commit().await?;
            tracing::debug!(
                "User {} already {}; {} event is a no-op",
                user_id,
                previous.to_str(),
                event.kind.to_str()
            );
            return Ok(MembershipOutcome::unchanged(&event, Transition::Duplicate));
        }

        self.db_client
            .set_membership_tx(user_id, is_member, event.sequence, &mut tx)
            .await?;

        let mut outcome = MembershipOutcome::unchanged(&event, Transition::Applied);
        let mut referrer_state = None;

        if let Some(referrer_id) = user.referred_by {
            let touched = self
                .db_client
                .set_edge_active_tx(referrer_id, user_id, is_member, &mut tx)
                .await?;
            if !touched {
                // referred_by without an edge; restore the ledger from the user record.
                tracing::warn!(
                    "Missing referral edge {} -> {}; recreating it",
                    referrer_id,
                    user_id
                );
                self.db_client
                    .add_edge_tx(referrer_id, user_id, is_member, &mut tx)
                    .await?;
            }

            if is_member {
                outcome.activated_referrer = Some(referrer_id);
            } else {
                outcome.decreased_referrers.push(referrer_id);
            }

            let counts = self
                .db_client
                .get_referral_counts_tx(referrer_id, &mut tx)
                .await?;
            let reward_claimed = self
                .db_client
                .get_user_tx(referrer_id, &mut tx)
                .await?
                .map(|referrer| referrer.reward_claimed)
                .unwrap_or(false);
            referrer_state = Some((
                referrer_id,
                ProgressView::compute(counts, self.referral_target),
                reward_claimed,
            ));
        }

        self.db_client
            .log_channel_event_tx(user_id, event.kind, event.sequence, true, &mut tx)
            .await?;
        tx.commit().await?;

        tracing::info!(
            "User {} {} the channel ({} -> {})",
            user_id,
            event.kind.to_str(),
            previous.to_str(),
            if is_member { "member" } else { "non_member" }
        );

        if let Some((referrer_id, progress, reward_claimed)) = referrer_state {
            let mut batch = Vec::new();
            if is_member {
                batch.push((
                    referrer_id,
                    Notification::ReferralJoined {
                        referred_id: user_id,
                        progress,
                    },
                ));
                if !reward_claimed && crossed_target(&progress) {
                    batch.push((referrer_id, Notification::TargetReached { progress }));
                }
            } else {
                batch.push((
                    referrer_id,
                    Notification::ReferralLost {
                        referred_id: user_id,
                        progress,
                    },
                ));
            }
            deliver(self.notifier.as_ref(), batch).await;
        }

        Ok(outcome)
    }
}
