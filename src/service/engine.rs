use std::sync::Arc;

use crate::{
    config::Config,
    db::{ChannelEventExt, DBClient, InviteLinkExt, ReferralExt, UserExt},
    error::ServiceError,
    models::{
        eventmodel::{ChannelEvent, MembershipEvent, MembershipOutcome},
        referralmodel::{EngineStats, InviteLink, ProgressView, ReferralEdge, ReferralUser},
        usermodel::{User, UserAttrs, UserId},
    },
    service::{
        membership::MembershipProcessor,
        notification::{Notifier, TracingNotifier},
        progress::ProgressEvaluator,
        reconcile::{MembershipOracle, ReconcileReport, Reconciler},
        referral::{
            validate_referral_code, validate_user_id, CodeGenerator, FirstContact,
            HashedCodeGenerator, ReferralService,
        },
        reward::{ClaimReceipt, RewardGate},
    },
};

/// Entry point for every inbound call. Owns the component graph; the binary
/// (or any other adapter) builds one and shares it.
#[derive(Clone)]
pub struct ReferralEngine {
    db_client: Arc<DBClient>,
    referrals: ReferralService,
    membership: MembershipProcessor,
    progress: ProgressEvaluator,
    rewards: RewardGate,
    reconciler: Option<Reconciler>,
    referral_target: i64,
}

pub struct ReferralEngineBuilder {
    db_client: Arc<DBClient>,
    referral_target: i64,
    code_attempts: u32,
    codes: Arc<dyn CodeGenerator>,
    notifier: Arc<dyn Notifier>,
    oracle: Option<Arc<dyn MembershipOracle>>,
}

impl ReferralEngineBuilder {
    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn code_generator(mut self, codes: Arc<dyn CodeGenerator>) -> Self {
        self.codes = codes;
        self
    }

    pub fn oracle(mut self, oracle: Arc<dyn MembershipOracle>) -> Self {
        self.oracle = Some(oracle);
        self
    }

    pub fn build(self) -> ReferralEngine {
        let referrals = ReferralService::new(
            self.db_client.clone(),
            self.codes.clone(),
            self.code_attempts,
            self.notifier.clone(),
            self.referral_target,
        );
        let membership = MembershipProcessor::new(
            self.db_client.clone(),
            self.codes,
            self.code_attempts,
            self.notifier,
            self.referral_target,
        );
        let reconciler = self
            .oracle
            .map(|oracle| Reconciler::new(self.db_client.clone(), membership.clone(), oracle));

        ReferralEngine {
            progress: ProgressEvaluator::new(self.db_client.clone()),
            rewards: RewardGate::new(self.db_client.clone()),
            db_client: self.db_client,
            referrals,
            membership,
            reconciler,
            referral_target: self.referral_target,
        }
    }
}

impl ReferralEngine {
    /// Engine with the hashed code generator and a logging notifier.
    pub fn new(db_client: Arc<DBClient>, config: &Config) -> Self {
        ReferralEngine::builder(db_client, config).build()
    }

    pub fn builder(db_client: Arc<DBClient>, config: &Config) -> ReferralEngineBuilder {
        ReferralEngineBuilder {
            db_client,
            referral_target: config.referral_target,
            code_attempts: config.code_attempts,
            codes: Arc::new(HashedCodeGenerator::from_config(config)),
            notifier: Arc::new(TracingNotifier),
            oracle: None,
        }
    }

    /// Target used when the caller does not supply one.
    pub fn referral_target(&self) -> i64 {
        self.referral_target
    }

    pub async fn on_first_contact(
        &self,
        user_id: UserId,
        attrs: &UserAttrs,
        referral_code: Option<&str>,
    ) -> Result<FirstContact, ServiceError> {
        self.referrals
            .on_first_contact(user_id, attrs, referral_code)
            .await
    }

    pub async fn on_membership_event(
        &self,
        event: MembershipEvent,
    ) -> Result<MembershipOutcome, ServiceError> {
        self.membership.apply(event).await
    }

    pub async fn handle_joined(&self, user_id: UserId) -> Result<Option<UserId>, ServiceError> {
        self.membership.handle_joined(user_id).await
    }

    pub async fn handle_left(&self, user_id: UserId) -> Result<Vec<UserId>, ServiceError> {
        self.membership.handle_left(user_id).await
    }

    pub async fn on_status_query(
        &self,
        user_id: UserId,
        target: i64,
    ) -> Result<ProgressView, ServiceError> {
        validate_user_id(user_id)?;
        self.progress.evaluate(user_id, target).await
    }

    pub async fn on_claim_request(
        &self,
        user_id: UserId,
        target: i64,
    ) -> Result<ClaimReceipt, ServiceError> {
        validate_user_id(user_id)?;
        self.rewards.claim(user_id, target).await
    }

    pub async fn reconcile(
        &self,
        user_id: UserId,
    ) -> Result<Option<MembershipOutcome>, ServiceError> {
        self.reconciler()?.reconcile(user_id).await
    }

    pub async fn reconcile_all(&self) -> Result<ReconcileReport, ServiceError> {
        self.reconciler()?.reconcile_all().await
    }

    fn reconciler(&self) -> Result<&Reconciler, ServiceError> {
        self.reconciler.as_ref().ok_or_else(|| {
            ServiceError::InvalidInput("no membership source configured".to_string())
        })
    }

    pub async fn stats(&self) -> Result<EngineStats, ServiceError> {
        Ok(self.db_client.get_engine_stats().await?)
    }

    pub async fn get_user(&self, user_id: UserId) -> Result<Option<User>, ServiceError> {
        validate_user_id(user_id)?;
        Ok(self.db_client.get_user(user_id).await?)
    }

    pub async fn get_user_by_code(&self, code: &str) -> Result<Option<User>, ServiceError> {
        validate_referral_code(code)?;
        Ok(self.db_client.get_user_by_referral_code(code).await?)
    }

    pub async fn list_referrals(
        &self,
        referrer_id: UserId,
    ) -> Result<Vec<ReferralUser>, ServiceError> {
        validate_user_id(referrer_id)?;
        Ok(self.db_client.list_referrals(referrer_id).await?)
    }

    pub async fn get_referral_by_referred(
        &self,
        referred_id: UserId,
    ) -> Result<Option<ReferralEdge>, ServiceError> {
        validate_user_id(referred_id)?;
        Ok(self.db_client.get_referral_by_referred(referred_id).await?)
    }

    pub async fn recent_events(
        &self,
        user_id: UserId,
        limit: i64,
    ) -> Result<Vec<ChannelEvent>, ServiceError> {
        validate_user_id(user_id)?;
        if limit <= 0 {
            return Err(ServiceError::InvalidInput(format!(
                "limit must be positive, got {}",
                limit
            )));
        }
        Ok(self.db_client.recent_events(user_id, limit).await?)
    }

    /// The link must carry the user's own referral code.
    pub async fn store_invite_link(
        &self,
        user_id: UserId,
        invite_link: &str,
        link_name: Option<&str>,
    ) -> Result<InviteLink, ServiceError> {
        validate_user_id(user_id)?;
        if invite_link.trim().is_empty() {
            return Err(ServiceError::InvalidInput("invite link is empty".to_string()));
        }

        let user = self
            .db_client
            .get_user(user_id)
            .await?
            .ok_or(ServiceError::NotRegistered(user_id))?;

        let link = self
            .db_client
            .store_invite_link(user_id, &user.referral_code, invite_link, link_name)
            .await?;
        tracing::info!("Stored invite link for user {}", user_id);
        Ok(link)
    }

    pub async fn get_invite_link(
        &self,
        user_id: UserId,
    ) -> Result<Option<InviteLink>, ServiceError> {
        validate_user_id(user_id)?;
        Ok(self.db_client.get_invite_link(user_id).await?)
    }
}
