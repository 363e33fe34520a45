use std::sync::Arc;

use rand::Rng;
use serde::Serialize;
use sha2::{Digest, Sha256};
use sqlx::{Sqlite, Transaction};

use crate::{
    config::Config,
    db::{userdb::is_referral_code_conflict, DBClient, ReferralExt, UserExt},
    error::{ErrorKind, ServiceError},
    models::{
        referralmodel::{EdgeInsert, ProgressView},
        usermodel::{CreateUserOutcome, SetReferrerOutcome, User, UserAttrs, UserId},
    },
    service::notification::{crossed_target, deliver, Notification, Notifier},
};

const MAX_CODE_LEN: usize = 128;

pub trait CodeGenerator: Send + Sync {
    fn generate(&self, user_id: UserId) -> String;
}

/// `prefix` + the first `length` hex chars of SHA-256("{user_id}_{salt}")
/// with a fresh 8-byte random salt per call.
#[derive(Debug, Clone)]
pub struct HashedCodeGenerator {
    prefix: String,
    length: usize,
}

impl HashedCodeGenerator {
    pub fn new(prefix: impl Into<String>, length: usize) -> Self {
        HashedCodeGenerator {
            prefix: prefix.into(),
            length: length.clamp(1, 64),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        HashedCodeGenerator::new(config.code_prefix.clone(), config.code_length)
    }
}

impl Default for HashedCodeGenerator {
    fn default() -> Self {
        HashedCodeGenerator::new("ref_", 12)
    }
}

impl CodeGenerator for HashedCodeGenerator {
    fn generate(&self, user_id: UserId) -> String {
        let salt: [u8; 8] = rand::rng().random();
        let digest = Sha256::digest(format!("{}_{}", user_id, hex::encode(salt)).as_bytes());
        let digest = hex::encode(digest);
        format!("{}{}", self.prefix, &digest[..self.length])
    }
}

pub fn validate_user_id(user_id: UserId) -> Result<(), ServiceError> {
    if user_id <= 0 {
        return Err(ServiceError::InvalidInput(format!(
            "user id must be positive, got {}",
            user_id
        )));
    }
    Ok(())
}

pub fn validate_referral_code(code: &str) -> Result<(), ServiceError> {
    if code.is_empty() || code.len() > MAX_CODE_LEN {
        return Err(ServiceError::InvalidInput(format!(
            "referral code must be 1 to {} characters",
            MAX_CODE_LEN
        )));
    }
    if !code
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(ServiceError::InvalidInput(
            "referral code may only contain letters, digits, '_' and '-'".to_string(),
        ));
    }
    Ok(())
}

/// Insert the user with a freshly generated code, drawing a new code whenever
/// the previous one collides.
pub(crate) async fn create_with_fresh_code(
    db_client: &DBClient,
    codes: &dyn CodeGenerator,
    attempts: u32,
    user_id: UserId,
    attrs: &UserAttrs,
    tx: &mut Transaction<'_, Sqlite>,
) -> Result<CreateUserOutcome, ServiceError> {
    for attempt in 1..=attempts {
        let code = codes.generate(user_id);
        match db_client.create_user_tx(user_id, attrs, &code, tx).await {
            Ok(outcome) => {
                if outcome.was_created() {
                    tracing::info!("Registered user {} with referral code {}", user_id, code);
                }
                return Ok(outcome);
            }
            Err(e) if is_referral_code_conflict(&e) => {
                tracing::warn!(
                    "Referral code collision for user {} (attempt {}/{})",
                    user_id,
                    attempt,
                    attempts
                );
            }
            Err(e) => return Err(e.into()),
        }
    }

    tracing::error!("Exhausted {} referral code attempts for user {}", attempts, user_id);
    Err(ServiceError::CodeSpaceExhausted { attempts })
}

#[derive(Debug)]
pub enum ReferralAttempt {
    NotRequested,
    Attributed { referrer_id: UserId },
    Rejected(ServiceError),
}

impl ReferralAttempt {
    pub fn referrer_id(&self) -> Option<UserId> {
        match self {
            ReferralAttempt::Attributed { referrer_id } => Some(*referrer_id),
            _ => None,
        }
    }
}

impl Serialize for ReferralAttempt {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeMap;

        let mut map = serializer.serialize_map(None)?;
        match self {
            ReferralAttempt::NotRequested => {
                map.serialize_entry("status", "not_requested")?;
            }
            ReferralAttempt::Attributed { referrer_id } => {
                map.serialize_entry("status", "attributed")?;
                map.serialize_entry("referrer_id", referrer_id)?;
            }
            ReferralAttempt::Rejected(err) => {
                map.serialize_entry("status", "rejected")?;
                map.serialize_entry("reason", err.code())?;
                map.serialize_entry("message", &err.to_string())?;
            }
        }
        map.end()
    }
}

#[derive(Debug, Serialize)]
pub struct FirstContact {
    pub user: User,
    pub created: bool,
    pub referral: ReferralAttempt,
}

#[derive(Clone)]
pub struct ReferralService {
    db_client: Arc<DBClient>,
    codes: Arc<dyn CodeGenerator>,
    code_attempts: u32,
    notifier: Arc<dyn Notifier>,
    referral_target: i64,
}

impl ReferralService {
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

    pub async fn register_user(
        &self,
        user_id: UserId,
        attrs: &UserAttrs,
    ) -> Result<CreateUserOutcome, ServiceError> {
        validate_user_id(user_id)?;

        let mut tx = self.db_client.begin_write().await?;
        let outcome = create_with_fresh_code(
            &self.db_client,
            self.codes.as_ref(),
            self.code_attempts,
            user_id,
            attrs,
            &mut tx,
        )
        .await?;
        tx.commit().await?;

        Ok(outcome)
    }

    /// Record `referred_id` as referred by the owner of `code`: the referrer
    /// link on the user and the ledger edge are written in one transaction.
    pub async fn attribute(&self, referred_id: UserId, code: &str) -> Result<UserId, ServiceError> {
        validate_user_id(referred_id)?;
        validate_referral_code(code)?;

        let mut tx = self.db_client.begin_write().await?;

        let referrer = self
            .db_client
            .get_user_by_referral_code_tx(code, &mut tx)
            .await?
            .ok_or_else(|| ServiceError::UnknownReferralCode(code.to_string()))?;
        let referrer_id = referrer.user_id;

        match self
            .db_client
            .set_referrer_tx(referred_id, referrer_id, &mut tx)
            .await?
        {
            SetReferrerOutcome::Applied => {}
            SetReferrerOutcome::AlreadyReferred(existing) => {
                return Err(ServiceError::AlreadyReferred {
                    user_id: referred_id,
                    referrer_id: existing,
                })
            }
            SetReferrerOutcome::SelfReferral => return Err(ServiceError::SelfReferral(referred_id)),
            SetReferrerOutcome::NotRegistered => {
                return Err(ServiceError::NotRegistered(referred_id))
            }
        }

        let referred = self
            .db_client
            .get_user_tx(referred_id, &mut tx)
            .await?
            .ok_or(ServiceError::NotRegistered(referred_id))?;

        // The edge starts out mirroring the referred user's current membership.
        match self
            .db_client
            .add_edge_tx(referrer_id, referred_id, referred.is_channel_member, &mut tx)
            .await?
        {
            EdgeInsert::Inserted(_) => {}
            EdgeInsert::Duplicate => {
                return Err(ServiceError::DuplicateEdge {
                    referrer_id,
                    referred_id,
                })
            }
        }

        let counts = self
            .db_client
            .get_referral_counts_tx(referrer_id, &mut tx)
            .await?;
        tx.commit().await?;

        tracing::info!(
            "Referral attributed: {} ({}) referred {}",
            referrer.display_name(),
            referrer_id,
            referred_id
        );

        let progress = ProgressView::compute(counts, self.referral_target);
        let mut batch = vec![(
            referrer_id,
            Notification::ReferralAttributed {
                referred_id,
                progress,
            },
        )];
        if referred.is_channel_member && !referrer.reward_claimed && crossed_target(&progress) {
            batch.push((referrer_id, Notification::TargetReached { progress }));
        }
        deliver(self.notifier.as_ref(), batch).await;

        Ok(referrer_id)
    }

    /// Register the user (idempotently) and, when a code is supplied, try to
    /// attribute the referral. Business rejections of the referral are
    /// reported in the outcome; storage failures fail the call.
    pub async fn on_first_contact(
        &self,
        user_id: UserId,
        attrs: &UserAttrs,
        code: Option<&str>,
    ) -> Result<FirstContact, ServiceError> {
        let outcome = self.register_user(user_id, attrs).await?;
        let created = outcome.was_created();

        let referral = match code {
            None => ReferralAttempt::NotRequested,
            Some(code) => match self.attribute(user_id, code).await {
                Ok(referrer_id) => ReferralAttempt::Attributed { referrer_id },
                Err(e) if e.kind() == ErrorKind::StorageFailure => return Err(e),
                Err(e) => {
                    tracing::warn!("Referral for user {} rejected: {}", user_id, e);
                    ReferralAttempt::Rejected(e)
                }
            },
        };

        let user = match referral {
            ReferralAttempt::Attributed { .. } => self
                .db_client
                .get_user(user_id)
                .await?
                .ok_or(ServiceError::NotRegistered(user_id))?,
            _ => outcome.into_user(),
        };

        Ok(FirstContact {
            user,
            created,
            referral,
        })
    }
}
