use async_trait::async_trait;
use chrono::Utc;
use sqlx::{Sqlite, Transaction};

use super::DBClient;
use crate::models::{
    referralmodel::EngineStats,
    usermodel::{CreateUserOutcome, SetReferrerOutcome, User, UserAttrs, UserId},
};

/// Identity store: users, their referral code, referrer and flags.
#[async_trait]
pub trait UserExt {
    /// Insert the user unless the id already exists, in which case the stored
    /// record is returned untouched. A collision on `referral_code` surfaces
    /// as a unique-violation error (see [`is_referral_code_conflict`]).
    async fn create_user(
        &self,
        user_id: UserId,
        attrs: &UserAttrs,
        referral_code: &str,
    ) -> Result<CreateUserOutcome, sqlx::Error>;

    async fn create_user_tx(
        &self,
        user_id: UserId,
        attrs: &UserAttrs,
        referral_code: &str,
        tx: &mut Transaction<'_, Sqlite>,
    ) -> Result<CreateUserOutcome, sqlx::Error>;

    async fn get_user(&self, user_id: UserId) -> Result<Option<User>, sqlx::Error>;

    async fn get_user_tx(
        &self,
        user_id: UserId,
        tx: &mut Transaction<'_, Sqlite>,
    ) -> Result<Option<User>, sqlx::Error>;

    async fn get_user_by_referral_code(
        &self,
        referral_code: &str,
    ) -> Result<Option<User>, sqlx::Error>;

    async fn get_user_by_referral_code_tx(
        &self,
        referral_code: &str,
        tx: &mut Transaction<'_, Sqlite>,
    ) -> Result<Option<User>, sqlx::Error>;

    /// Level-set the membership flag. `sequence`, when given, becomes the
    /// user's last applied event sequence. Returns false for unknown users.
    async fn set_membership_tx(
        &self,
        user_id: UserId,
        is_member: bool,
        sequence: Option<i64>,
        tx: &mut Transaction<'_, Sqlite>,
    ) -> Result<bool, sqlx::Error>;

    /// Record the referrer only if none is set and it is not the user itself.
    async fn set_referrer(
        &self,
        user_id: UserId,
        referrer_id: UserId,
    ) -> Result<SetReferrerOutcome, sqlx::Error>;

    async fn set_referrer_tx(
        &self,
        user_id: UserId,
        referrer_id: UserId,
        tx: &mut Transaction<'_, Sqlite>,
    ) -> Result<SetReferrerOutcome, sqlx::Error>;

    /// Idempotent; returns false only when the user does not exist.
    async fn mark_reward_claimed(&self, user_id: UserId) -> Result<bool, sqlx::Error>;

    async fn mark_reward_claimed_tx(
        &self,
        user_id: UserId,
        tx: &mut Transaction<'_, Sqlite>,
    ) -> Result<bool, sqlx::Error>;

    async fn list_user_ids(&self) -> Result<Vec<UserId>, sqlx::Error>;

    async fn get_engine_stats(&self) -> Result<EngineStats, sqlx::Error>;
}

/// True when `err` is the unique-constraint failure on `users.referral_code`.
pub fn is_referral_code_conflict(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => {
            db_err.is_unique_violation() && db_err.message().contains("referral_code")
        }
        _ => false,
    }
}

#[async_trait]
impl UserExt for DBClient {
    async fn create_user(
        &self,
        user_id: UserId,
        attrs: &UserAttrs,
        referral_code: &str,
    ) -> Result<CreateUserOutcome, sqlx::Error> {
        let mut tx = self.begin_write().await?;
        let outcome = self.create_user_tx(user_id, attrs, referral_code, &mut tx).await?;
        tx.commit().await?;
        Ok(outcome)
    }

    async fn create_user_tx(
        &self,
        user_id: UserId,
        attrs: &UserAttrs,
        referral_code: &str,
        tx: &mut Transaction<'_, Sqlite>,
    ) -> Result<CreateUserOutcome, sqlx::Error> {
        let result = sqlx::query(
            r#"
            INSERT INTO users (user_id, username, first_name, last_name, referral_code, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT (user_id) DO NOTHING
            "#,
        )
        .bind(user_id)
        .bind(&attrs.username)
        .bind(&attrs.first_name)
        .bind(&attrs.last_name)
        .bind(referral_code)
        .bind(Utc::now())
        .execute(&mut **tx)
        .await?;

        let user = self
            .get_user_tx(user_id, tx)
            .await?
            .ok_or(sqlx::Error::RowNotFound)?;

        if result.rows_affected() == 1 {
            Ok(CreateUserOutcome::Created(user))
        } else {
            Ok(CreateUserOutcome::Existing(user))
        }
    }

    async fn get_user(&self, user_id: UserId) -> Result<Option<User>, sqlx::Error> {
        sqlx::query_as::<_, User>(
            r#"
            SELECT user_id, username, first_name, last_name, referral_code, referred_by,
                is_channel_member, reward_claimed, membership_seq, created_at, reward_claimed_at
            FROM users
            WHERE user_id = ?
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
    }

    async fn get_user_tx(
        &self,
        user_id: UserId,
        tx: &mut Transaction<'_, Sqlite>,
    ) -> Result<Option<User>, sqlx::Error> {
        sqlx::query_as::<_, User>(
            r#"
            SELECT user_id, username, first_name, last_name, referral_code, referred_by,
                is_channel_member, reward_claimed, membership_seq, created_at, reward_claimed_at
            FROM users
            WHERE user_id = ?
            "#,
        )
        .bind(user_id)
        .fetch_optional(&mut **tx)
        .await
    }

    async fn get_user_by_referral_code(
        &self,
        referral_code: &str,
    ) -> Result<Option<User>, sqlx::Error> {
        sqlx::query_as::<_, User>(
            r#"
            SELECT user_id, username, first_name, last_name, referral_code, referred_by,
                is_channel_member, reward_claimed, membership_seq, created_at, reward_claimed_at
            FROM users
            WHERE referral_code = ?
            "#,
        )
        .bind(referral_code)
        .fetch_optional(&self.pool)
        .await
    }

    async fn get_user_by_referral_code_tx(
        &self,
        referral_code: &str,
        tx: &mut Transaction<'_, Sqlite>,
    ) -> Result<Option<User>, sqlx::Error> {
        sqlx::query_as::<_, User>(
            r#"
            SELECT user_id, username, first_name, last_name, referral_code, referred_by,
                is_channel_member, reward_claimed, membership_seq, created_at, reward_claimed_at
            FROM users
            WHERE referral_code = ?
            "#,
        )
        .bind(referral_code)
        .fetch_optional(&mut **tx)
        .await
    }

    async fn set_membership_tx(
        &self,
        user_id: UserId,
        is_member: bool,
        sequence: Option<i64>,
        tx: &mut Transaction<'_, Sqlite>,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE users
            SET is_channel_member = ?, membership_seq = COALESCE(?, membership_seq)
            WHERE user_id = ?
            "#,
        )
        .bind(is_member)
        .bind(sequence)
        .bind(user_id)
        .execute(&mut **tx)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn set_referrer(
        &self,
        user_id: UserId,
        referrer_id: UserId,
    ) -> Result<SetReferrerOutcome, sqlx::Error> {
        let mut tx = self.begin_write().await?;
        let outcome = self.set_referrer_tx(user_id, referrer_id, &mut tx).await?;
        tx.commit().await?;
        Ok(outcome)
    }

    async fn set_referrer_tx(
        &self,
        user_id: UserId,
        referrer_id: UserId,
        tx: &mut Transaction<'_, Sqlite>,
    ) -> Result<SetReferrerOutcome, sqlx::Error> {
        if user_id == referrer_id {
            return Ok(SetReferrerOutcome::SelfReferral);
        }

        let user = match self.get_user_tx(user_id, tx).await? {
            Some(user) => user,
            None => return Ok(SetReferrerOutcome::NotRegistered),
        };

        if let Some(existing) = user.referred_by {
            return Ok(SetReferrerOutcome::AlreadyReferred(existing));
        }

        let result = sqlx::query(
            r#"
            UPDATE users
            SET referred_by = ?
            WHERE user_id = ? AND referred_by IS NULL
            "#,
        )
        .bind(referrer_id)
        .bind(user_id)
        .execute(&mut **tx)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(SetReferrerOutcome::Applied);
        }

        // Lost a race with another writer outside the gate.
        let existing = self
            .get_user_tx(user_id, tx)
            .await?
            .and_then(|user| user.referred_by);
        Ok(match existing {
            Some(existing) => SetReferrerOutcome::AlreadyReferred(existing),
            None => SetReferrerOutcome::NotRegistered,
        })
    }

    async fn mark_reward_claimed(&self, user_id: UserId) -> Result<bool, sqlx::Error> {
        let mut tx = self.begin_write().await?;
        let marked = self.mark_reward_claimed_tx(user_id, &mut tx).await?;
        tx.commit().await?;
        Ok(marked)
    }

    async fn mark_reward_claimed_tx(
        &self,
        user_id: UserId,
        tx: &mut Transaction<'_, Sqlite>,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE users
            SET reward_claimed = TRUE, reward_claimed_at = COALESCE(reward_claimed_at, ?)
            WHERE user_id = ?
            "#,
        )
        .bind(Utc::now())
        .bind(user_id)
        .execute(&mut **tx)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn list_user_ids(&self) -> Result<Vec<UserId>, sqlx::Error> {
        sqlx::query_scalar::<_, UserId>("SELECT user_id FROM users ORDER BY user_id")
            .fetch_all(&self.pool)
            .await
    }

    async fn get_engine_stats(&self) -> Result<EngineStats, sqlx::Error> {
        sqlx::query_as::<_, EngineStats>(
            r#"
            SELECT
                (SELECT COUNT(*) FROM users) AS total_users,
                (SELECT COUNT(*) FROM users WHERE is_channel_member = TRUE) AS channel_members,
                (SELECT COUNT(*) FROM referral_edges WHERE is_active = TRUE) AS active_referrals,
                (SELECT COUNT(*) FROM referral_edges) AS total_referrals,
                (SELECT COUNT(*) FROM users WHERE reward_claimed = TRUE) AS rewards_claimed
            "#,
        )
        .fetch_one(&self.pool)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attrs(name: &str) -> UserAttrs {
        UserAttrs {
            username: Some(name.to_lowercase()),
            first_name: Some(name.to_string()),
            last_name: None,
        }
    }

    #[tokio::test]
    async fn create_user_is_idempotent_on_id() {
        let db = DBClient::in_memory().await.unwrap();

        let first = db.create_user(10, &attrs("Ada"), "ref_aaaa").await.unwrap();
        assert!(first.was_created());

        let second = db.create_user(10, &attrs("Other"), "ref_bbbb").await.unwrap();
        assert!(!second.was_created());
        assert_eq!(second.user().referral_code, "ref_aaaa");
        assert_eq!(second.user().display_name(), "Ada");

        assert!(db.get_user_by_referral_code("ref_bbbb").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_code_is_reported_as_code_conflict() {
        let db = DBClient::in_memory().await.unwrap();
        db.create_user(1, &UserAttrs::default(), "ref_same").await.unwrap();

        let err = db
            .create_user(2, &UserAttrs::default(), "ref_same")
            .await
            .unwrap_err();
        assert!(is_referral_code_conflict(&err));
        assert!(db.get_user(2).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn set_referrer_only_once() {
        let db = DBClient::in_memory().await.unwrap();
        for (id, code) in [(1, "ref_1"), (2, "ref_2"), (3, "ref_3")] {
            db.create_user(id, &UserAttrs::default(), code).await.unwrap();
        }

        assert_eq!(db.set_referrer(3, 1).await.unwrap(), SetReferrerOutcome::Applied);
        assert_eq!(
            db.set_referrer(3, 2).await.unwrap(),
            SetReferrerOutcome::AlreadyReferred(1)
        );
        assert_eq!(db.get_user(3).await.unwrap().unwrap().referred_by, Some(1));
    }

    #[tokio::test]
    async fn set_referrer_rejects_self_and_unknown() {
        let db = DBClient::in_memory().await.unwrap();
        db.create_user(1, &UserAttrs::default(), "ref_1").await.unwrap();

        assert_eq!(db.set_referrer(1, 1).await.unwrap(), SetReferrerOutcome::SelfReferral);
        assert_eq!(db.set_referrer(99, 1).await.unwrap(), SetReferrerOutcome::NotRegistered);
        assert_eq!(db.get_user(1).await.unwrap().unwrap().referred_by, None);
    }

    #[tokio::test]
    async fn mark_reward_claimed_is_idempotent() {
        let db = DBClient::in_memory().await.unwrap();
        db.create_user(1, &UserAttrs::default(), "ref_1").await.unwrap();

        assert!(db.mark_reward_claimed(1).await.unwrap());
        let claimed_at = db.get_user(1).await.unwrap().unwrap().reward_claimed_at;
        assert!(claimed_at.is_some());

        assert!(db.mark_reward_claimed(1).await.unwrap());
        let user = db.get_user(1).await.unwrap().unwrap();
        assert!(user.reward_claimed);
        assert_eq!(user.reward_claimed_at, claimed_at);

        assert!(!db.mark_reward_claimed(2).await.unwrap());
    }

    #[tokio::test]
    async fn membership_keeps_sequence_when_none_given() {
        let db = DBClient::in_memory().await.unwrap();
        db.create_user(1, &UserAttrs::default(), "ref_1").await.unwrap();

        let mut tx = db.begin_write().await.unwrap();
        assert!(db.set_membership_tx(1, true, Some(7), &mut tx).await.unwrap());
        assert!(db.set_membership_tx(1, false, None, &mut tx).await.unwrap());
        assert!(!db.set_membership_tx(2, true, None, &mut tx).await.unwrap());
        tx.commit().await.unwrap();

        let user = db.get_user(1).await.unwrap().unwrap();
        assert!(!user.is_channel_member);
        assert_eq!(user.membership_seq, Some(7));
    }
}
