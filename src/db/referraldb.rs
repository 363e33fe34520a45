use async_trait::async_trait;
use chrono::Utc;
use sqlx::{Sqlite, Transaction};

use super::DBClient;
use crate::models::{
    referralmodel::{EdgeInsert, ReferralCounts, ReferralEdge, ReferralUser},
    usermodel::UserId,
};

/// Referral ledger: one edge per (referrer, referred) pair.
#[async_trait]
pub trait ReferralExt {
    /// Create the edge with the given initial status; a pair that already
    /// exists is left untouched and reported as `Duplicate`.
    async fn add_edge(
        &self,
        referrer_id: UserId,
        referred_id: UserId,
        is_active: bool,
    ) -> Result<EdgeInsert, sqlx::Error>;

    async fn add_edge_tx(
        &self,
        referrer_id: UserId,
        referred_id: UserId,
        is_active: bool,
        tx: &mut Transaction<'_, Sqlite>,
    ) -> Result<EdgeInsert, sqlx::Error>;

    /// Returns false when the edge does not exist.
    async fn set_edge_active_tx(
        &self,
        referrer_id: UserId,
        referred_id: UserId,
        is_active: bool,
        tx: &mut Transaction<'_, Sqlite>,
    ) -> Result<bool, sqlx::Error>;

    async fn get_edge(
        &self,
        referrer_id: UserId,
        referred_id: UserId,
    ) -> Result<Option<ReferralEdge>, sqlx::Error>;

    async fn get_referral_by_referred(
        &self,
        referred_id: UserId,
    ) -> Result<Option<ReferralEdge>, sqlx::Error>;

    async fn count_active(&self, referrer_id: UserId) -> Result<i64, sqlx::Error>;

    async fn count_total(&self, referrer_id: UserId) -> Result<i64, sqlx::Error>;

    /// Active and total counts read in a single statement.
    async fn get_referral_counts(&self, referrer_id: UserId) -> Result<ReferralCounts, sqlx::Error>;

    async fn get_referral_counts_tx(
        &self,
        referrer_id: UserId,
        tx: &mut Transaction<'_, Sqlite>,
    ) -> Result<ReferralCounts, sqlx::Error>;

    async fn list_referrals(&self, referrer_id: UserId) -> Result<Vec<ReferralUser>, sqlx::Error>;
}

const COUNTS_QUERY: &str = r#"
    SELECT
        COALESCE(SUM(CASE WHEN is_active THEN 1 ELSE 0 END), 0) AS active,
        COUNT(*) AS total
    FROM referral_edges
    WHERE referrer_id = ?
"#;

#[async_trait]
impl ReferralExt for DBClient {
    async fn add_edge(
        &self,
        referrer_id: UserId,
        referred_id: UserId,
        is_active: bool,
    ) -> Result<EdgeInsert, sqlx::Error> {
        let mut tx = self.begin_write().await?;
        let inserted = self
            .add_edge_tx(referrer_id, referred_id, is_active, &mut tx)
            .await?;
        tx.commit().await?;
        Ok(inserted)
    }

    async fn add_edge_tx(
        &self,
        referrer_id: UserId,
        referred_id: UserId,
        is_active: bool,
        tx: &mut Transaction<'_, Sqlite>,
    ) -> Result<EdgeInsert, sqlx::Error> {
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            INSERT INTO referral_edges (referrer_id, referred_id, is_active, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT (referrer_id, referred_id) DO NOTHING
            "#,
        )
        .bind(referrer_id)
        .bind(referred_id)
        .bind(is_active)
        .bind(now)
        .bind(now)
        .execute(&mut **tx)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(EdgeInsert::Duplicate);
        }

        let edge = sqlx::query_as::<_, ReferralEdge>(
            r#"
            SELECT referrer_id, referred_id, is_active, created_at, updated_at
            FROM referral_edges
            WHERE referrer_id = ? AND referred_id = ?
            "#,
        )
        .bind(referrer_id)
        .bind(referred_id)
        .fetch_one(&mut **tx)
        .await?;

        Ok(EdgeInsert::Inserted(edge))
    }

    async fn set_edge_active_tx(
        &self,
        referrer_id: UserId,
        referred_id: UserId,
        is_active: bool,
        tx: &mut Transaction<'_, Sqlite>,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE referral_edges
            SET is_active = ?, updated_at = ?
            WHERE referrer_id = ? AND referred_id = ?
            "#,
        )
        .bind(is_active)
        .bind(Utc::now())
        .bind(referrer_id)
        .bind(referred_id)
        .execute(&mut **tx)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn get_edge(
        &self,
        referrer_id: UserId,
        referred_id: UserId,
    ) -> Result<Option<ReferralEdge>, sqlx::Error> {
        sqlx::query_as::<_, ReferralEdge>(
            r#"
            SELECT referrer_id, referred_id, is_active, created_at, updated_at
            FROM referral_edges
            WHERE referrer_id = ? AND referred_id = ?
            "#,
        )
        .bind(referrer_id)
        .bind(referred_id)
        .fetch_optional(&self.pool)
        .await
    }

    async fn get_referral_by_referred(
        &self,
        referred_id: UserId,
    ) -> Result<Option<ReferralEdge>, sqlx::Error> {
        sqlx::query_as::<_, ReferralEdge>(
            r#"
            SELECT referrer_id, referred_id, is_active, created_at, updated_at
            FROM referral_edges
            WHERE referred_id = ?
            "#,
        )
        .bind(referred_id)
        .fetch_optional(&self.pool)
        .await
    }

    async fn count_active(&self, referrer_id: UserId) -> Result<i64, sqlx::Error> {
        sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM referral_edges WHERE referrer_id = ? AND is_active = TRUE",
        )
        .bind(referrer_id)
        .fetch_one(&self.pool)
        .await
    }

    async fn count_total(&self, referrer_id: UserId) -> Result<i64, sqlx::Error> {
        sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM referral_edges WHERE referrer_id = ?")
            .bind(referrer_id)
            .fetch_one(&self.pool)
            .await
    }

    async fn get_referral_counts(
        &self,
        referrer_id: UserId,
    ) -> Result<ReferralCounts, sqlx::Error> {
        let (active, total) = sqlx::query_as::<_, (i64, i64)>(COUNTS_QUERY)
            .bind(referrer_id)
            .fetch_one(&self.pool)
            .await?;

        Ok(ReferralCounts { active, total })
    }

    async fn get_referral_counts_tx(
        &self,
        referrer_id: UserId,
        tx: &mut Transaction<'_, Sqlite>,
    ) -> Result<ReferralCounts, sqlx::Error> {
        let (active, total) = sqlx::query_as::<_, (i64, i64)>(COUNTS_QUERY)
            .bind(referrer_id)
            .fetch_one(&mut **tx)
            .await?;

        Ok(ReferralCounts { active, total })
    }

    async fn list_referrals(&self, referrer_id: UserId) -> Result<Vec<ReferralUser>, sqlx::Error> {
        sqlx::query_as::<_, ReferralUser>(
            r#"
            SELECT
                u.user_id AS referred_id,
                u.username,
                u.first_name,
                r.is_active,
                r.created_at AS referred_at
            FROM referral_edges r
            JOIN users u ON r.referred_id = u.user_id
            WHERE r.referrer_id = ?
            ORDER BY r.created_at DESC, u.user_id DESC
            "#,
        )
        .bind(referrer_id)
        .fetch_all(&self.pool)
        .await
    }
}
