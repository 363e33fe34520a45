use async_trait::async_trait;
use chrono::Utc;

use super::DBClient;
use crate::models::{referralmodel::InviteLink, usermodel::UserId};

/// Invite links created for users by the messaging layer, one per user.
#[async_trait]
pub trait InviteLinkExt {
    async fn store_invite_link(
        &self,
        user_id: UserId,
        referral_code: &str,
        invite_link: &str,
        link_name: Option<&str>,
    ) -> Result<InviteLink, sqlx::Error>;

    async fn get_invite_link(&self, user_id: UserId) -> Result<Option<InviteLink>, sqlx::Error>;
}

#[async_trait]
impl InviteLinkExt for DBClient {
    async fn store_invite_link(
        &self,
        user_id: UserId,
        referral_code: &str,
        invite_link: &str,
        link_name: Option<&str>,
    ) -> Result<InviteLink, sqlx::Error> {
        let mut tx = self.begin_write().await?;

        sqlx::query(
            r#"
            INSERT INTO invite_links (user_id, referral_code, invite_link, link_name, created_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT (user_id) DO UPDATE SET
                referral_code = excluded.referral_code,
                invite_link = excluded.invite_link,
                link_name = excluded.link_name,
                created_at = excluded.created_at
            "#,
        )
        .bind(user_id)
        .bind(referral_code)
        .bind(invite_link)
        .bind(link_name)
        .bind(Utc::now())
        .execute(&mut **tx)
        .await?;

        let link = sqlx::query_as::<_, InviteLink>(
            r#"
            SELECT user_id, referral_code, invite_link, link_name, created_at
            FROM invite_links
            WHERE user_id = ?
            "#,
        )
        .bind(user_id)
        .fetch_one(&mut **tx)
        .await?;

        tx.commit().await?;
        Ok(link)
    }

    async fn get_invite_link(&self, user_id: UserId) -> Result<Option<InviteLink>, sqlx::Error> {
        sqlx::query_as::<_, InviteLink>(
            r#"
            SELECT user_id, referral_code, invite_link, link_name, created_at
            FROM invite_links
            WHERE user_id = ?
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{db::UserExt, models::usermodel::UserAttrs};

    #[tokio::test]
    async fn storing_again_replaces_the_link() {
        let db = DBClient::in_memory().await.unwrap();
        db.create_user(1, &UserAttrs::default(), "ref_1").await.unwrap();

        assert!(db.get_invite_link(1).await.unwrap().is_none());

        db.store_invite_link(1, "ref_1", "https://t.me/+old", Some("Referral-ref_1"))
            .await
            .unwrap();
        let link = db
            .store_invite_link(1, "ref_1", "https://t.me/+new", None)
            .await
            .unwrap();

        assert_eq!(link.invite_link, "https://t.me/+new");
        assert_eq!(link.link_name, None);
        assert_eq!(db.get_invite_link(1).await.unwrap(), Some(link));
    }

    #[tokio::test]
    async fn unknown_user_is_rejected() {
        let db = DBClient::in_memory().await.unwrap();
        assert!(db
            .store_invite_link(42, "ref_x", "https://t.me/+x", None)
            .await
            .is_err());
    }
}
