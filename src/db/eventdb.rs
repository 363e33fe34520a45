use async_trait::async_trait;
use chrono::Utc;
use sqlx::{Sqlite, Transaction};

use super::DBClient;
use crate::models::{
    eventmodel::{ChannelEvent, ChannelEventType},
    usermodel::UserId,
};

/// Append-only membership audit log. Never read back for counting.
#[async_trait]
pub trait ChannelEventExt {
    async fn log_channel_event_tx(
        &self,
        user_id: UserId,
        event_type: ChannelEventType,
        sequence: Option<i64>,
        applied: bool,
        tx: &mut Transaction<'_, Sqlite>,
    ) -> Result<i64, sqlx::Error>;

    /// Most recent events for a user, newest first.
    async fn recent_events(
        &self,
        user_id: UserId,
        limit: i64,
    ) -> Result<Vec<ChannelEvent>, sqlx::Error>;
}

#[async_trait]
impl ChannelEventExt for DBClient {
    async fn log_channel_event_tx(
        &self,
        user_id: UserId,
        event_type: ChannelEventType,
        sequence: Option<i64>,
        applied: bool,
        tx: &mut Transaction<'_, Sqlite>,
    ) -> Result<i64, sqlx::Error> {
        let result = sqlx::query(
            r#"
            INSERT INTO channel_events (user_id, event_type, sequence, applied, recorded_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(user_id)
        .bind(event_type)
        .bind(sequence)
        .bind(applied)
        .bind(Utc::now())
        .execute(&mut **tx)
        .await?;

        Ok(result.last_insert_rowid())
    }

    async fn recent_events(
        &self,
        user_id: UserId,
        limit: i64,
    ) -> Result<Vec<ChannelEvent>, sqlx::Error> {
        sqlx::query_as::<_, ChannelEvent>(
            r#"
            SELECT id, user_id, event_type, sequence, applied, recorded_at
            FROM channel_events
            WHERE user_id = ?
            ORDER BY id DESC
            LIMIT ?
            "#,
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn events_are_returned_newest_first() {
        let db = DBClient::in_memory().await.unwrap();

        let mut tx = db.begin_write().await.unwrap();
        db.log_channel_event_tx(5, ChannelEventType::Joined, Some(1), true, &mut tx)
            .await
            .unwrap();
        db.log_channel_event_tx(5, ChannelEventType::Joined, None, false, &mut tx)
            .await
            .unwrap();
        db.log_channel_event_tx(5, ChannelEventType::Left, Some(2), true, &mut tx)
            .await
            .unwrap();
        db.log_channel_event_tx(6, ChannelEventType::Left, None, true, &mut tx)
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let events = db.recent_events(5, 2).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type, ChannelEventType::Left);
        assert_eq!(events[0].sequence, Some(2));
        assert!(!events[1].applied);
        assert!(events.iter().all(|e| e.user_id == 5));
    }
}
