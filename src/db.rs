use std::{
    ops::{Deref, DerefMut},
    str::FromStr,
    sync::Arc,
    time::Duration,
};

use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
    Pool, Sqlite, Transaction,
};
use tokio::sync::{Mutex, MutexGuard};

use crate::config::Config;

pub mod eventdb;
pub mod invitedb;
pub mod referraldb;
pub mod userdb;

pub use eventdb::ChannelEventExt;
pub use invitedb::InviteLinkExt;
pub use referraldb::ReferralExt;
pub use userdb::UserExt;

/// Handle to the referral database.
///
/// Reads go straight to the pool. Every mutation runs inside a
/// [`WriteTransaction`], which holds the process-wide write gate for its
/// whole lifetime, so writers are serialized while readers stay concurrent.
#[derive(Clone)]
pub struct DBClient {
    pub pool: Pool<Sqlite>,
    write_gate: Arc<Mutex<()>>,
}

impl std::fmt::Debug for DBClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DBClient")
            .field("pool", &"Pool<Sqlite>")
            .field("connections", &self.pool.size())
            .finish()
    }
}

impl DBClient {
    pub fn new(pool: Pool<Sqlite>) -> Self {
        DBClient {
            pool,
            write_gate: Arc::new(Mutex::new(())),
        }
    }

    /// Open (creating if needed) the database named by `config.database_url`.
    pub async fn connect(config: &Config) -> Result<Self, sqlx::Error> {
        let options = SqliteConnectOptions::from_str(&config.database_url)?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(config.database_max_connections)
            .connect_with(options)
            .await?;

        Ok(DBClient::new(pool))
    }

    /// Private, migrated in-memory database. A single connection that never
    /// expires, since every connection to `:memory:` is its own database.
    pub async fn in_memory() -> Result<Self, sqlx::Error> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let client = DBClient::new(pool);
        client.migrate().await?;
        Ok(client)
    }

    pub async fn migrate(&self) -> Result<(), sqlx::Error> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        tracing::info!("Database migrations applied");
        Ok(())
    }

    /// Wait for the write gate, then open a transaction under it.
    pub async fn begin_write(&self) -> Result<WriteTransaction<'_>, sqlx::Error> {
        let gate = self.write_gate.lock().await;
        let tx = self.pool.begin().await?;
        Ok(WriteTransaction { tx, _gate: gate })
    }
}

/// A transaction that owns the write gate until it is committed or dropped.
/// Dropping it without `commit` rolls back.
pub struct WriteTransaction<'a> {
    tx: Transaction<'static, Sqlite>,
    _gate: MutexGuard<'a, ()>,
}

impl WriteTransaction<'_> {
    pub async fn commit(self) -> Result<(), sqlx::Error> {
        self.tx.commit().await
    }
}

impl Deref for WriteTransaction<'_> {
    type Target = Transaction<'static, Sqlite>;

    fn deref(&self) -> &Self::Target {
        &self.tx
    }
}

impl DerefMut for WriteTransaction<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.tx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let db = DBClient::in_memory().await.unwrap();
        db.migrate().await.unwrap();

        let tables: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT name FROM sqlite_master
            WHERE type = 'table' AND name NOT LIKE '\_%' ESCAPE '\' AND name NOT LIKE 'sqlite%'
            ORDER BY name
            "#,
        )
        .fetch_all(&db.pool)
        .await
        .unwrap();

        let names: Vec<&str> = tables.iter().map(|(name,)| name.as_str()).collect();
        assert_eq!(names, vec!["channel_events", "invite_links", "referral_edges", "users"]);
    }

    #[tokio::test]
    async fn dropped_write_transaction_rolls_back() {
        let db = DBClient::in_memory().await.unwrap();
        {
            let mut tx = db.begin_write().await.unwrap();
            sqlx::query(
                r#"
                INSERT INTO users (user_id, referral_code, created_at)
                VALUES (1, 'ref_x', '2026-01-01T00:00:00Z')
                "#,
            )
            .execute(&mut **tx)
            .await
            .unwrap();
        }

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM users")
            .fetch_one(&db.pool)
            .await
            .unwrap();
        assert_eq!(count, 0);

        // The gate was released with the dropped transaction.
        let tx = db.begin_write().await.unwrap();
        tx.commit().await.unwrap();
    }
}
