use std::{str::FromStr, time::Duration};

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::{
    migrate::MigrateError,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous},
    SqlitePool,
};
use thiserror::Error;
use uuid::Uuid;

use redeem_ledger_core::{Redemption, Subscription};

const MAX_CONNECTIONS: u32 = 5;
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

/// Top-level database handle that owns the SQLite connection pool.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Establishes a new SQLite connection pool for the provided connection string.
    ///
    /// Every pooled connection runs in WAL mode with foreign keys enabled and a
    /// bounded busy timeout.
    pub async fn connect(database_url: &str) -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(StorageError::Connect)?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(BUSY_TIMEOUT);

        let pool = SqlitePoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .acquire_timeout(ACQUIRE_TIMEOUT)
            .connect_with(options)
            .await
            .map_err(StorageError::Connect)?;

        Ok(Self { pool })
    }

    /// Applies migrations located under `migrations/`.
    pub async fn run_migrations(&self) -> Result<(), StorageError> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(StorageError::Migration)?;
        Ok(())
    }

    /// Returns a handle to the per-user subscription records.
    pub fn subscriptions(&self) -> SubscriptionRepository {
        SubscriptionRepository {
            pool: self.pool.clone(),
        }
    }

    /// Returns a handle to the redemption ledger.
    pub fn redemptions(&self) -> RedemptionRepository {
        RedemptionRepository {
            pool: self.pool.clone(),
        }
    }

    /// Returns a handle to the TTL-bound key/value entries.
    pub fn ephemeral(&self) -> EphemeralRepository {
        EphemeralRepository {
            pool: self.pool.clone(),
        }
    }

    /// Runs `PRAGMA wal_checkpoint(TRUNCATE)` and reports the frame counters.
    pub async fn wal_checkpoint_truncate(&self) -> Result<CheckpointStats, sqlx::Error> {
        let (busy, log, checkpointed): (i64, i64, i64) =
            sqlx::query_as("PRAGMA wal_checkpoint(TRUNCATE);")
                .fetch_one(&self.pool)
                .await?;

        Ok(CheckpointStats {
            busy_frames: busy,
            log_frames: log,
            checkpointed_frames: checkpointed,
        })
    }

    /// Exposes the inner pool when lower level access is required.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

/// Result of a WAL checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointStats {
    pub busy_frames: i64,
    pub log_frames: i64,
    pub checkpointed_frames: i64,
}

/// General storage level errors.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("failed to connect to sqlite: {0}")]
    Connect(sqlx::Error),
    #[error("failed to run database migrations: {0}")]
    Migration(MigrateError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Repository for the `subscriptions` table.
#[derive(Clone)]
pub struct SubscriptionRepository {
    pool: SqlitePool,
}

impl SubscriptionRepository {
    /// Looks up the subscription registered for a user.
    pub async fn fetch_by_user(
        &self,
        user_id: &str,
    ) -> Result<Option<Subscription>, SubscriptionError> {
        let row = sqlx::query_as::<_, SubscriptionRow>(
            "SELECT subscription_id, user_id, created_at FROM subscriptions WHERE user_id = ?",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(SubscriptionRow::into_domain))
    }

    /// Removes and returns the subscription registered for a user in a single statement.
    pub async fn take_by_user(
        &self,
        user_id: &str,
    ) -> Result<Option<Subscription>, SubscriptionError> {
        let row = sqlx::query_as::<_, SubscriptionRow>(
            "DELETE FROM subscriptions WHERE user_id = ? \
             RETURNING subscription_id, user_id, created_at",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(SubscriptionRow::into_domain))
    }

    /// Inserts a new subscription.
    ///
    /// Fails with [`SubscriptionError::AlreadyExists`] when the user already has
    /// one, which is how concurrent re-logins for the same user are serialized.
    pub async fn insert(&self, subscription: &Subscription) -> Result<(), SubscriptionError> {
        sqlx::query(
            "INSERT INTO subscriptions (subscription_id, user_id, created_at) VALUES (?, ?, ?)",
        )
        .bind(&subscription.subscription_id)
        .bind(&subscription.user_id)
        .bind(to_rfc3339(subscription.created_at))
        .execute(&self.pool)
        .await
        .map_err(|err| match err {
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
                SubscriptionError::AlreadyExists
            }
            other => SubscriptionError::Database(other),
        })?;

        Ok(())
    }
}

#[derive(Debug, sqlx::FromRow)]
struct SubscriptionRow {
    subscription_id: String,
    user_id: String,
    created_at: DateTime<Utc>,
}

impl SubscriptionRow {
    fn into_domain(self) -> Subscription {
        Subscription {
            user_id: self.user_id,
            subscription_id: self.subscription_id,
            created_at: self.created_at,
        }
    }
}

/// Errors raised by the subscription repository.
#[derive(Debug, Error)]
pub enum SubscriptionError {
    #[error("a subscription already exists for this user")]
    AlreadyExists,
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Repository for the append-only `redemptions` table.
#[derive(Clone)]
pub struct RedemptionRepository {
    pool: SqlitePool,
}

impl RedemptionRepository {
    /// Records a redemption, treating a repeated `event_id` as already stored.
    pub async fn insert(
        &self,
        redemption: &Redemption,
        received_at: DateTime<Utc>,
    ) -> Result<RedemptionInsertOutcome, RedemptionError> {
        let result = sqlx::query(
            "INSERT INTO redemptions \
             (id, event_id, reward_id, reward_name, user_id, user_name, cost, redeemed_at, received_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(&redemption.event_id)
        .bind(&redemption.reward_id)
        .bind(&redemption.reward_name)
        .bind(&redemption.user_id)
        .bind(&redemption.user_name)
        .bind(i64::from(redemption.cost))
        .bind(to_rfc3339(redemption.redeemed_at))
        .bind(to_rfc3339(received_at))
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(RedemptionInsertOutcome::Inserted),
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                Ok(RedemptionInsertOutcome::Duplicate)
            }
            Err(err) => Err(RedemptionError::Database(err)),
        }
    }

    /// Lists redemptions of a reward whose `redeemed_at` lies within `[start, end]`.
    pub async fn list_by_reward(
        &self,
        reward_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Redemption>, RedemptionError> {
        let rows = sqlx::query_as::<_, RedemptionRow>(
            "SELECT event_id, reward_id, reward_name, user_id, user_name, cost, redeemed_at \
               FROM redemptions \
              WHERE reward_id = ? AND redeemed_at >= ? AND redeemed_at <= ? \
              ORDER BY redeemed_at ASC",
        )
        .bind(reward_id)
        .bind(to_rfc3339(start))
        .bind(to_rfc3339(end))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(RedemptionRow::into_domain).collect()
    }
}

/// Result of attempting to insert into `redemptions`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedemptionInsertOutcome {
    Inserted,
    Duplicate,
}

#[derive(Debug, sqlx::FromRow)]
struct RedemptionRow {
    event_id: String,
    reward_id: String,
    reward_name: String,
    user_id: String,
    user_name: String,
    cost: i64,
    redeemed_at: DateTime<Utc>,
}

impl RedemptionRow {
    fn into_domain(self) -> Result<Redemption, RedemptionError> {
        let cost = u32::try_from(self.cost).map_err(|_| RedemptionError::InvalidCost(self.cost))?;
        Ok(Redemption {
            event_id: self.event_id,
            reward_id: self.reward_id,
            reward_name: self.reward_name,
            user_id: self.user_id,
            user_name: self.user_name,
            cost,
            redeemed_at: self.redeemed_at,
        })
    }
}

/// Errors raised by the redemption repository.
#[derive(Debug, Error)]
pub enum RedemptionError {
    #[error("stored cost {0} is out of range")]
    InvalidCost(i64),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Repository for TTL-bound entries in `ephemeral_keys`.
///
/// Expired rows are invisible to every read and are overwritten by writes; the
/// maintenance worker reclaims them in batches.
#[derive(Clone)]
pub struct EphemeralRepository {
    pool: SqlitePool,
}

impl EphemeralRepository {
    /// Stores `value` under `key` unless a live entry already exists.
    ///
    /// Runs as a single upsert statement so two concurrent callers can never
    /// both acquire the same key.
    pub async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<Reservation, EphemeralError> {
        let now_ms = now.timestamp_millis();
        let result = sqlx::query(
            "INSERT INTO ephemeral_keys (key, value, expires_at_ms) VALUES (?, ?, ?) \
             ON CONFLICT(key) DO UPDATE \
             SET value = excluded.value, expires_at_ms = excluded.expires_at_ms \
             WHERE ephemeral_keys.expires_at_ms <= ?",
        )
        .bind(key)
        .bind(value)
        .bind(expiry_ms(now_ms, ttl))
        .bind(now_ms)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            Ok(Reservation::Acquired)
        } else {
            Ok(Reservation::Held)
        }
    }

    /// Stores `value` under `key`, replacing any existing entry.
    pub async fn put(
        &self,
        key: &str,
        value: &str,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<(), EphemeralError> {
        sqlx::query(
            "INSERT INTO ephemeral_keys (key, value, expires_at_ms) VALUES (?, ?, ?) \
             ON CONFLICT(key) DO UPDATE \
             SET value = excluded.value, expires_at_ms = excluded.expires_at_ms",
        )
        .bind(key)
        .bind(value)
        .bind(expiry_ms(now.timestamp_millis(), ttl))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Returns the live value stored under `key`.
    pub async fn get(&self, key: &str, now: DateTime<Utc>) -> Result<Option<String>, EphemeralError> {
        let value = sqlx::query_scalar::<_, String>(
            "SELECT value FROM ephemeral_keys WHERE key = ? AND expires_at_ms > ?",
        )
        .bind(key)
        .bind(now.timestamp_millis())
        .fetch_optional(&self.pool)
        .await?;

        Ok(value)
    }

    /// Deletes `key`, returning whether a row was removed.
    pub async fn delete(&self, key: &str) -> Result<bool, EphemeralError> {
        let result = sqlx::query("DELETE FROM ephemeral_keys WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Deletes up to `limit` expired entries and returns the number removed.
    pub async fn delete_expired_batch(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            "DELETE FROM ephemeral_keys WHERE key IN \
             (SELECT key FROM ephemeral_keys WHERE expires_at_ms <= ? LIMIT ?)",
        )
        .bind(now.timestamp_millis())
        .bind(limit)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}

/// Outcome of [`EphemeralRepository::set_if_absent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reservation {
    /// The key was free (or expired) and now belongs to the caller.
    Acquired,
    /// A live entry already exists.
    Held,
}

/// Errors raised by the ephemeral repository.
#[derive(Debug, Error)]
pub enum EphemeralError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

fn expiry_ms(now_ms: i64, ttl: Duration) -> i64 {
    let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
    now_ms.saturating_add(ttl_ms)
}

/// Fixed-width nanosecond RFC3339, so stored text sorts chronologically.
fn to_rfc3339(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use tempfile::TempDir;

    async fn setup_db() -> (Database, TempDir) {
        let dir = tempfile::tempdir().expect("tempdir");
        let url = format!("sqlite://{}", dir.path().join("ledger.db").display());
        let db = Database::connect(&url).await.expect("connect");
        db.run_migrations().await.expect("migrations");
        (db, dir)
    }

    fn fixed_now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn redemption(event_id: &str, reward_id: &str, redeemed_at: DateTime<Utc>) -> Redemption {
        Redemption {
            event_id: event_id.to_string(),
            reward_id: reward_id.to_string(),
            reward_name: "Tax".to_string(),
            user_id: "viewer-1".to_string(),
            user_name: "Viewer".to_string(),
            cost: 500,
            redeemed_at,
        }
    }

    #[tokio::test]
    async fn migrations_apply() {
        let (db, _dir) = setup_db().await;

        let tables: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' \
             AND name IN ('subscriptions', 'redemptions', 'ephemeral_keys')",
        )
        .fetch_one(db.pool())
        .await
        .expect("fetch tables");
        assert_eq!(tables.0, 3);
    }

    #[tokio::test]
    async fn subscription_is_unique_per_user() {
        let (db, _dir) = setup_db().await;
        let repo = db.subscriptions();
        let first = Subscription {
            user_id: "u-1".into(),
            subscription_id: "sub-1".into(),
            created_at: fixed_now(),
        };
        repo.insert(&first).await.expect("insert");

        let second = Subscription {
            subscription_id: "sub-2".into(),
            ..first.clone()
        };
        let err = repo.insert(&second).await.expect_err("duplicate user");
        assert!(matches!(err, SubscriptionError::AlreadyExists));

        let stored = repo.fetch_by_user("u-1").await.expect("fetch").expect("present");
        assert_eq!(stored, first);
    }

    #[tokio::test]
    async fn take_by_user_removes_record() {
        let (db, _dir) = setup_db().await;
        let repo = db.subscriptions();
        let subscription = Subscription {
            user_id: "u-1".into(),
            subscription_id: "sub-1".into(),
            created_at: fixed_now(),
        };
        repo.insert(&subscription).await.expect("insert");

        let taken = repo.take_by_user("u-1").await.expect("take");
        assert_eq!(taken, Some(subscription));
        assert!(repo.fetch_by_user("u-1").await.expect("fetch").is_none());
        assert!(repo.take_by_user("u-1").await.expect("take again").is_none());
    }

    #[tokio::test]
    async fn redemption_insert_is_idempotent_per_event() {
        let (db, _dir) = setup_db().await;
        let repo = db.redemptions();
        let record = redemption("evt-1", "reward-1", fixed_now());

        let outcome = repo.insert(&record, fixed_now()).await.expect("insert");
        assert_eq!(outcome, RedemptionInsertOutcome::Inserted);
        let outcome = repo.insert(&record, fixed_now()).await.expect("duplicate ok");
        assert_eq!(outcome, RedemptionInsertOutcome::Duplicate);

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM redemptions")
            .fetch_one(db.pool())
            .await
            .expect("count");
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn list_by_reward_filters_range_inclusively() {
        let (db, _dir) = setup_db().await;
        let repo = db.redemptions();
        let start = fixed_now();
        let end = start + ChronoDuration::days(1);

        for (id, reward, at) in [
            ("before", "reward-1", start - ChronoDuration::seconds(1)),
            ("at-start", "reward-1", start),
            ("middle", "reward-1", start + ChronoDuration::hours(6)),
            ("at-end", "reward-1", end),
            ("after", "reward-1", end + ChronoDuration::seconds(1)),
            ("other-reward", "reward-2", start + ChronoDuration::hours(1)),
        ] {
            repo.insert(&redemption(id, reward, at), start)
                .await
                .expect("insert");
        }

        let rows = repo
            .list_by_reward("reward-1", start, end)
            .await
            .expect("list");
        let ids: Vec<&str> = rows.iter().map(|row| row.event_id.as_str()).collect();
        assert_eq!(ids, vec!["at-start", "middle", "at-end"]);
        assert_eq!(rows[0].cost, 500);
    }

    #[tokio::test]
    async fn redeemed_at_keeps_sub_millisecond_precision() {
        let (db, _dir) = setup_db().await;
        let repo = db.redemptions();
        let redeemed_at = DateTime::parse_from_rfc3339("2024-01-01T00:00:00.123456789Z")
            .unwrap()
            .with_timezone(&Utc);
        let later = redeemed_at + ChronoDuration::nanoseconds(1);
        repo.insert(&redemption("precise", "reward-1", redeemed_at), fixed_now())
            .await
            .expect("insert");
        repo.insert(&redemption("next", "reward-1", later), fixed_now())
            .await
            .expect("insert");

        let rows = repo
            .list_by_reward("reward-1", redeemed_at, redeemed_at)
            .await
            .expect("list");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].event_id, "precise");
        assert_eq!(rows[0].redeemed_at, redeemed_at);
    }

    #[tokio::test]
    async fn set_if_absent_reserves_once_until_expiry() {
        let (db, _dir) = setup_db().await;
        let repo = db.ephemeral();
        let now = fixed_now();
        let ttl = Duration::from_secs(60);

        assert_eq!(
            repo.set_if_absent("dedup:k", "1", now, ttl).await.unwrap(),
            Reservation::Acquired
        );
        assert_eq!(
            repo.set_if_absent("dedup:k", "1", now + ChronoDuration::seconds(59), ttl)
                .await
                .unwrap(),
            Reservation::Held
        );
        assert_eq!(
            repo.set_if_absent("dedup:k", "1", now + ChronoDuration::seconds(60), ttl)
                .await
                .unwrap(),
            Reservation::Acquired
        );
    }

    #[tokio::test]
    async fn delete_releases_reservation() {
        let (db, _dir) = setup_db().await;
        let repo = db.ephemeral();
        let now = fixed_now();
        let ttl = Duration::from_secs(60);

        repo.set_if_absent("dedup:k", "1", now, ttl).await.unwrap();
        assert!(repo.delete("dedup:k").await.unwrap());
        assert!(!repo.delete("dedup:k").await.unwrap());
        assert_eq!(
            repo.set_if_absent("dedup:k", "1", now, ttl).await.unwrap(),
            Reservation::Acquired
        );
    }

    #[tokio::test]
    async fn get_hides_expired_values() {
        let (db, _dir) = setup_db().await;
        let repo = db.ephemeral();
        let now = fixed_now();

        repo.put("token", "abc", now, Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(repo.get("token", now).await.unwrap().as_deref(), Some("abc"));
        assert!(repo
            .get("token", now + ChronoDuration::seconds(10))
            .await
            .unwrap()
            .is_none());

        repo.put("token", "def", now, Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(repo.get("token", now).await.unwrap().as_deref(), Some("def"));
    }

    #[tokio::test]
    async fn delete_expired_batch_only_removes_expired() {
        let (db, _dir) = setup_db().await;
        let repo = db.ephemeral();
        let now = fixed_now();

        for idx in 0..3 {
            repo.put(&format!("old-{idx}"), "1", now, Duration::from_secs(1))
                .await
                .unwrap();
        }
        repo.put("fresh", "1", now, Duration::from_secs(600))
            .await
            .unwrap();

        let later = now + ChronoDuration::seconds(5);
        assert_eq!(repo.delete_expired_batch(later, 2).await.unwrap(), 2);
        assert_eq!(repo.delete_expired_batch(later, 2).await.unwrap(), 1);
        assert_eq!(repo.delete_expired_batch(later, 2).await.unwrap(), 0);
        assert!(repo.get("fresh", later).await.unwrap().is_some());
    }
}
