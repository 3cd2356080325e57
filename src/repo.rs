use crate::error::{AppError, AppResult};
use crate::types::{PollOption, PollStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{postgres::PgPoolOptions, Pool, Postgres};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;

pub const MAX_PAGE_LIMIT: i64 = 50;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollRecord {
    pub id: String,
    pub title: String,
    pub description: String,
    pub options: Vec<PollOption>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    /// Stored status: only DRAFT or ACTIVE ever persist. ENDED is derived
    /// from `end_time` at the API boundary.
    pub status: PollStatus,
    pub group_id: String,
    pub creator_address: String,
    pub activation_tx_hash: Option<String>,
    pub creation_tx_hash: Option<String>,
    pub vote_count: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy)]
pub struct NewPoll<'a> {
    pub poll_id: &'a str,
    pub creator_address: &'a str,
    pub title: &'a str,
    pub description: &'a str,
    pub options: &'a [PollOption],
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PollFilter<'a> {
    pub status: Option<PollStatus>,
    pub creator: Option<&'a str>,
    pub page: i64,
    pub limit: i64,
}

/// Decoded chain event as the tail hands it to the store. Field elements
/// and group ids travel as decimal strings, hashes as 0x-hex.
#[derive(Debug, Clone)]
pub enum ChainEvent {
    PollCreated {
        poll_id: String,
        creator: String,
        tx_hash: String,
        block_number: u64,
        log_index: u64,
    },
    PollActivated {
        poll_id: String,
        group_id: String,
        tx_hash: String,
        block_number: u64,
        log_index: u64,
    },
    VoteCast {
        poll_id: String,
        option_index: u8,
        nullifier_hash: String,
        tx_hash: String,
        block_number: u64,
        log_index: u64,
    },
}

impl ChainEvent {
    pub fn position(&self) -> (u64, u64) {
        match self {
            ChainEvent::PollCreated {
                block_number,
                log_index,
                ..
            }
            | ChainEvent::PollActivated {
                block_number,
                log_index,
                ..
            }
            | ChainEvent::VoteCast {
                block_number,
                log_index,
                ..
            } => (*block_number, *log_index),
        }
    }

    pub fn poll_id(&self) -> &str {
        match self {
            ChainEvent::PollCreated { poll_id, .. }
            | ChainEvent::PollActivated { poll_id, .. }
            | ChainEvent::VoteCast { poll_id, .. } => poll_id,
        }
    }
}

/// Per-event result of a tail apply. Non-applied outcomes are logged and
/// dropped; none of them abort the batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    DraftStamped,
    CreatorPending,
    Activated,
    AlreadyActive,
    ActivationMissingRoster,
    ActivationUnknownPoll,
    VoteRecorded,
    VoteDuplicate,
    VoteBadOption,
    VoteUnknownPoll,
}

#[async_trait]
pub trait PollStore {
    async fn insert_draft_poll(&self, poll: NewPoll<'_>) -> AppResult<PollRecord>;
    async fn get_poll(&self, poll_id: &str) -> AppResult<PollRecord>;
    async fn list_polls(&self, filter: PollFilter<'_>) -> AppResult<(Vec<PollRecord>, i64)>;
    async fn update_metadata(
        &self,
        poll_id: &str,
        actor: &str,
        title: Option<&str>,
        description: Option<&str>,
    ) -> AppResult<PollRecord>;
    async fn set_roster(&self, poll_id: &str, commitments: &[String]) -> AppResult<()>;
    async fn get_roster(&self, poll_id: &str) -> AppResult<Vec<String>>;
    async fn vote_counts(&self, poll_id: &str) -> AppResult<Vec<(i16, i64)>>;
    async fn upsert_user(&self, address: &str) -> AppResult<()>;
}

/// The tail's store surface. `apply_tail_batch` is the sole writer of
/// activations, votes and the cursor; the whole batch commits atomically.
#[async_trait]
pub trait TailSink {
    async fn load_cursor(&self) -> AppResult<u64>;
    async fn apply_tail_batch(
        &self,
        events: &[ChainEvent],
        new_cursor: u64,
    ) -> AppResult<Vec<ApplyOutcome>>;
}

/// Postgres-backed store.
#[derive(Clone)]
pub struct PgStore {
    pool: Pool<Postgres>,
}

const POLL_COLUMNS: &str = "p.id, p.title, p.description, p.options, p.start_time, p.end_time, \
     p.status, p.group_id, p.created_by, p.activation_tx_hash, p.creation_tx_hash, \
     p.created_at, p.updated_at, \
     (SELECT COUNT(*) FROM poll_vote v WHERE v.poll_id = p.id) AS vote_count";

impl PgStore {
    pub async fn connect(url: &str) -> AppResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(url)
            .await
            .map_err(AppError::Db)?;
        init_schema(&pool).await?;
        Ok(Self { pool })
    }

    async fn apply_activation(
        tx: &mut sqlx::Transaction<'_, Postgres>,
        poll_id: &str,
        group_id: &str,
        tx_hash: &str,
        block_number: u64,
    ) -> AppResult<ApplyOutcome> {
        let updated = sqlx::query(
            r#"
            UPDATE poll
            SET status = 'ACTIVE',
                group_id = $2,
                activation_tx_hash = $3,
                activation_block = $4,
                updated_at = now()
            WHERE id = $1
              AND status = 'DRAFT'
              AND EXISTS (SELECT 1 FROM poll_member m WHERE m.poll_id = poll.id)
            "#,
        )
        .bind(poll_id)
        .bind(group_id)
        .bind(tx_hash)
        .bind(block_number as i64)
        .execute(&mut **tx)
        .await
        .map_err(AppError::Db)?;
        if updated.rows_affected() == 1 {
            return Ok(ApplyOutcome::Activated);
        }
        let status = sqlx::query_scalar::<_, String>("SELECT status FROM poll WHERE id = $1")
            .bind(poll_id)
            .fetch_optional(&mut **tx)
            .await
            .map_err(AppError::Db)?;
        Ok(match status.as_deref() {
            None => ApplyOutcome::ActivationUnknownPoll,
            Some("ACTIVE") => ApplyOutcome::AlreadyActive,
            Some(_) => ApplyOutcome::ActivationMissingRoster,
        })
    }

    async fn apply_vote(
        tx: &mut sqlx::Transaction<'_, Postgres>,
        poll_id: &str,
        option_index: u8,
        nullifier_hash: &str,
        tx_hash: &str,
        block_number: u64,
    ) -> AppResult<ApplyOutcome> {
        let options = sqlx::query_scalar::<_, serde_json::Value>(
            "SELECT options FROM poll WHERE id = $1",
        )
        .bind(poll_id)
        .fetch_optional(&mut **tx)
        .await
        .map_err(AppError::Db)?;
        let Some(options) = options else {
            return Ok(ApplyOutcome::VoteUnknownPoll);
        };
        let count = options.as_array().map(Vec::len).unwrap_or(0);
        if option_index as usize >= count {
            return Ok(ApplyOutcome::VoteBadOption);
        }
        let inserted = sqlx::query(
            r#"
            INSERT INTO poll_vote (poll_id, option_index, nullifier_hash, block_number, tx_hash)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (nullifier_hash) DO NOTHING
            "#,
        )
        .bind(poll_id)
        .bind(option_index as i16)
        .bind(nullifier_hash)
        .bind(block_number as i64)
        .bind(tx_hash)
        .execute(&mut **tx)
        .await
        .map_err(AppError::Db)?;
        Ok(if inserted.rows_affected() == 1 {
            ApplyOutcome::VoteRecorded
        } else {
            ApplyOutcome::VoteDuplicate
        })
    }

    async fn apply_created(
        tx: &mut sqlx::Transaction<'_, Postgres>,
        poll_id: &str,
        creator: &str,
        tx_hash: &str,
        block_number: u64,
    ) -> AppResult<ApplyOutcome> {
        let stamped = sqlx::query(
            r#"
            UPDATE poll
            SET creation_tx_hash = COALESCE(creation_tx_hash, $2), updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(poll_id)
        .bind(tx_hash)
        .execute(&mut **tx)
        .await
        .map_err(AppError::Db)?;
        if stamped.rows_affected() == 1 {
            return Ok(ApplyOutcome::DraftStamped);
        }
        sqlx::query(
            r#"
            INSERT INTO poll_creator_binding (poll_id, creator, tx_hash, block_number)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (poll_id) DO NOTHING
            "#,
        )
        .bind(poll_id)
        .bind(creator)
        .bind(tx_hash)
        .bind(block_number as i64)
        .execute(&mut **tx)
        .await
        .map_err(AppError::Db)?;
        Ok(ApplyOutcome::CreatorPending)
    }
}

#[async_trait]
impl PollStore for PgStore {
    async fn insert_draft_poll(&self, poll: NewPoll<'_>) -> AppResult<PollRecord> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO poll (id, title, description, options, start_time, end_time, status, group_id, created_by)
            VALUES ($1, $2, $3, $4, $5, $6, 'DRAFT', '0', $7)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(poll.poll_id)
        .bind(poll.title)
        .bind(poll.description)
        .bind(serde_json::to_value(poll.options).map_err(|e| AppError::Internal(e.to_string()))?)
        .bind(poll.start_time)
        .bind(poll.end_time)
        .bind(poll.creator_address)
        .execute(&self.pool)
        .await
        .map_err(AppError::Db)?;
        if inserted.rows_affected() == 0 {
            return Err(AppError::Conflict(format!(
                "poll {} already exists",
                poll.poll_id
            )));
        }
        self.get_poll(poll.poll_id).await
    }

    async fn get_poll(&self, poll_id: &str) -> AppResult<PollRecord> {
        let query = format!("SELECT {POLL_COLUMNS} FROM poll p WHERE p.id = $1");
        let rec = sqlx::query_as::<_, DbPoll>(&query)
            .bind(poll_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(AppError::Db)?;
        rec.map(Into::into).ok_or(AppError::NotFound)
    }

    async fn list_polls(&self, filter: PollFilter<'_>) -> AppResult<(Vec<PollRecord>, i64)> {
        let limit = filter.limit.clamp(1, MAX_PAGE_LIMIT);
        let page = filter.page.max(1);
        let now = Utc::now();
        // The requested status is translated into a stored-status predicate
        // plus a time predicate: ENDED is ACTIVE whose end_time has passed.
        let (stored, ended) = match filter.status {
            None => (None, None),
            Some(PollStatus::Draft) => (Some("DRAFT"), None),
            Some(PollStatus::Active) => (Some("ACTIVE"), Some(false)),
            Some(PollStatus::Ended) => (Some("ACTIVE"), Some(true)),
        };
        let query = format!(
            r#"
            SELECT {POLL_COLUMNS} FROM poll p
            WHERE ($1::TEXT IS NULL OR p.status = $1)
              AND ($2::BOOLEAN IS NULL OR (p.end_time <= $3) = $2)
              AND ($4::TEXT IS NULL OR p.created_by = $4)
            ORDER BY p.created_at DESC
            LIMIT $5 OFFSET $6
            "#
        );
        let rows = sqlx::query_as::<_, DbPoll>(&query)
            .bind(stored)
            .bind(ended)
            .bind(now)
            .bind(filter.creator)
            .bind(limit)
            .bind((page - 1) * limit)
            .fetch_all(&self.pool)
            .await
            .map_err(AppError::Db)?;
        let total = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT COUNT(*) FROM poll p
            WHERE ($1::TEXT IS NULL OR p.status = $1)
              AND ($2::BOOLEAN IS NULL OR (p.end_time <= $3) = $2)
              AND ($4::TEXT IS NULL OR p.created_by = $4)
            "#,
        )
        .bind(stored)
        .bind(ended)
        .bind(now)
        .bind(filter.creator)
        .fetch_one(&self.pool)
        .await
        .map_err(AppError::Db)?;
        Ok((rows.into_iter().map(Into::into).collect(), total))
    }

    async fn update_metadata(
        &self,
        poll_id: &str,
        actor: &str,
        title: Option<&str>,
        description: Option<&str>,
    ) -> AppResult<PollRecord> {
        let current = self.get_poll(poll_id).await?;
        if current.creator_address != actor {
            return Err(AppError::Forbidden("not the poll creator".into()));
        }
        if current.status != PollStatus::Draft {
            return Err(AppError::Conflict(
                "metadata can only change while the poll is a draft".into(),
            ));
        }
        let updated = sqlx::query(
            r#"
            UPDATE poll
            SET title = COALESCE($2, title),
                description = COALESCE($3, description),
                updated_at = now()
            WHERE id = $1 AND status = 'DRAFT' AND created_by = $4
            "#,
        )
        .bind(poll_id)
        .bind(title)
        .bind(description)
        .bind(actor)
        .execute(&self.pool)
        .await
        .map_err(AppError::Db)?;
        if updated.rows_affected() == 0 {
            // Lost a race with activation between the read and the write.
            return Err(AppError::Conflict(
                "metadata can only change while the poll is a draft".into(),
            ));
        }
        self.get_poll(poll_id).await
    }

    async fn set_roster(&self, poll_id: &str, commitments: &[String]) -> AppResult<()> {
        let mut tx = self.pool.begin().await.map_err(AppError::Db)?;
        let status =
            sqlx::query_scalar::<_, String>("SELECT status FROM poll WHERE id = $1 FOR UPDATE")
                .bind(poll_id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(AppError::Db)?;
        match status.as_deref() {
            None => return Err(AppError::NotFound),
            Some("DRAFT") => {}
            Some(_) => {
                return Err(AppError::Conflict(
                    "roster can only be set on a draft poll".into(),
                ))
            }
        }
        let existing = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM poll_member WHERE poll_id = $1",
        )
        .bind(poll_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(AppError::Db)?;
        if existing > 0 {
            return Err(AppError::Conflict("roster already set".into()));
        }
        for (position, commitment) in commitments.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO poll_member (poll_id, position, commitment)
                VALUES ($1, $2, $3)
                "#,
            )
            .bind(poll_id)
            .bind(position as i32)
            .bind(commitment)
            .execute(&mut *tx)
            .await
            .map_err(AppError::Db)?;
        }
        tx.commit().await.map_err(AppError::Db)?;
        Ok(())
    }

    async fn get_roster(&self, poll_id: &str) -> AppResult<Vec<String>> {
        self.get_poll(poll_id).await?;
        let rows = sqlx::query_scalar::<_, String>(
            r#"
            SELECT commitment FROM poll_member WHERE poll_id = $1 ORDER BY position
            "#,
        )
        .bind(poll_id)
        .fetch_all(&self.pool)
        .await
        .map_err(AppError::Db)?;
        Ok(rows)
    }

    async fn vote_counts(&self, poll_id: &str) -> AppResult<Vec<(i16, i64)>> {
        let rows = sqlx::query_as::<_, (i16, i64)>(
            r#"
            SELECT option_index, COUNT(*) FROM poll_vote
            WHERE poll_id = $1
            GROUP BY option_index
            ORDER BY option_index
            "#,
        )
        .bind(poll_id)
        .fetch_all(&self.pool)
        .await
        .map_err(AppError::Db)?;
        Ok(rows)
    }

    async fn upsert_user(&self, address: &str) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO users (address)
            VALUES ($1)
            ON CONFLICT (address) DO UPDATE SET updated_at = now()
            "#,
        )
        .bind(address)
        .execute(&self.pool)
        .await
        .map_err(AppError::Db)?;
        Ok(())
    }
}

#[async_trait]
impl TailSink for PgStore {
    async fn load_cursor(&self) -> AppResult<u64> {
        let value = sqlx::query_scalar::<_, i64>(
            "SELECT last_block_scanned FROM tail_cursor WHERE id = TRUE",
        )
        .fetch_one(&self.pool)
        .await
        .map_err(AppError::Db)?;
        Ok(value as u64)
    }

    async fn apply_tail_batch(
        &self,
        events: &[ChainEvent],
        new_cursor: u64,
    ) -> AppResult<Vec<ApplyOutcome>> {
        let mut tx = self.pool.begin().await.map_err(AppError::Db)?;
        let mut outcomes = Vec::with_capacity(events.len());
        for event in events {
            let outcome = match event {
                ChainEvent::PollCreated {
                    poll_id,
                    creator,
                    tx_hash,
                    block_number,
                    ..
                } => Self::apply_created(&mut tx, poll_id, creator, tx_hash, *block_number).await?,
                ChainEvent::PollActivated {
                    poll_id,
                    group_id,
                    tx_hash,
                    block_number,
                    ..
                } => {
                    Self::apply_activation(&mut tx, poll_id, group_id, tx_hash, *block_number)
                        .await?
                }
                ChainEvent::VoteCast {
                    poll_id,
                    option_index,
                    nullifier_hash,
                    tx_hash,
                    block_number,
                    ..
                } => {
                    Self::apply_vote(
                        &mut tx,
                        poll_id,
                        *option_index,
                        nullifier_hash,
                        tx_hash,
                        *block_number,
                    )
                    .await?
                }
            };
            outcomes.push(outcome);
        }
        // Cursor never moves backward even if a stale window is replayed.
        sqlx::query(
            r#"
            UPDATE tail_cursor
            SET last_block_scanned = GREATEST(last_block_scanned, $1)
            WHERE id = TRUE
            "#,
        )
        .bind(new_cursor as i64)
        .execute(&mut *tx)
        .await
        .map_err(AppError::Db)?;
        tx.commit().await.map_err(AppError::Db)?;
        Ok(outcomes)
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct DbPoll {
    id: String,
    title: String,
    description: String,
    options: serde_json::Value,
    start_time: DateTime<Utc>,
    end_time: DateTime<Utc>,
    status: String,
    group_id: String,
    created_by: String,
    activation_tx_hash: Option<String>,
    creation_tx_hash: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    vote_count: i64,
}

impl From<DbPoll> for PollRecord {
    fn from(value: DbPoll) -> Self {
        let options: Vec<PollOption> = serde_json::from_value(value.options).unwrap_or_default();
        let status = value.status.parse().unwrap_or(PollStatus::Draft);
        PollRecord {
            id: value.id,
            title: value.title,
            description: value.description,
            options,
            start_time: value.start_time,
            end_time: value.end_time,
            status,
            group_id: value.group_id,
            creator_address: value.created_by,
            activation_tx_hash: value.activation_tx_hash,
            creation_tx_hash: value.creation_tx_hash,
            vote_count: value.vote_count,
            created_at: value.created_at,
            updated_at: value.updated_at,
        }
    }
}

async fn init_schema(pool: &Pool<Postgres>) -> AppResult<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS poll (
            id TEXT PRIMARY KEY,
            title TEXT NOT NULL,
            description TEXT NOT NULL,
            options JSONB NOT NULL,
            start_time TIMESTAMPTZ NOT NULL,
            end_time TIMESTAMPTZ NOT NULL,
            status TEXT NOT NULL DEFAULT 'DRAFT',
            group_id TEXT NOT NULL DEFAULT '0',
            created_by TEXT NOT NULL,
            activation_tx_hash TEXT,
            activation_block BIGINT,
            creation_tx_hash TEXT,
            created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(AppError::Db)?;

    sqlx::query("CREATE INDEX IF NOT EXISTS poll_status_idx ON poll(status)")
        .execute(pool)
        .await
        .map_err(AppError::Db)?;

    sqlx::query("CREATE INDEX IF NOT EXISTS poll_created_by_idx ON poll(created_by)")
        .execute(pool)
        .await
        .map_err(AppError::Db)?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS poll_member (
            poll_id TEXT NOT NULL REFERENCES poll(id) ON DELETE CASCADE,
            position INTEGER NOT NULL,
            commitment TEXT NOT NULL,
            created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
            UNIQUE(poll_id, position),
            UNIQUE(poll_id, commitment)
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(AppError::Db)?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS poll_vote (
            id BIGSERIAL PRIMARY KEY,
            poll_id TEXT NOT NULL REFERENCES poll(id) ON DELETE CASCADE,
            option_index SMALLINT NOT NULL,
            nullifier_hash TEXT NOT NULL,
            block_number BIGINT NOT NULL,
            tx_hash TEXT NOT NULL,
            created_at TIMESTAMPTZ NOT NULL DEFAULT now()
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(AppError::Db)?;

    sqlx::query(
        "CREATE UNIQUE INDEX IF NOT EXISTS poll_vote_nullifier_idx ON poll_vote(nullifier_hash)",
    )
    .execute(pool)
    .await
    .map_err(AppError::Db)?;

    sqlx::query("CREATE INDEX IF NOT EXISTS poll_vote_poll_idx ON poll_vote(poll_id)")
        .execute(pool)
        .await
        .map_err(AppError::Db)?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS users (
            address TEXT PRIMARY KEY,
            created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(AppError::Db)?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS poll_creator_binding (
            poll_id TEXT PRIMARY KEY,
            creator TEXT NOT NULL,
            tx_hash TEXT NOT NULL,
            block_number BIGINT NOT NULL,
            created_at TIMESTAMPTZ NOT NULL DEFAULT now()
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(AppError::Db)?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS tail_cursor (
            id BOOLEAN PRIMARY KEY DEFAULT TRUE CHECK (id),
            last_block_scanned BIGINT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(AppError::Db)?;

    sqlx::query(
        r#"
        INSERT INTO tail_cursor (id, last_block_scanned)
        VALUES (TRUE, 0)
        ON CONFLICT (id) DO NOTHING
        "#,
    )
    .execute(pool)
    .await
    .map_err(AppError::Db)?;

    Ok(())
}

/// In-memory store for tests. Mirrors the Postgres guards, including the
/// global nullifier index and the status-conditional activation.
#[derive(Clone)]
pub struct InMemoryStore {
    polls: Arc<RwLock<HashMap<String, PollRecord>>>,
    rosters: Arc<RwLock<HashMap<String, Vec<String>>>>,
    votes: Arc<RwLock<Vec<VoteRow>>>,
    nullifiers: Arc<RwLock<HashSet<String>>>,
    users: Arc<RwLock<HashMap<String, DateTime<Utc>>>>,
    bindings: Arc<RwLock<HashMap<String, String>>>,
    cursor: Arc<RwLock<u64>>,
}

#[derive(Debug, Clone)]
struct VoteRow {
    poll_id: String,
    option_index: i16,
    nullifier_hash: String,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self {
            polls: Arc::new(RwLock::new(HashMap::new())),
            rosters: Arc::new(RwLock::new(HashMap::new())),
            votes: Arc::new(RwLock::new(Vec::new())),
            nullifiers: Arc::new(RwLock::new(HashSet::new())),
            users: Arc::new(RwLock::new(HashMap::new())),
            bindings: Arc::new(RwLock::new(HashMap::new())),
            cursor: Arc::new(RwLock::new(0)),
        }
    }
}

impl InMemoryStore {
    /// Test helper: pending creator bindings recorded for unknown polls.
    pub async fn creator_binding(&self, poll_id: &str) -> Option<String> {
        self.bindings.read().await.get(poll_id).cloned()
    }

    /// Test helper: rewind the cursor to simulate a replay from an earlier
    /// block.
    pub async fn reset_cursor(&self, value: u64) {
        *self.cursor.write().await = value;
    }

    fn filled_record(record: &PollRecord, vote_count: i64) -> PollRecord {
        let mut out = record.clone();
        out.vote_count = vote_count;
        out
    }

    async fn count_votes(&self, poll_id: &str) -> i64 {
        self.votes
            .read()
            .await
            .iter()
            .filter(|v| v.poll_id == poll_id)
            .count() as i64
    }
}

#[async_trait]
impl PollStore for InMemoryStore {
    async fn insert_draft_poll(&self, poll: NewPoll<'_>) -> AppResult<PollRecord> {
        let mut polls = self.polls.write().await;
        if polls.contains_key(poll.poll_id) {
            return Err(AppError::Conflict(format!(
                "poll {} already exists",
                poll.poll_id
            )));
        }
        let now = Utc::now();
        let record = PollRecord {
            id: poll.poll_id.to_string(),
            title: poll.title.to_string(),
            description: poll.description.to_string(),
            options: poll.options.to_vec(),
            start_time: poll.start_time,
            end_time: poll.end_time,
            status: PollStatus::Draft,
            group_id: "0".to_string(),
            creator_address: poll.creator_address.to_string(),
            activation_tx_hash: None,
            creation_tx_hash: None,
            vote_count: 0,
            created_at: now,
            updated_at: now,
        };
        polls.insert(poll.poll_id.to_string(), record.clone());
        Ok(record)
    }

    async fn get_poll(&self, poll_id: &str) -> AppResult<PollRecord> {
        let record = {
            let polls = self.polls.read().await;
            polls.get(poll_id).cloned().ok_or(AppError::NotFound)?
        };
        let votes = self.count_votes(poll_id).await;
        Ok(Self::filled_record(&record, votes))
    }

    async fn list_polls(&self, filter: PollFilter<'_>) -> AppResult<(Vec<PollRecord>, i64)> {
        let limit = filter.limit.clamp(1, MAX_PAGE_LIMIT);
        let page = filter.page.max(1);
        let now = Utc::now();
        let polls = self.polls.read().await;
        let mut matched: Vec<PollRecord> = polls
            .values()
            .filter(|p| match filter.status {
                None => true,
                Some(PollStatus::Draft) => p.status == PollStatus::Draft,
                Some(PollStatus::Active) => p.status == PollStatus::Active && p.end_time > now,
                Some(PollStatus::Ended) => p.status == PollStatus::Active && p.end_time <= now,
            })
            .filter(|p| filter.creator.map_or(true, |c| p.creator_address == c))
            .cloned()
            .collect();
        drop(polls);
        matched.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        let total = matched.len() as i64;
        let start = ((page - 1) * limit) as usize;
        let page_items: Vec<PollRecord> = matched
            .into_iter()
            .skip(start)
            .take(limit as usize)
            .collect();
        let mut out = Vec::with_capacity(page_items.len());
        for record in page_items {
            let votes = self.count_votes(&record.id).await;
            out.push(Self::filled_record(&record, votes));
        }
        Ok((out, total))
    }

    async fn update_metadata(
        &self,
        poll_id: &str,
        actor: &str,
        title: Option<&str>,
        description: Option<&str>,
    ) -> AppResult<PollRecord> {
        let mut polls = self.polls.write().await;
        let record = polls.get_mut(poll_id).ok_or(AppError::NotFound)?;
        if record.creator_address != actor {
            return Err(AppError::Forbidden("not the poll creator".into()));
        }
        if record.status != PollStatus::Draft {
            return Err(AppError::Conflict(
                "metadata can only change while the poll is a draft".into(),
            ));
        }
        if let Some(title) = title {
            record.title = title.to_string();
        }
        if let Some(description) = description {
            record.description = description.to_string();
        }
        record.updated_at = Utc::now();
        Ok(record.clone())
    }

    async fn set_roster(&self, poll_id: &str, commitments: &[String]) -> AppResult<()> {
        let polls = self.polls.read().await;
        let record = polls.get(poll_id).ok_or(AppError::NotFound)?;
        if record.status != PollStatus::Draft {
            return Err(AppError::Conflict(
                "roster can only be set on a draft poll".into(),
            ));
        }
        drop(polls);
        let mut rosters = self.rosters.write().await;
        if rosters.contains_key(poll_id) {
            return Err(AppError::Conflict("roster already set".into()));
        }
        rosters.insert(poll_id.to_string(), commitments.to_vec());
        Ok(())
    }

    async fn get_roster(&self, poll_id: &str) -> AppResult<Vec<String>> {
        if !self.polls.read().await.contains_key(poll_id) {
            return Err(AppError::NotFound);
        }
        Ok(self
            .rosters
            .read()
            .await
            .get(poll_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn vote_counts(&self, poll_id: &str) -> AppResult<Vec<(i16, i64)>> {
        let votes = self.votes.read().await;
        let mut counts: HashMap<i16, i64> = HashMap::new();
        for vote in votes.iter().filter(|v| v.poll_id == poll_id) {
            *counts.entry(vote.option_index).or_insert(0) += 1;
        }
        let mut out: Vec<(i16, i64)> = counts.into_iter().collect();
        out.sort_by_key(|(idx, _)| *idx);
        Ok(out)
    }

    async fn upsert_user(&self, address: &str) -> AppResult<()> {
        self.users
            .write()
            .await
            .insert(address.to_string(), Utc::now());
        Ok(())
    }
}

#[async_trait]
impl TailSink for InMemoryStore {
    async fn load_cursor(&self) -> AppResult<u64> {
        Ok(*self.cursor.read().await)
    }

    async fn apply_tail_batch(
        &self,
        events: &[ChainEvent],
        new_cursor: u64,
    ) -> AppResult<Vec<ApplyOutcome>> {
        let mut outcomes = Vec::with_capacity(events.len());
        for event in events {
            let outcome = match event {
                ChainEvent::PollCreated {
                    poll_id,
                    creator,
                    tx_hash,
                    ..
                } => {
                    let mut polls = self.polls.write().await;
                    if let Some(record) = polls.get_mut(poll_id) {
                        if record.creation_tx_hash.is_none() {
                            record.creation_tx_hash = Some(tx_hash.clone());
                            record.updated_at = Utc::now();
                        }
                        ApplyOutcome::DraftStamped
                    } else {
                        self.bindings
                            .write()
                            .await
                            .entry(poll_id.clone())
                            .or_insert_with(|| creator.clone());
                        ApplyOutcome::CreatorPending
                    }
                }
                ChainEvent::PollActivated {
                    poll_id,
                    group_id,
                    tx_hash,
                    ..
                } => {
                    let roster_set = self
                        .rosters
                        .read()
                        .await
                        .get(poll_id)
                        .map_or(false, |r| !r.is_empty());
                    let mut polls = self.polls.write().await;
                    match polls.get_mut(poll_id) {
                        None => ApplyOutcome::ActivationUnknownPoll,
                        Some(record) if record.status == PollStatus::Active => {
                            ApplyOutcome::AlreadyActive
                        }
                        Some(_) if !roster_set => ApplyOutcome::ActivationMissingRoster,
                        Some(record) => {
                            record.status = PollStatus::Active;
                            record.group_id = group_id.clone();
                            record.activation_tx_hash = Some(tx_hash.clone());
                            record.updated_at = Utc::now();
                            ApplyOutcome::Activated
                        }
                    }
                }
                ChainEvent::VoteCast {
                    poll_id,
                    option_index,
                    nullifier_hash,
                    ..
                } => {
                    let option_count = {
                        let polls = self.polls.read().await;
                        polls.get(poll_id).map(|p| p.options.len())
                    };
                    match option_count {
                        None => ApplyOutcome::VoteUnknownPoll,
                        Some(count) if *option_index as usize >= count => {
                            ApplyOutcome::VoteBadOption
                        }
                        Some(_) => {
                            let mut nullifiers = self.nullifiers.write().await;
                            if !nullifiers.insert(nullifier_hash.clone()) {
                                ApplyOutcome::VoteDuplicate
                            } else {
                                self.votes.write().await.push(VoteRow {
                                    poll_id: poll_id.clone(),
                                    option_index: *option_index as i16,
                                    nullifier_hash: nullifier_hash.clone(),
                                });
                                ApplyOutcome::VoteRecorded
                            }
                        }
                    }
                }
            };
            outcomes.push(outcome);
        }
        let mut cursor = self.cursor.write().await;
        *cursor = (*cursor).max(new_cursor);
        Ok(outcomes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(n: u8) -> Vec<PollOption> {
        (0..n)
            .map(|id| PollOption {
                id,
                label: format!("option-{id}"),
            })
            .collect()
    }

    fn draft<'a>(poll_id: &'a str, creator: &'a str, opts: &'a [PollOption]) -> NewPoll<'a> {
        NewPoll {
            poll_id,
            creator_address: creator,
            title: "t",
            description: "d",
            options: opts,
            start_time: Utc::now(),
            end_time: Utc::now() + chrono::Duration::hours(1),
        }
    }

    fn activation(poll_id: &str, block: u64) -> ChainEvent {
        ChainEvent::PollActivated {
            poll_id: poll_id.to_string(),
            group_id: "42".to_string(),
            tx_hash: "0xa1".to_string(),
            block_number: block,
            log_index: 0,
        }
    }

    fn vote(poll_id: &str, option_index: u8, nullifier: &str, block: u64) -> ChainEvent {
        ChainEvent::VoteCast {
            poll_id: poll_id.to_string(),
            option_index,
            nullifier_hash: nullifier.to_string(),
            tx_hash: "0xb2".to_string(),
            block_number: block,
            log_index: 1,
        }
    }

    #[tokio::test]
    async fn duplicate_draft_is_a_conflict() {
        let store = InMemoryStore::default();
        let opts = options(2);
        store.insert_draft_poll(draft("0x01", "0xaa", &opts)).await.unwrap();
        let err = store
            .insert_draft_poll(draft("0x01", "0xaa", &opts))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
    }

    #[tokio::test]
    async fn activation_requires_a_roster() {
        let store = InMemoryStore::default();
        let opts = options(2);
        store.insert_draft_poll(draft("0x01", "0xaa", &opts)).await.unwrap();

        let outcomes = store
            .apply_tail_batch(&[activation("0x01", 5)], 5)
            .await
            .unwrap();
        assert_eq!(outcomes, vec![ApplyOutcome::ActivationMissingRoster]);
        let record = store.get_poll("0x01").await.unwrap();
        assert_eq!(record.status, PollStatus::Draft);

        store
            .set_roster("0x01", &["11".to_string(), "22".to_string()])
            .await
            .unwrap();
        let outcomes = store
            .apply_tail_batch(&[activation("0x01", 6)], 6)
            .await
            .unwrap();
        assert_eq!(outcomes, vec![ApplyOutcome::Activated]);
        let record = store.get_poll("0x01").await.unwrap();
        assert_eq!(record.status, PollStatus::Active);
        assert_eq!(record.group_id, "42");
        assert!(record.activation_tx_hash.is_some());
    }

    #[tokio::test]
    async fn repeated_activation_is_dropped() {
        let store = InMemoryStore::default();
        let opts = options(2);
        store.insert_draft_poll(draft("0x01", "0xaa", &opts)).await.unwrap();
        store.set_roster("0x01", &["11".to_string()]).await.unwrap();
        store
            .apply_tail_batch(&[activation("0x01", 6)], 6)
            .await
            .unwrap();
        let outcomes = store
            .apply_tail_batch(&[activation("0x01", 6)], 6)
            .await
            .unwrap();
        assert_eq!(outcomes, vec![ApplyOutcome::AlreadyActive]);
    }

    #[tokio::test]
    async fn nullifier_is_globally_unique() {
        let store = InMemoryStore::default();
        let opts = options(2);
        store.insert_draft_poll(draft("0x01", "0xaa", &opts)).await.unwrap();
        store.insert_draft_poll(draft("0x02", "0xaa", &opts)).await.unwrap();
        let outcomes = store
            .apply_tail_batch(
                &[
                    vote("0x01", 1, "0xdead", 7),
                    vote("0x01", 0, "0xdead", 12),
                    vote("0x02", 0, "0xdead", 13),
                ],
                13,
            )
            .await
            .unwrap();
        assert_eq!(
            outcomes,
            vec![
                ApplyOutcome::VoteRecorded,
                ApplyOutcome::VoteDuplicate,
                ApplyOutcome::VoteDuplicate,
            ]
        );
        assert_eq!(store.get_poll("0x01").await.unwrap().vote_count, 1);
        assert_eq!(store.get_poll("0x02").await.unwrap().vote_count, 0);
    }

    #[tokio::test]
    async fn votes_validate_option_and_poll() {
        let store = InMemoryStore::default();
        let opts = options(2);
        store.insert_draft_poll(draft("0x01", "0xaa", &opts)).await.unwrap();
        let outcomes = store
            .apply_tail_batch(
                &[vote("0x01", 2, "0x01f", 7), vote("0x99", 0, "0xfee", 8)],
                8,
            )
            .await
            .unwrap();
        assert_eq!(
            outcomes,
            vec![ApplyOutcome::VoteBadOption, ApplyOutcome::VoteUnknownPoll]
        );
        assert_eq!(store.get_poll("0x01").await.unwrap().vote_count, 0);
    }

    #[tokio::test]
    async fn roster_is_set_exactly_once() {
        let store = InMemoryStore::default();
        let opts = options(2);
        store.insert_draft_poll(draft("0x01", "0xaa", &opts)).await.unwrap();
        store.set_roster("0x01", &["11".to_string()]).await.unwrap();
        let err = store
            .set_roster("0x01", &["22".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
        assert_eq!(store.get_roster("0x01").await.unwrap(), vec!["11"]);
    }

    #[tokio::test]
    async fn unknown_poll_created_records_pending_binding() {
        let store = InMemoryStore::default();
        let outcomes = store
            .apply_tail_batch(
                &[ChainEvent::PollCreated {
                    poll_id: "0x77".to_string(),
                    creator: "0xcc".to_string(),
                    tx_hash: "0xc3".to_string(),
                    block_number: 3,
                    log_index: 0,
                }],
                3,
            )
            .await
            .unwrap();
        assert_eq!(outcomes, vec![ApplyOutcome::CreatorPending]);
        assert_eq!(
            store.creator_binding("0x77").await.as_deref(),
            Some("0xcc")
        );
    }

    #[tokio::test]
    async fn cursor_never_moves_backward() {
        let store = InMemoryStore::default();
        store.apply_tail_batch(&[], 100).await.unwrap();
        store.apply_tail_batch(&[], 40).await.unwrap();
        assert_eq!(store.load_cursor().await.unwrap(), 100);
    }

    #[tokio::test]
    async fn list_clamps_limit_and_filters_by_creator() {
        let store = InMemoryStore::default();
        let opts = options(2);
        for i in 0..3 {
            store
                .insert_draft_poll(draft(&format!("0x0{i}"), "0xaa", &opts))
                .await
                .unwrap();
        }
        store.insert_draft_poll(draft("0x10", "0xbb", &opts)).await.unwrap();
        let (rows, total) = store
            .list_polls(PollFilter {
                status: None,
                creator: Some("0xaa"),
                page: 1,
                limit: 500,
            })
            .await
            .unwrap();
        assert_eq!(total, 3);
        assert_eq!(rows.len(), 3);
    }
}
