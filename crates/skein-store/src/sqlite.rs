//! SQLite-backed store.
//!
//! One connection guarded by a mutex, WAL mode for concurrent readers,
//! schema created on open. All four DAO traits are implemented on the
//! same store so a server can share a single handle.

use std::path::Path;

use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{Connection, OpenFlags, Row, params};
use tracing::{debug, info};

use skein_protocol::AgentEvent;

use crate::dao::{EventDao, SandboxAllocationDao, SessionDao, UserConfigDao};
use crate::error::{Result, StoreError};
use crate::records::{AllocationStrategy, SandboxAllocationRecord, SessionRecord, UserConfigRecord};

/// Current schema version.
const SCHEMA_VERSION: i32 = 1;

/// Store backed by a single SQLite database.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore").finish_non_exhaustive()
    }
}

impl SqliteStore {
    /// Open or create a store at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|_| {
                    StoreError::Database(rusqlite::Error::InvalidPath(path.to_path_buf()))
                })?;
            }
        }

        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_FULL_MUTEX,
        )?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.initialize()?;

        info!("Store opened at {:?}", path);
        Ok(store)
    }

    /// Create an in-memory store (useful for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.initialize()?;

        debug!("In-memory store created");
        Ok(store)
    }

    /// Initialize pragmas and schema.
    fn initialize(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;

        let current_version: i32 = conn
            .pragma_query_value(None, "user_version", |row| row.get(0))
            .unwrap_or(0);

        if current_version >= SCHEMA_VERSION {
            debug!("Schema up to date (version {})", current_version);
            return Ok(());
        }

        conn.execute_batch(
            r#"
            -- Session rows; metadata is an open JSON object.
            CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                user_id TEXT,
                workspace TEXT NOT NULL,
                metadata TEXT NOT NULL DEFAULT '{}',
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_sessions_user
                ON sessions(user_id, updated_at DESC);

            -- Event log; the rowid is the insertion-order tiebreaker for
            -- events that share a millisecond.
            CREATE TABLE IF NOT EXISTS events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id TEXT NOT NULL,
                timestamp INTEGER NOT NULL,
                payload TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_events_session
                ON events(session_id, timestamp, id);

            -- Sandbox allocations; inactive rows are kept until the
            -- reconciler removes them.
            CREATE TABLE IF NOT EXISTS sandbox_allocations (
                sandbox_id TEXT PRIMARY KEY,
                sandbox_url TEXT NOT NULL,
                user_id TEXT,
                session_id TEXT,
                strategy TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                last_used_at INTEGER NOT NULL,
                is_active INTEGER NOT NULL DEFAULT 1
            );

            CREATE INDEX IF NOT EXISTS idx_allocations_session
                ON sandbox_allocations(session_id, is_active);
            CREATE INDEX IF NOT EXISTS idx_allocations_user
                ON sandbox_allocations(user_id, is_active);

            CREATE TABLE IF NOT EXISTS user_configs (
                user_id TEXT PRIMARY KEY,
                config TEXT NOT NULL
            );
            "#,
        )?;

        conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
        info!("Schema migrated to version {}", SCHEMA_VERSION);
        Ok(())
    }

    fn row_to_session(row: &Row<'_>) -> rusqlite::Result<(SessionRecord, String)> {
        Ok((
            SessionRecord {
                id: row.get(0)?,
                user_id: row.get(1)?,
                workspace: row.get(2)?,
                metadata: serde_json::Value::Null,
                created_at: row.get(4)?,
                updated_at: row.get(5)?,
            },
            row.get(3)?,
        ))
    }

    fn row_to_allocation(row: &Row<'_>) -> rusqlite::Result<(SandboxAllocationRecord, String)> {
        Ok((
            SandboxAllocationRecord {
                sandbox_id: row.get(0)?,
                sandbox_url: row.get(1)?,
                user_id: row.get(2)?,
                session_id: row.get(3)?,
                strategy: AllocationStrategy::SessionExclusive,
                created_at: row.get(5)?,
                last_used_at: row.get(6)?,
                is_active: row.get::<_, i64>(7)? != 0,
            },
            row.get(4)?,
        ))
    }

    fn finish_session((mut record, metadata): (SessionRecord, String)) -> Result<SessionRecord> {
        record.metadata = serde_json::from_str(&metadata)?;
        Ok(record)
    }

    fn finish_allocation(
        (mut record, strategy): (SandboxAllocationRecord, String),
    ) -> Result<SandboxAllocationRecord> {
        record.strategy = AllocationStrategy::parse(&strategy)
            .ok_or_else(|| StoreError::InvalidData(format!("unknown strategy: {strategy}")))?;
        Ok(record)
    }

    /// Map a constraint violation on insert to a conflict.
    fn insert_error(err: rusqlite::Error, what: String) -> StoreError {
        if let rusqlite::Error::SqliteFailure(e, _) = &err {
            if e.code == rusqlite::ErrorCode::ConstraintViolation {
                return StoreError::Conflict(what);
            }
        }
        StoreError::Database(err)
    }
}

const SESSION_COLUMNS: &str = "id, user_id, workspace, metadata, created_at, updated_at";
const ALLOCATION_COLUMNS: &str =
    "sandbox_id, sandbox_url, user_id, session_id, strategy, created_at, last_used_at, is_active";

#[async_trait]
impl SessionDao for SqliteStore {
    async fn create(&self, record: &SessionRecord) -> Result<()> {
        let conn = self.conn.lock();
        let metadata = serde_json::to_string(&record.metadata)?;

        conn.execute(
            r#"
            INSERT INTO sessions (id, user_id, workspace, metadata, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                record.id,
                record.user_id,
                record.workspace,
                metadata,
                record.created_at,
                record.updated_at,
            ],
        )
        .map_err(|e| Self::insert_error(e, format!("session {}", record.id)))?;

        debug!(session_id = %record.id, "session created");
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<SessionRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {SESSION_COLUMNS} FROM sessions WHERE id = ?1"
        ))?;
        let mut rows = stmt.query(params![id])?;

        match rows.next()? {
            Some(row) => Ok(Some(Self::finish_session(Self::row_to_session(row)?)?)),
            None => Ok(None),
        }
    }

    async fn update_metadata(&self, id: &str, metadata: &serde_json::Value) -> Result<()> {
        let conn = self.conn.lock();
        let metadata = serde_json::to_string(metadata)?;

        let affected = conn.execute(
            "UPDATE sessions SET metadata = ?2, updated_at = ?3 WHERE id = ?1",
            params![id, metadata, skein_protocol::now_millis()],
        )?;
        if affected == 0 {
            return Err(StoreError::NotFound(format!("session {id}")));
        }
        Ok(())
    }

    async fn touch(&self, id: &str) -> Result<()> {
        let conn = self.conn.lock();
        let affected = conn.execute(
            "UPDATE sessions SET updated_at = ?2 WHERE id = ?1",
            params![id, skein_protocol::now_millis()],
        )?;
        if affected == 0 {
            return Err(StoreError::NotFound(format!("session {id}")));
        }
        Ok(())
    }

    async fn list_for_user(&self, user_id: &str) -> Result<Vec<SessionRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {SESSION_COLUMNS} FROM sessions WHERE user_id = ?1 ORDER BY updated_at DESC"
        ))?;
        let mut rows = stmt.query(params![user_id])?;

        let mut sessions = Vec::new();
        while let Some(row) = rows.next()? {
            sessions.push(Self::finish_session(Self::row_to_session(row)?)?);
        }
        Ok(sessions)
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM events WHERE session_id = ?1", params![id])?;
        tx.execute("DELETE FROM sessions WHERE id = ?1", params![id])?;
        tx.commit()?;

        debug!(session_id = %id, "session deleted");
        Ok(())
    }
}

#[async_trait]
impl EventDao for SqliteStore {
    async fn append(&self, session_id: &str, event: &AgentEvent) -> Result<()> {
        let conn = self.conn.lock();
        let payload = serde_json::to_string(event)?;

        conn.execute(
            "INSERT INTO events (session_id, timestamp, payload) VALUES (?1, ?2, ?3)",
            params![session_id, event.timestamp(), payload],
        )?;
        Ok(())
    }

    async fn list(&self, session_id: &str) -> Result<Vec<AgentEvent>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT payload FROM events WHERE session_id = ?1 ORDER BY timestamp, id",
        )?;
        let mut rows = stmt.query(params![session_id])?;

        let mut events = Vec::new();
        while let Some(row) = rows.next()? {
            let payload: String = row.get(0)?;
            events.push(serde_json::from_str(&payload)?);
        }
        Ok(events)
    }

    async fn delete_for_session(&self, session_id: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "DELETE FROM events WHERE session_id = ?1",
            params![session_id],
        )?;
        Ok(())
    }
}

#[async_trait]
impl SandboxAllocationDao for SqliteStore {
    async fn insert(&self, record: &SandboxAllocationRecord) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            &format!(
                "INSERT INTO sandbox_allocations ({ALLOCATION_COLUMNS}) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"
            ),
            params![
                record.sandbox_id,
                record.sandbox_url,
                record.user_id,
                record.session_id,
                record.strategy.as_str(),
                record.created_at,
                record.last_used_at,
                record.is_active as i64,
            ],
        )
        .map_err(|e| Self::insert_error(e, format!("sandbox {}", record.sandbox_id)))?;

        debug!(sandbox_id = %record.sandbox_id, strategy = %record.strategy, "allocation inserted");
        Ok(())
    }

    async fn find_active_for_session(
        &self,
        session_id: &str,
    ) -> Result<Option<SandboxAllocationRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {ALLOCATION_COLUMNS} FROM sandbox_allocations \
             WHERE session_id = ?1 AND is_active = 1 \
             ORDER BY last_used_at DESC LIMIT 1"
        ))?;
        let mut rows = stmt.query(params![session_id])?;

        match rows.next()? {
            Some(row) => Ok(Some(Self::finish_allocation(Self::row_to_allocation(row)?)?)),
            None => Ok(None),
        }
    }

    async fn find_active_for_user(
        &self,
        user_id: &str,
    ) -> Result<Option<SandboxAllocationRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {ALLOCATION_COLUMNS} FROM sandbox_allocations \
             WHERE user_id = ?1 AND strategy = ?2 AND is_active = 1 \
             ORDER BY last_used_at DESC LIMIT 1"
        ))?;
        let mut rows = stmt.query(params![user_id, AllocationStrategy::UserExclusive.as_str()])?;

        match rows.next()? {
            Some(row) => Ok(Some(Self::finish_allocation(Self::row_to_allocation(row)?)?)),
            None => Ok(None),
        }
    }

    async fn find_active_shared(&self, user_id: &str) -> Result<Vec<SandboxAllocationRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {ALLOCATION_COLUMNS} FROM sandbox_allocations \
             WHERE strategy = ?1 AND is_active = 1 \
             AND (user_id IS NULL OR user_id = ?2) \
             ORDER BY last_used_at DESC"
        ))?;
        let mut rows = stmt.query(params![AllocationStrategy::SharedPool.as_str(), user_id])?;

        let mut allocations = Vec::new();
        while let Some(row) = rows.next()? {
            allocations.push(Self::finish_allocation(Self::row_to_allocation(row)?)?);
        }
        Ok(allocations)
    }

    async fn touch_last_used(&self, sandbox_id: &str) -> Result<()> {
        let conn = self.conn.lock();
        let affected = conn.execute(
            "UPDATE sandbox_allocations SET last_used_at = ?2 WHERE sandbox_id = ?1",
            params![sandbox_id, skein_protocol::now_millis()],
        )?;
        if affected == 0 {
            return Err(StoreError::NotFound(format!("sandbox {sandbox_id}")));
        }
        Ok(())
    }

    async fn deactivate(&self, sandbox_id: &str) -> Result<()> {
        let conn = self.conn.lock();
        let affected = conn.execute(
            "UPDATE sandbox_allocations SET is_active = 0 WHERE sandbox_id = ?1",
            params![sandbox_id],
        )?;
        if affected == 0 {
            return Err(StoreError::NotFound(format!("sandbox {sandbox_id}")));
        }
        debug!(sandbox_id = %sandbox_id, "allocation deactivated");
        Ok(())
    }

    async fn list_inactive(&self) -> Result<Vec<SandboxAllocationRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {ALLOCATION_COLUMNS} FROM sandbox_allocations \
             WHERE is_active = 0 ORDER BY last_used_at ASC"
        ))?;
        let mut rows = stmt.query([])?;

        let mut allocations = Vec::new();
        while let Some(row) = rows.next()? {
            allocations.push(Self::finish_allocation(Self::row_to_allocation(row)?)?);
        }
        Ok(allocations)
    }

    async fn remove(&self, sandbox_id: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "DELETE FROM sandbox_allocations WHERE sandbox_id = ?1",
            params![sandbox_id],
        )?;
        Ok(())
    }
}

#[async_trait]
impl UserConfigDao for SqliteStore {
    async fn get_config(&self, user_id: &str) -> Result<Option<UserConfigRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT config FROM user_configs WHERE user_id = ?1")?;
        let mut rows = stmt.query(params![user_id])?;

        match rows.next()? {
            Some(row) => {
                let config: String = row.get(0)?;
                Ok(Some(serde_json::from_str(&config)?))
            }
            None => Ok(None),
        }
    }

    async fn put_config(&self, record: &UserConfigRecord) -> Result<()> {
        let conn = self.conn.lock();
        let config = serde_json::to_string(record)?;
        conn.execute(
            "INSERT INTO user_configs (user_id, config) VALUES (?1, ?2) \
             ON CONFLICT(user_id) DO UPDATE SET config = excluded.config",
            params![record.user_id, config],
        )?;
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> SqliteStore {
        SqliteStore::open_in_memory().unwrap()
    }

    #[tokio::test]
    async fn test_session_create_get() {
        let store = store();
        let record = SessionRecord::new("s1", "/workspaces/s1")
            .with_user("u1")
            .with_metadata(serde_json::json!({"agent": "default", "model": "m1"}));
        store.create(&record).await.unwrap();

        let loaded = store.get("s1").await.unwrap().unwrap();
        assert_eq!(loaded.workspace, "/workspaces/s1");
        assert_eq!(loaded.user_id.as_deref(), Some("u1"));
        assert_eq!(loaded.metadata["model"], "m1");
    }

    #[tokio::test]
    async fn test_duplicate_session_is_conflict() {
        let store = store();
        let record = SessionRecord::new("s1", "/w");
        store.create(&record).await.unwrap();

        let err = store.create(&record).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn test_update_metadata_and_touch() {
        let store = store();
        store.create(&SessionRecord::new("s1", "/w")).await.unwrap();

        store
            .update_metadata("s1", &serde_json::json!({"sandbox_url": "http://sb:8080"}))
            .await
            .unwrap();
        let loaded = store.get("s1").await.unwrap().unwrap();
        assert_eq!(loaded.metadata["sandbox_url"], "http://sb:8080");

        let err = store.touch("missing").await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_list_for_user_ordered() {
        let store = store();
        let mut a = SessionRecord::new("a", "/w").with_user("u1");
        a.updated_at = 100;
        let mut b = SessionRecord::new("b", "/w").with_user("u1");
        b.updated_at = 200;
        let other = SessionRecord::new("c", "/w").with_user("u2");
        store.create(&a).await.unwrap();
        store.create(&b).await.unwrap();
        store.create(&other).await.unwrap();

        let listed = store.list_for_user("u1").await.unwrap();
        let ids: Vec<_> = listed.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a"]);
    }

    #[tokio::test]
    async fn test_events_preserve_emission_order() {
        let store = store();
        store.create(&SessionRecord::new("s1", "/w")).await.unwrap();

        // Same millisecond; the rowid tiebreaker keeps insertion order.
        for i in 0..5 {
            let event = AgentEvent::UserMessage {
                timestamp: 1_000,
                content: format!("message {i}"),
            };
            store.append("s1", &event).await.unwrap();
        }

        let events = store.list("s1").await.unwrap();
        assert_eq!(events.len(), 5);
        for (i, event) in events.iter().enumerate() {
            let AgentEvent::UserMessage { content, .. } = event else {
                panic!("unexpected event {event:?}");
            };
            assert_eq!(content, &format!("message {i}"));
        }
    }

    #[tokio::test]
    async fn test_delete_session_removes_events() {
        let store = store();
        store.create(&SessionRecord::new("s1", "/w")).await.unwrap();
        store.append("s1", &AgentEvent::user("hi")).await.unwrap();

        SessionDao::delete(&store, "s1").await.unwrap();
        assert!(store.get("s1").await.unwrap().is_none());
        assert!(store.list("s1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_allocation_lookups_by_strategy() {
        let store = store();
        let session_bound =
            SandboxAllocationRecord::new("sb-1", "http://sb1", AllocationStrategy::SessionExclusive)
                .with_user("u1")
                .with_session("s1");
        let user_bound =
            SandboxAllocationRecord::new("sb-2", "http://sb2", AllocationStrategy::UserExclusive)
                .with_user("u1");
        let shared =
            SandboxAllocationRecord::new("sb-3", "http://sb3", AllocationStrategy::SharedPool);
        let foreign_shared =
            SandboxAllocationRecord::new("sb-4", "http://sb4", AllocationStrategy::SharedPool)
                .with_user("u2");
        store.insert(&session_bound).await.unwrap();
        store.insert(&user_bound).await.unwrap();
        store.insert(&shared).await.unwrap();
        store.insert(&foreign_shared).await.unwrap();

        let found = store.find_active_for_session("s1").await.unwrap().unwrap();
        assert_eq!(found.sandbox_id, "sb-1");

        // User-exclusive lookup must not return the session-bound row.
        let found = store.find_active_for_user("u1").await.unwrap().unwrap();
        assert_eq!(found.sandbox_id, "sb-2");

        // Shared lookup sees unbound rows but not another user's.
        let shared = store.find_active_shared("u1").await.unwrap();
        let ids: Vec<_> = shared.iter().map(|a| a.sandbox_id.as_str()).collect();
        assert_eq!(ids, vec!["sb-3"]);
    }

    #[tokio::test]
    async fn test_deactivate_and_reconcile_listing() {
        let store = store();
        let record =
            SandboxAllocationRecord::new("sb-1", "http://sb1", AllocationStrategy::SharedPool);
        store.insert(&record).await.unwrap();

        store.deactivate("sb-1").await.unwrap();
        assert!(store.find_active_shared("u1").await.unwrap().is_empty());

        let inactive = store.list_inactive().await.unwrap();
        assert_eq!(inactive.len(), 1);
        assert!(!inactive[0].is_active);

        store.remove("sb-1").await.unwrap();
        assert!(store.list_inactive().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_allocation_is_conflict() {
        let store = store();
        let record =
            SandboxAllocationRecord::new("sb-1", "http://sb1", AllocationStrategy::SharedPool);
        store.insert(&record).await.unwrap();
        let err = store.insert(&record).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_user_config_round_trip() {
        let store = store();
        assert!(store.get_config("u1").await.unwrap().is_none());
        assert_eq!(
            store.allocation_strategy("u1").await.unwrap(),
            AllocationStrategy::SessionExclusive
        );

        let mut config = UserConfigRecord::defaults("u1");
        config.strategy = AllocationStrategy::SharedPool;
        config.sandbox_quota = 5;
        config
            .model_providers
            .push(serde_json::json!({"endpoint": "http://llm:8000", "models": ["m1"]}));
        store.put_config(&config).await.unwrap();

        let loaded = store.get_config("u1").await.unwrap().unwrap();
        assert_eq!(loaded.strategy, AllocationStrategy::SharedPool);
        assert_eq!(loaded.sandbox_quota, 5);
        assert_eq!(loaded.model_providers.len(), 1);
        assert_eq!(
            store.allocation_strategy("u1").await.unwrap(),
            AllocationStrategy::SharedPool
        );
    }

    #[tokio::test]
    async fn test_open_creates_file_and_reopens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("skein.db");

        {
            let store = SqliteStore::open(&path).unwrap();
            store.create(&SessionRecord::new("s1", "/w")).await.unwrap();
        }

        let store = SqliteStore::open(&path).unwrap();
        assert!(store.get("s1").await.unwrap().is_some());
    }
}
