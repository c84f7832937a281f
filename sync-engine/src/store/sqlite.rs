//! SQLite record store.
//!
//! Each record is stored as a JSON document next to the columns that
//! queries filter and sort on. The document is the source of truth; the
//! columns are rewritten from it on every upsert.

use super::{
    ConflictCounts, ConflictListing, ConflictQuery, LogCounts, LogFilter, Page, Paged,
    RecordStore, StatusCounts,
};
use crate::error::{StoreError, StoreResult};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::QueryBuilder;
use std::path::Path;
use std::str::FromStr;
use sync_types::{
    Conflict, ConflictId, ConflictPriority, Entity, EntityId, EntityType, LogId, LogStatus,
    RemoteId, SyncLog, SyncStatus, Timestamp,
};

/// SQLite-based record store.
///
/// Uses WAL mode for concurrent reads/writes.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (or create) a database file.
    pub async fn new(path: &Path) -> StoreResult<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .busy_timeout(std::time::Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(10)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    /// Create an in-memory database (for testing).
    ///
    /// A single connection is kept open for the life of the pool, since the
    /// database disappears with its last connection.
    pub async fn in_memory() -> StoreResult<Self> {
        let options = SqliteConnectOptions::from_str(":memory:")?;

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    async fn run_migrations(&self) -> StoreResult<()> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS entities (
                id TEXT PRIMARY KEY,
                entity_type TEXT NOT NULL,
                remote_id TEXT,
                sync_status TEXT NOT NULL,
                is_deleted INTEGER NOT NULL,
                last_modified_local INTEGER NOT NULL,
                body TEXT NOT NULL
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_entities_remote ON entities(entity_type, remote_id)",
            "CREATE INDEX IF NOT EXISTS idx_entities_status ON entities(sync_status, is_deleted)",
            r#"
            CREATE TABLE IF NOT EXISTS sync_logs (
                id TEXT PRIMARY KEY,
                entity_type TEXT NOT NULL,
                entity_id TEXT,
                direction TEXT NOT NULL,
                status TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                completed_at INTEGER,
                body TEXT NOT NULL
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_sync_logs_created ON sync_logs(created_at)",
            "CREATE INDEX IF NOT EXISTS idx_sync_logs_status ON sync_logs(status, completed_at)",
            r#"
            CREATE TABLE IF NOT EXISTS conflicts (
                id TEXT PRIMARY KEY,
                entity_type TEXT NOT NULL,
                entity_id TEXT NOT NULL,
                resolution_type TEXT NOT NULL,
                priority INTEGER NOT NULL,
                detected_at INTEGER NOT NULL,
                resolved_at INTEGER,
                body TEXT NOT NULL
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_conflicts_entity ON conflicts(entity_id, resolution_type)",
            "CREATE INDEX IF NOT EXISTS idx_conflicts_listing ON conflicts(resolution_type, priority, detected_at)",
        ];

        for statement in statements {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| StoreError::Migration(e.to_string()))?;
        }
        Ok(())
    }

    async fn fetch_doc<T: DeserializeOwned>(
        &self,
        sql: &str,
        id: String,
    ) -> StoreResult<Option<T>> {
        let body: Option<String> = sqlx::query_scalar(sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        body.map(|b| decode(&b)).transpose()
    }
}

fn decode<T: DeserializeOwned>(body: &str) -> StoreResult<T> {
    Ok(serde_json::from_str(body)?)
}

fn decode_all<T: DeserializeOwned>(bodies: Vec<String>) -> StoreResult<Vec<T>> {
    bodies.iter().map(|b| decode(b)).collect()
}

fn priority_rank(priority: ConflictPriority) -> i64 {
    match priority {
        ConflictPriority::Low => 0,
        ConflictPriority::Medium => 1,
        ConflictPriority::High => 2,
    }
}

fn to_u64(n: i64) -> u64 {
    u64::try_from(n).unwrap_or(0)
}

/// Internal row type for grouped counts.
#[derive(sqlx::FromRow)]
struct CountRow {
    label: String,
    count: i64,
}

#[async_trait]
impl RecordStore for SqliteStore {
    async fn put_entity(&self, entity: &Entity) -> StoreResult<()> {
        let body = serde_json::to_string(entity)?;
        sqlx::query(
            r#"
            INSERT INTO entities (id, entity_type, remote_id, sync_status, is_deleted, last_modified_local, body)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(id) DO UPDATE SET
                remote_id = excluded.remote_id,
                sync_status = excluded.sync_status,
                is_deleted = excluded.is_deleted,
                last_modified_local = excluded.last_modified_local,
                body = excluded.body
            "#,
        )
        .bind(entity.id.to_string())
        .bind(entity.entity_type().as_str())
        .bind(entity.remote_id.as_ref().map(|r| r.as_str().to_string()))
        .bind(entity.envelope.sync_status.as_str())
        .bind(entity.is_deleted)
        .bind(entity.envelope.last_modified_local)
        .bind(body)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_entity(&self, id: EntityId) -> StoreResult<Option<Entity>> {
        self.fetch_doc("SELECT body FROM entities WHERE id = ?1", id.to_string())
            .await
    }

    async fn find_by_remote_id(
        &self,
        entity_type: EntityType,
        remote_id: &RemoteId,
    ) -> StoreResult<Option<Entity>> {
        let body: Option<String> = sqlx::query_scalar(
            "SELECT body FROM entities WHERE entity_type = ?1 AND remote_id = ?2 LIMIT 1",
        )
        .bind(entity_type.as_str())
        .bind(remote_id.as_str())
        .fetch_optional(&self.pool)
        .await?;
        body.map(|b| decode(&b)).transpose()
    }

    async fn pending_entities(
        &self,
        entity_type: Option<EntityType>,
        limit: usize,
    ) -> StoreResult<Vec<Entity>> {
        let mut query = QueryBuilder::<sqlx::Sqlite>::new(
            "SELECT body FROM entities WHERE is_deleted = 0 AND sync_status IN ('pending', 'error')",
        );
        if let Some(t) = entity_type {
            query.push(" AND entity_type = ").push_bind(t.as_str());
        }
        query
            .push(" ORDER BY last_modified_local ASC LIMIT ")
            .push_bind(i64::try_from(limit).unwrap_or(i64::MAX));

        let bodies: Vec<String> = query.build_query_scalar::<String>().fetch_all(&self.pool).await?;
        decode_all(bodies)
    }

    async fn count_entities(&self, entity_type: EntityType) -> StoreResult<StatusCounts> {
        let rows = sqlx::query_as::<_, CountRow>(
            r#"
            SELECT sync_status AS label, COUNT(*) AS count
            FROM entities
            WHERE entity_type = ?1 AND is_deleted = 0
            GROUP BY sync_status
            "#,
        )
        .bind(entity_type.as_str())
        .fetch_all(&self.pool)
        .await?;

        let mut counts = StatusCounts::default();
        for row in rows {
            if let Some(status) = SyncStatus::ALL.into_iter().find(|s| s.as_str() == row.label) {
                counts.add(status, to_u64(row.count));
            }
        }
        Ok(counts)
    }

    async fn put_log(&self, log: &SyncLog) -> StoreResult<()> {
        let body = serde_json::to_string(log)?;
        sqlx::query(
            r#"
            INSERT INTO sync_logs (id, entity_type, entity_id, direction, status, created_at, completed_at, body)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT(id) DO UPDATE SET
                entity_id = excluded.entity_id,
                status = excluded.status,
                completed_at = excluded.completed_at,
                body = excluded.body
            "#,
        )
        .bind(log.id.to_string())
        .bind(log.entity_type.as_str())
        .bind(log.entity_id.map(|id| id.to_string()))
        .bind(log.direction.as_str())
        .bind(log.status.as_str())
        .bind(log.created_at)
        .bind(log.completed_at)
        .bind(body)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_log(&self, id: LogId) -> StoreResult<Option<SyncLog>> {
        self.fetch_doc("SELECT body FROM sync_logs WHERE id = ?1", id.to_string())
            .await
    }

    async fn list_logs(&self, filter: &LogFilter, page: Page) -> StoreResult<Paged<SyncLog>> {
        fn push_filter(query: &mut QueryBuilder<'_, sqlx::Sqlite>, filter: &LogFilter) {
            query.push(" WHERE 1 = 1");
            if let Some(t) = filter.entity_type {
                query.push(" AND entity_type = ").push_bind(t.as_str());
            }
            if let Some(s) = filter.status {
                query.push(" AND status = ").push_bind(s.as_str());
            }
            if let Some(d) = filter.direction {
                query.push(" AND direction = ").push_bind(d.as_str());
            }
        }

        let mut count = QueryBuilder::<sqlx::Sqlite>::new("SELECT COUNT(*) FROM sync_logs");
        push_filter(&mut count, filter);
        let total: i64 = count.build_query_scalar::<i64>().fetch_one(&self.pool).await?;

        let mut query = QueryBuilder::<sqlx::Sqlite>::new("SELECT body FROM sync_logs");
        push_filter(&mut query, filter);
        query
            .push(" ORDER BY created_at DESC LIMIT ")
            .push_bind(i64::from(page.limit))
            .push(" OFFSET ")
            .push_bind(page.offset() as i64);
        let bodies: Vec<String> = query.build_query_scalar::<String>().fetch_all(&self.pool).await?;

        Ok(Paged::new(decode_all(bodies)?, page, to_u64(total)))
    }

    async fn count_logs_since(&self, since: Timestamp) -> StoreResult<LogCounts> {
        let rows = sqlx::query_as::<_, CountRow>(
            r#"
            SELECT status AS label, COUNT(*) AS count
            FROM sync_logs
            WHERE created_at >= ?1
            GROUP BY status
            "#,
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        let mut counts = LogCounts::default();
        for row in rows {
            if let Some(status) = LogStatus::ALL.into_iter().find(|s| s.as_str() == row.label) {
                counts.add(status, to_u64(row.count));
            }
        }
        Ok(counts)
    }

    async fn purge_logs(&self, status: LogStatus, before: Timestamp) -> StoreResult<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM sync_logs
            WHERE status = ?1 AND COALESCE(completed_at, created_at) < ?2
            "#,
        )
        .bind(status.as_str())
        .bind(before)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn put_conflict(&self, conflict: &Conflict) -> StoreResult<()> {
        let body = serde_json::to_string(conflict)?;
        sqlx::query(
            r#"
            INSERT INTO conflicts (id, entity_type, entity_id, resolution_type, priority, detected_at, resolved_at, body)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT(id) DO UPDATE SET
                resolution_type = excluded.resolution_type,
                priority = excluded.priority,
                resolved_at = excluded.resolved_at,
                body = excluded.body
            "#,
        )
        .bind(conflict.id.to_string())
        .bind(conflict.entity_type.as_str())
        .bind(conflict.entity_id.to_string())
        .bind(conflict.resolution_type.as_str())
        .bind(priority_rank(conflict.priority))
        .bind(conflict.detected_at)
        .bind(conflict.resolved_at)
        .bind(body)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_conflict(&self, id: ConflictId) -> StoreResult<Option<Conflict>> {
        self.fetch_doc("SELECT body FROM conflicts WHERE id = ?1", id.to_string())
            .await
    }

    async fn pending_conflict_for(&self, entity_id: EntityId) -> StoreResult<Option<Conflict>> {
        self.fetch_doc(
            "SELECT body FROM conflicts WHERE entity_id = ?1 AND resolution_type = 'pending' LIMIT 1",
            entity_id.to_string(),
        )
        .await
    }

    async fn list_conflicts(
        &self,
        query: &ConflictQuery,
        page: Page,
    ) -> StoreResult<Paged<Conflict>> {
        fn push_filter(builder: &mut QueryBuilder<'_, sqlx::Sqlite>, query: &ConflictQuery) {
            match query.listing {
                ConflictListing::Unresolved => builder.push(" WHERE resolution_type = 'pending'"),
                ConflictListing::History => builder.push(" WHERE resolution_type != 'pending'"),
            };
            if let Some(t) = query.entity_type {
                builder.push(" AND entity_type = ").push_bind(t.as_str());
            }
        }

        let mut count = QueryBuilder::<sqlx::Sqlite>::new("SELECT COUNT(*) FROM conflicts");
        push_filter(&mut count, query);
        let total: i64 = count.build_query_scalar::<i64>().fetch_one(&self.pool).await?;

        let mut select = QueryBuilder::<sqlx::Sqlite>::new("SELECT body FROM conflicts");
        push_filter(&mut select, query);
        select.push(match query.listing {
            ConflictListing::Unresolved => " ORDER BY priority DESC, detected_at DESC",
            ConflictListing::History => " ORDER BY resolved_at DESC",
        });
        select
            .push(" LIMIT ")
            .push_bind(i64::from(page.limit))
            .push(" OFFSET ")
            .push_bind(page.offset() as i64);
        let bodies: Vec<String> = select.build_query_scalar::<String>().fetch_all(&self.pool).await?;

        Ok(Paged::new(decode_all(bodies)?, page, to_u64(total)))
    }

    async fn conflict_counts(&self) -> StoreResult<ConflictCounts> {
        let resolved: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM conflicts WHERE resolution_type != 'pending'",
        )
        .fetch_one(&self.pool)
        .await?;

        let rows = sqlx::query_as::<_, CountRow>(
            r#"
            SELECT entity_type AS label, COUNT(*) AS count
            FROM conflicts
            WHERE resolution_type = 'pending'
            GROUP BY entity_type
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut counts = ConflictCounts {
            resolved: to_u64(resolved),
            ..ConflictCounts::default()
        };
        for row in rows {
            let n = to_u64(row.count);
            counts.pending += n;
            if let Ok(entity_type) = row.label.parse::<EntityType>() {
                counts.pending_by_type.insert(entity_type, n);
            }
        }
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sync_types::{
        Contact, Direction, EntityData, FieldChoice, RemoteRecord, SyncAction, SYSTEM_ACTOR,
    };

    fn contact(email: &str, at: Timestamp) -> Entity {
        Entity::new_local(EntityData::Contact(Contact::new(email)), at)
    }

    fn open_conflict(entity: &Entity, fields: usize, at: Timestamp) -> Conflict {
        let remote = RemoteRecord {
            remote_id: RemoteId::new("9"),
            data: entity.data.clone(),
            last_modified: at,
        };
        let detection = sync_core::Detection {
            conflicting_fields: (0..fields).map(|i| format!("f{}", i)).collect(),
            local_timestamp: at,
            remote_timestamp: at,
        };
        sync_core::open_conflict(entity, &remote, &detection, at)
    }

    #[tokio::test]
    async fn entity_upsert_replaces_document() {
        let store = SqliteStore::in_memory().await.unwrap();
        let mut e = contact("a@x", 1);
        store.put_entity(&e).await.unwrap();

        e.remote_id = Some(RemoteId::new("1001"));
        e.set_sync_status(SyncStatus::Synced);
        store.put_entity(&e).await.unwrap();

        assert_eq!(store.get_entity(e.id).await.unwrap(), Some(e.clone()));
        let found = store
            .find_by_remote_id(EntityType::Contact, &RemoteId::new("1001"))
            .await
            .unwrap();
        assert_eq!(found.map(|f| f.id), Some(e.id));
        assert!(store.get_entity(EntityId::new()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn pending_entities_and_counts() {
        let store = SqliteStore::in_memory().await.unwrap();
        let a = contact("a@x", 20);
        let b = contact("b@x", 10);
        let mut c = contact("c@x", 5);
        c.set_sync_status(SyncStatus::Synced);
        let mut d = contact("d@x", 1);
        d.mark_deleted(2);
        for e in [&a, &b, &c, &d] {
            store.put_entity(e).await.unwrap();
        }

        let pending = store.pending_entities(None, 10).await.unwrap();
        assert_eq!(pending.iter().map(|e| e.id).collect::<Vec<_>>(), vec![b.id, a.id]);
        assert!(store
            .pending_entities(Some(EntityType::Company), 10)
            .await
            .unwrap()
            .is_empty());

        let counts = store.count_entities(EntityType::Contact).await.unwrap();
        assert_eq!(counts.pending, 2);
        assert_eq!(counts.synced, 1);
        assert_eq!(counts.total(), 3);
    }

    #[tokio::test]
    async fn logs_filter_page_and_purge() {
        let store = SqliteStore::in_memory().await.unwrap();
        let mut ids = Vec::new();
        for at in 0..5 {
            let mut log =
                SyncLog::open(EntityType::Contact, Direction::ToRemote, SyncAction::Update, at * 10);
            log.succeed(None, at * 10 + 1).unwrap();
            store.put_log(&log).await.unwrap();
            ids.push(log.id);
        }
        let mut failed =
            SyncLog::open(EntityType::Contact, Direction::FromRemote, SyncAction::Create, 100);
        failed.fail("Conflict detected", None, 101).unwrap();
        store.put_log(&failed).await.unwrap();

        let all = store.list_logs(&LogFilter::default(), Page::new(1, 4)).await.unwrap();
        assert_eq!(all.total, 6);
        assert_eq!(all.pages, 2);
        assert_eq!(all.items[0].id, failed.id);

        let inbound = LogFilter {
            direction: Some(Direction::FromRemote),
            ..LogFilter::default()
        };
        let page = store.list_logs(&inbound, Page::default()).await.unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.items[0].error_message.as_deref(), Some("Conflict detected"));

        let counts = store.count_logs_since(20).await.unwrap();
        assert_eq!(counts.success, 3);
        assert_eq!(counts.failed, 1);

        assert_eq!(store.purge_logs(LogStatus::Success, 25).await.unwrap(), 3);
        assert!(store.get_log(ids[0]).await.unwrap().is_none());
        assert!(store.get_log(ids[4]).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn conflict_listing_and_counts() {
        let store = SqliteStore::in_memory().await.unwrap();
        let a = contact("a@x", 1);
        let b = contact("b@x", 1);
        let medium = open_conflict(&a, 1, 500);
        let high = open_conflict(&b, 3, 100);
        store.put_conflict(&medium).await.unwrap();
        store.put_conflict(&high).await.unwrap();

        let unresolved = ConflictQuery {
            listing: ConflictListing::Unresolved,
            entity_type: None,
        };
        let listed = store.list_conflicts(&unresolved, Page::default()).await.unwrap();
        assert_eq!(
            listed.items.iter().map(|c| c.id).collect::<Vec<_>>(),
            vec![high.id, medium.id]
        );

        let mut resolved = medium.clone();
        sync_core::resolve(
            &mut resolved,
            &sync_core::Resolution::Auto(FieldChoice::Local),
            SYSTEM_ACTOR,
            600,
        )
        .unwrap();
        store.put_conflict(&resolved).await.unwrap();

        assert!(store.pending_conflict_for(a.id).await.unwrap().is_none());
        assert_eq!(store.get_conflict(medium.id).await.unwrap(), Some(resolved));

        let history = ConflictQuery {
            listing: ConflictListing::History,
            entity_type: Some(EntityType::Contact),
        };
        assert_eq!(store.list_conflicts(&history, Page::default()).await.unwrap().total, 1);

        let counts = store.conflict_counts().await.unwrap();
        assert_eq!(counts.pending, 1);
        assert_eq!(counts.resolved, 1);
        assert_eq!(counts.pending_by_type.get(&EntityType::Contact), Some(&1));
    }

    #[tokio::test]
    async fn file_database_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("crm-sync.db");
        let e = contact("a@x", 1);
        {
            let store = SqliteStore::new(&path).await.unwrap();
            store.put_entity(&e).await.unwrap();
        }
        let store = SqliteStore::new(&path).await.unwrap();
        assert_eq!(store.get_entity(e.id).await.unwrap(), Some(e));
    }
}
