// SPDX-License-Identifier: MIT OR Apache-2.0

//! SQLite store backed by a `sqlx` connection pool.
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use perm_core::{
    Entity, EntityKind, EntityRef, Entry, Expired, Membership, Model, QualifiedPermission,
    Timestamp,
};
use sqlx::migrate::{MigrateDatabase, Migrator};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{FromRow, Sqlite, SqliteConnection, migrate, query, query_as, query_scalar};
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use crate::error::StoreError;
use crate::traits::{EntryStore, StoreTransaction};

/// Embedded schema of the `entities`, `memberships` and `entries` tables.
static MIGRATOR: Migrator = migrate!();

/// Returns true for URLs of in-memory databases, which exist once per connection.
fn is_memory_url(url: &str) -> bool {
    url.contains(":memory:") || url.contains("mode=memory")
}

/// Opens a [`SqliteStore`], creating and migrating the database file when needed.
///
/// ```rust,no_run
/// # use perm_store::sqlite::SqliteStoreBuilder;
/// # async fn run() -> Result<(), perm_store::sqlite::SqliteError> {
/// let store = SqliteStoreBuilder::new()
///     .database_url("sqlite://permissions.sqlite")
///     .max_connections(4)
///     .build()
///     .await?;
/// # Ok(())
/// # }
/// ```
pub struct SqliteStoreBuilder {
    url: String,
    max_connections: u32,
    run_migrations: bool,
    create_database: bool,
}

impl Default for SqliteStoreBuilder {
    fn default() -> Self {
        Self {
            url: "sqlite::memory:".into(),
            max_connections: 1,
            create_database: true,
            run_migrations: true,
        }
    }
}

impl SqliteStoreBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Private in-memory database under a random name, so parallel tests never share state.
    #[cfg(any(test, feature = "test_utils"))]
    pub fn random_memory_url(mut self) -> Self {
        self.url = format!(
            "sqlite://perms{}?mode=memory&cache=private",
            rand::random::<u32>()
        );
        self
    }

    pub fn database_url(mut self, url: &str) -> Self {
        self.url = url.to_string();
        self
    }

    /// Upper bound of pooled connections. In-memory databases always use exactly one, every
    /// further connection would open a separate, empty database.
    pub fn max_connections(mut self, max_connections: u32) -> Self {
        self.max_connections = max_connections;
        self
    }

    /// Create the database file if it is missing, enabled by default.
    pub fn create_database(mut self, create_database: bool) -> Self {
        self.create_database = create_database;
        self
    }

    /// Bring the permission tables up to date after connecting, enabled by default.
    pub fn run_default_migrations(mut self, run_migrations: bool) -> Self {
        self.run_migrations = run_migrations;
        self
    }

    fn connection_limit(&self) -> u32 {
        if is_memory_url(&self.url) {
            1
        } else {
            self.max_connections.max(1)
        }
    }

    pub async fn build(self) -> Result<SqliteStore, SqliteError> {
        if self.create_database && !Sqlite::database_exists(&self.url).await? {
            Sqlite::create_database(&self.url).await?;
        }

        // Connections are kept open for the lifetime of the pool, closing the only connection of
        // an in-memory database would drop all permissions stored in it.
        let pool: sqlx::SqlitePool = SqlitePoolOptions::new()
            .max_connections(self.connection_limit())
            .idle_timeout(None)
            .max_lifetime(None)
            .connect(&self.url)
            .await?;

        if self.run_migrations {
            MIGRATOR.run(&pool).await?;
        }

        debug!(url = %self.url, "opened sqlite permission store");

        Ok(SqliteStore::new(pool))
    }
}

/// Last model loaded from the database, dropped on every commit.
#[derive(Debug, Default)]
struct SnapshotCache {
    /// Incremented on every commit, a load racing with a commit does not get cached.
    commits: u64,
    model: Option<Arc<Model>>,
}

/// SQLite database with connection pool and transaction provider.
///
/// SQLite strictly serializes transactions with writes. To make this explicit, beginning a
/// transaction acquires the single permit of a semaphore and holds it until the transaction is
/// committed, rolled back or dropped.
///
/// Snapshots are loaded in a read transaction, so they never observe a partially applied write.
/// The last snapshot is kept until the next commit. With a single connection a snapshot can't be
/// loaded while a write transaction is running and waits for it to finish.
#[derive(Clone, Debug)]
pub struct SqliteStore {
    pool: sqlx::SqlitePool,
    semaphore: Arc<Semaphore>,
    snapshot: Arc<Mutex<SnapshotCache>>,
}

impl SqliteStore {
    pub(crate) fn new(pool: sqlx::SqlitePool) -> Self {
        Self {
            pool,
            semaphore: Arc::new(Semaphore::new(1)),
            snapshot: Arc::default(),
        }
    }

    /// Shortcut building an in-memory SQLite database with a randomised name for testing purposes.
    #[cfg(any(test, feature = "test_utils"))]
    pub async fn temporary() -> Self {
        SqliteStoreBuilder::new()
            .random_memory_url()
            .max_connections(1)
            .build()
            .await
            .expect("migrations succeeded")
    }

    fn cached_snapshot(&self) -> MutexGuard<'_, SnapshotCache> {
        self.snapshot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn discard_snapshot(&self) {
        let mut cache = self.cached_snapshot();
        cache.commits += 1;
        cache.model = None;
    }
}

impl EntryStore for SqliteStore {
    type Transaction = SqliteTransaction;

    async fn begin(&self) -> Result<SqliteTransaction, StoreError> {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| StoreError::Closed)?;

        let tx = self.pool.begin().await?;

        Ok(SqliteTransaction {
            tx,
            store: self.clone(),
            _permit: permit,
        })
    }

    async fn snapshot(&self) -> Result<Arc<Model>, StoreError> {
        let commits = {
            let cache = self.cached_snapshot();
            if let Some(model) = &cache.model {
                return Ok(model.clone());
            }
            cache.commits
        };

        let mut conn = self.pool.begin().await?;
        let model = Arc::new(load_model(&mut conn).await?);
        conn.commit().await?;

        let mut cache = self.cached_snapshot();
        if cache.commits == commits {
            cache.model = Some(model.clone());
        }

        Ok(model)
    }
}

/// Running write transaction on a [`SqliteStore`].
///
/// Dropping it without committing rolls back all changes.
pub struct SqliteTransaction {
    tx: sqlx::Transaction<'static, Sqlite>,
    store: SqliteStore,
    _permit: OwnedSemaphorePermit,
}

impl std::fmt::Debug for SqliteTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteTransaction")
            .field("store", &self.store)
            .finish_non_exhaustive()
    }
}

impl StoreTransaction for SqliteTransaction {
    async fn entity(&mut self, entity: &EntityRef) -> Result<Option<Entity>, StoreError> {
        let row: Option<EntityRow> = query_as(
            "
            SELECT
                kind,
                name,
                display_name,
                parent,
                priority
            FROM
                entities_v1
            WHERE
                kind = ?
                AND name = ?
            ",
        )
        .bind(entity.kind.as_str())
        .bind(&entity.name)
        .fetch_optional(&mut *self.tx)
        .await?;

        Ok(row.map(Entity::try_from).transpose()?)
    }

    async fn entities(&mut self, kind: EntityKind) -> Result<Vec<Entity>, StoreError> {
        let rows: Vec<EntityRow> = query_as(
            "
            SELECT
                kind,
                name,
                display_name,
                parent,
                priority
            FROM
                entities_v1
            WHERE
                kind = ?
            ORDER BY
                name
            ",
        )
        .bind(kind.as_str())
        .fetch_all(&mut *self.tx)
        .await?;

        decode_all(rows)
    }

    async fn children(&mut self, group: &str) -> Result<Vec<String>, StoreError> {
        let children: Vec<String> = query_scalar(
            "
            SELECT
                name
            FROM
                entities_v1
            WHERE
                kind = 'group'
                AND parent = ?
            ORDER BY
                name
            ",
        )
        .bind(group)
        .fetch_all(&mut *self.tx)
        .await?;

        Ok(children)
    }

    async fn memberships(&mut self, member: &str) -> Result<Vec<Membership>, StoreError> {
        let rows: Vec<MembershipRow> = query_as(
            "
            SELECT
                member,
                group_name,
                expires_at
            FROM
                memberships_v1
            WHERE
                member = ?
            ORDER BY
                group_name
            ",
        )
        .bind(member)
        .fetch_all(&mut *self.tx)
        .await?;

        Ok(rows.into_iter().map(Membership::from).collect())
    }

    async fn members(&mut self, group: &str) -> Result<Vec<Membership>, StoreError> {
        let rows: Vec<MembershipRow> = query_as(
            "
            SELECT
                member,
                group_name,
                expires_at
            FROM
                memberships_v1
            WHERE
                group_name = ?
            ORDER BY
                member
            ",
        )
        .bind(group)
        .fetch_all(&mut *self.tx)
        .await?;

        Ok(rows.into_iter().map(Membership::from).collect())
    }

    async fn entries(&mut self, entity: &EntityRef) -> Result<Vec<Entry>, StoreError> {
        let rows: Vec<EntryRow> = query_as(
            "
            SELECT
                kind,
                entity,
                permission,
                world,
                region,
                value,
                expires_at
            FROM
                entries_v1
            WHERE
                kind = ?
                AND entity = ?
            ORDER BY
                permission, world, region
            ",
        )
        .bind(entity.kind.as_str())
        .bind(&entity.name)
        .fetch_all(&mut *self.tx)
        .await?;

        decode_all(rows)
    }

    async fn put_entity(&mut self, entity: Entity) -> Result<bool, StoreError> {
        let inserted = query(
            "
            INSERT OR IGNORE
            INTO
                entities_v1 (
                    kind,
                    name,
                    display_name,
                    parent,
                    priority
                )
            VALUES
                (?, ?, ?, ?, ?)
            ",
        )
        .bind(entity.kind.as_str())
        .bind(&entity.name)
        .bind(&entity.display_name)
        .bind(&entity.parent)
        .bind(entity.priority)
        .execute(&mut *self.tx)
        .await?
        .rows_affected()
            > 0;

        if !inserted {
            query(
                "
                UPDATE
                    entities_v1
                SET
                    display_name = ?,
                    parent = ?,
                    priority = ?
                WHERE
                    kind = ?
                    AND name = ?
                ",
            )
            .bind(&entity.display_name)
            .bind(&entity.parent)
            .bind(entity.priority)
            .bind(entity.kind.as_str())
            .bind(&entity.name)
            .execute(&mut *self.tx)
            .await?;
        }

        Ok(inserted)
    }

    async fn delete_entity(&mut self, entity: &EntityRef) -> Result<bool, StoreError> {
        if entity.kind == EntityKind::Group && !self.children(&entity.name).await?.is_empty() {
            return Err(perm_core::ModelError::HasChildren(entity.name.clone()).into());
        }

        query(
            "
            DELETE FROM
                entries_v1
            WHERE
                kind = ?
                AND entity = ?
            ",
        )
        .bind(entity.kind.as_str())
        .bind(&entity.name)
        .execute(&mut *self.tx)
        .await?;

        if entity.kind == EntityKind::Group {
            query(
                "
                DELETE FROM
                    memberships_v1
                WHERE
                    group_name = ?
                ",
            )
            .bind(&entity.name)
            .execute(&mut *self.tx)
            .await?;
        }

        let result = query(
            "
            DELETE FROM
                entities_v1
            WHERE
                kind = ?
                AND name = ?
            ",
        )
        .bind(entity.kind.as_str())
        .bind(&entity.name)
        .execute(&mut *self.tx)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn put_membership(&mut self, membership: Membership) -> Result<bool, StoreError> {
        let expires_at = membership.expires_at.map(encode_timestamp);

        let inserted = query(
            "
            INSERT OR IGNORE
            INTO
                memberships_v1 (
                    member,
                    group_name,
                    expires_at
                )
            VALUES
                (?, ?, ?)
            ",
        )
        .bind(&membership.member)
        .bind(&membership.group)
        .bind(expires_at)
        .execute(&mut *self.tx)
        .await?
        .rows_affected()
            > 0;

        if !inserted {
            query(
                "
                UPDATE
                    memberships_v1
                SET
                    expires_at = ?
                WHERE
                    member = ?
                    AND group_name = ?
                ",
            )
            .bind(expires_at)
            .bind(&membership.member)
            .bind(&membership.group)
            .execute(&mut *self.tx)
            .await?;
        }

        Ok(inserted)
    }

    async fn delete_membership(&mut self, member: &str, group: &str) -> Result<bool, StoreError> {
        let result = query(
            "
            DELETE FROM
                memberships_v1
            WHERE
                member = ?
                AND group_name = ?
            ",
        )
        .bind(member)
        .bind(group)
        .execute(&mut *self.tx)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn put_entry(&mut self, entry: Entry) -> Result<bool, StoreError> {
        let world = entry.permission.world().unwrap_or_default();
        let region = entry.permission.region().unwrap_or_default();
        let expires_at = entry.expires_at.map(encode_timestamp);

        let inserted = query(
            "
            INSERT OR IGNORE
            INTO
                entries_v1 (
                    kind,
                    entity,
                    permission,
                    world,
                    region,
                    value,
                    expires_at
                )
            VALUES
                (?, ?, ?, ?, ?, ?, ?)
            ",
        )
        .bind(entry.entity.kind.as_str())
        .bind(&entry.entity.name)
        .bind(entry.permission.permission())
        .bind(world)
        .bind(region)
        .bind(entry.value)
        .bind(expires_at)
        .execute(&mut *self.tx)
        .await?
        .rows_affected()
            > 0;

        if !inserted {
            query(
                "
                UPDATE
                    entries_v1
                SET
                    value = ?,
                    expires_at = ?
                WHERE
                    kind = ?
                    AND entity = ?
                    AND permission = ?
                    AND world = ?
                    AND region = ?
                ",
            )
            .bind(entry.value)
            .bind(expires_at)
            .bind(entry.entity.kind.as_str())
            .bind(&entry.entity.name)
            .bind(entry.permission.permission())
            .bind(world)
            .bind(region)
            .execute(&mut *self.tx)
            .await?;
        }

        Ok(inserted)
    }

    async fn delete_entry(
        &mut self,
        entity: &EntityRef,
        permission: &QualifiedPermission,
    ) -> Result<bool, StoreError> {
        let result = query(
            "
            DELETE FROM
                entries_v1
            WHERE
                kind = ?
                AND entity = ?
                AND permission = ?
                AND world = ?
                AND region = ?
            ",
        )
        .bind(entity.kind.as_str())
        .bind(&entity.name)
        .bind(permission.permission())
        .bind(permission.world().unwrap_or_default())
        .bind(permission.region().unwrap_or_default())
        .execute(&mut *self.tx)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn delete_expired(&mut self, now: Timestamp) -> Result<Expired, StoreError> {
        let now = encode_timestamp(now);

        let entries: Vec<EntryRow> = query_as(
            "
            SELECT
                kind,
                entity,
                permission,
                world,
                region,
                value,
                expires_at
            FROM
                entries_v1
            WHERE
                expires_at IS NOT NULL
                AND expires_at <= ?
            ",
        )
        .bind(now)
        .fetch_all(&mut *self.tx)
        .await?;

        let memberships: Vec<MembershipRow> = query_as(
            "
            SELECT
                member,
                group_name,
                expires_at
            FROM
                memberships_v1
            WHERE
                expires_at IS NOT NULL
                AND expires_at <= ?
            ",
        )
        .bind(now)
        .fetch_all(&mut *self.tx)
        .await?;

        query(
            "
            DELETE FROM
                entries_v1
            WHERE
                expires_at IS NOT NULL
                AND expires_at <= ?
            ",
        )
        .bind(now)
        .execute(&mut *self.tx)
        .await?;

        query(
            "
            DELETE FROM
                memberships_v1
            WHERE
                expires_at IS NOT NULL
                AND expires_at <= ?
            ",
        )
        .bind(now)
        .execute(&mut *self.tx)
        .await?;

        Ok(Expired {
            entries: decode_all(entries)?,
            memberships: memberships.into_iter().map(Membership::from).collect(),
        })
    }

    async fn commit(self) -> Result<(), StoreError> {
        let Self { tx, store, _permit } = self;
        tx.commit().await?;

        // Drop the cached snapshot before the permit gets released.
        store.discard_snapshot();
        Ok(())
    }

    async fn rollback(self) -> Result<(), StoreError> {
        self.tx.rollback().await?;
        Ok(())
    }
}

async fn load_model(conn: &mut SqliteConnection) -> Result<Model, StoreError> {
    let mut model = Model::new();

    let entities: Vec<EntityRow> = query_as(
        "
        SELECT
            kind,
            name,
            display_name,
            parent,
            priority
        FROM
            entities_v1
        ",
    )
    .fetch_all(&mut *conn)
    .await?;
    for row in entities {
        model.put_entity(Entity::try_from(row)?);
    }

    let memberships: Vec<MembershipRow> = query_as(
        "
        SELECT
            member,
            group_name,
            expires_at
        FROM
            memberships_v1
        ",
    )
    .fetch_all(&mut *conn)
    .await?;
    for row in memberships {
        model.put_membership(Membership::from(row));
    }

    let entries: Vec<EntryRow> = query_as(
        "
        SELECT
            kind,
            entity,
            permission,
            world,
            region,
            value,
            expires_at
        FROM
            entries_v1
        ",
    )
    .fetch_all(&mut *conn)
    .await?;
    for row in entries {
        model.put_entry(Entry::try_from(row)?);
    }

    Ok(model)
}

fn decode_all<R, T>(rows: Vec<R>) -> Result<Vec<T>, StoreError>
where
    T: TryFrom<R, Error = SqliteError>,
{
    rows.into_iter()
        .map(|row| T::try_from(row).map_err(StoreError::from))
        .collect()
}

fn encode_timestamp(timestamp: Timestamp) -> i64 {
    i64::try_from(timestamp.as_secs()).unwrap_or(i64::MAX)
}

fn decode_timestamp(value: i64) -> Timestamp {
    Timestamp::from_secs(u64::try_from(value).unwrap_or_default())
}

#[derive(FromRow)]
struct EntityRow {
    kind: String,
    name: String,
    display_name: String,
    parent: Option<String>,
    priority: i32,
}

impl TryFrom<EntityRow> for Entity {
    type Error = SqliteError;

    fn try_from(row: EntityRow) -> Result<Self, Self::Error> {
        let kind = row
            .kind
            .parse()
            .map_err(|_| SqliteError::Decode("kind", row.kind.clone()))?;

        Ok(Entity {
            kind,
            name: row.name,
            display_name: row.display_name,
            parent: row.parent,
            priority: row.priority,
        })
    }
}

#[derive(FromRow)]
struct MembershipRow {
    member: String,
    group_name: String,
    expires_at: Option<i64>,
}

impl From<MembershipRow> for Membership {
    fn from(row: MembershipRow) -> Self {
        Membership {
            member: row.member,
            group: row.group_name,
            expires_at: row.expires_at.map(decode_timestamp),
        }
    }
}

#[derive(FromRow)]
struct EntryRow {
    kind: String,
    entity: String,
    permission: String,
    world: String,
    region: String,
    value: bool,
    expires_at: Option<i64>,
}

impl TryFrom<EntryRow> for Entry {
    type Error = SqliteError;

    fn try_from(row: EntryRow) -> Result<Self, Self::Error> {
        let kind: EntityKind = row
            .kind
            .parse()
            .map_err(|_| SqliteError::Decode("kind", row.kind.clone()))?;
        let world = (!row.world.is_empty()).then_some(row.world.as_str());
        let region = (!row.region.is_empty()).then_some(row.region.as_str());
        let permission = QualifiedPermission::scoped(&row.permission, world, region)
            .map_err(|err| SqliteError::Decode("permission", err.to_string()))?;

        Ok(Entry {
            entity: EntityRef {
                kind,
                name: row.entity,
            },
            permission,
            value: row.value,
            expires_at: row.expires_at.map(decode_timestamp),
        })
    }
}

#[derive(Debug, Error)]
pub enum SqliteError {
    /// SQLite database and connection error.
    #[error(transparent)]
    Sqlite(#[from] sqlx::Error),

    /// SQL table schema migration error.
    #[error(transparent)]
    Migrate(#[from] sqlx::migrate::MigrateError),

    /// Invalid, corrupted data was found in the database. This is a critical error.
    #[error("could not decode corrupted '{0}' value from database: {1}")]
    Decode(&'static str, String),
}

#[cfg(test)]
mod tests {
    use perm_core::{Entity, EntityKind};

    use crate::{EntryStore, StoreTransaction};

    use super::{SqliteStoreBuilder, is_memory_url};

    #[test]
    fn memory_urls() {
        assert!(is_memory_url("sqlite::memory:"));
        assert!(is_memory_url("sqlite://perms1?mode=memory&cache=private"));
        assert!(!is_memory_url("sqlite://permissions.sqlite"));
    }

    #[tokio::test]
    async fn in_memory_databases_use_one_connection() {
        let store = SqliteStoreBuilder::new()
            .random_memory_url()
            .max_connections(4)
            .build()
            .await
            .unwrap();
        assert_eq!(store.pool.options().get_max_connections(), 1);

        let mut tx = store.begin().await.unwrap();
        tx.put_entity(Entity::new(EntityKind::Group, "vip").unwrap())
            .await
            .unwrap();
        tx.commit().await.unwrap();
        assert!(store.snapshot().await.unwrap().group("vip").is_some());
    }

    #[test]
    fn file_databases_keep_the_configured_pool_size() {
        let builder = SqliteStoreBuilder::new()
            .database_url("sqlite://permissions.sqlite")
            .max_connections(4);
        assert_eq!(builder.connection_limit(), 4);
    }
}
