// Migration tracker: versioned, strictly linear schema changes
//
// Invoked by process start-up tooling, never by request handling.

use crate::db::backend::{Backend, Connection, MigrationRecord, SchemaChange};
use crate::db::pool::Pool;
use crate::db::repositories::Entity;
use crate::errors::StoreError;
use crate::models::User;
use tracing::{info, instrument};

/// One versioned schema change
///
/// Versions form a strict linear chain starting at 1; changes are declared,
/// not imperative, so the store can apply them all-or-nothing.
pub trait Migration: Send + Sync {
    fn version(&self) -> u32;
    fn name(&self) -> &str;
    fn changes(&self) -> Vec<SchemaChange>;
}

/// The template's initial schema: the built-in users table
pub struct CreateUsersTable;

impl Migration for CreateUsersTable {
    fn version(&self) -> u32 {
        1
    }

    fn name(&self) -> &str {
        "create users table"
    }

    fn changes(&self) -> Vec<SchemaChange> {
        vec![SchemaChange::CreateTable(User::table_schema())]
    }
}

/// Migrations shipped with the template, in chain order
pub fn builtin_migrations() -> Vec<Box<dyn Migration>> {
    vec![Box::new(CreateUsersTable)]
}

/// Records which schema versions have been applied
pub struct MigrationTracker<B: Backend> {
    pool: Pool<B>,
}

impl<B: Backend> MigrationTracker<B> {
    pub fn new(pool: Pool<B>) -> Self {
        Self { pool }
    }

    /// Highest applied version, `None` on a fresh store
    pub async fn current(&self) -> Result<Option<u32>, StoreError> {
        let applied = self.applied().await?;
        Ok(applied.last().map(|record| record.version))
    }

    /// All applied records in ascending version order
    pub async fn applied(&self) -> Result<Vec<MigrationRecord>, StoreError> {
        let mut conn = self.pool.acquire().await?;
        conn.applied_migrations().await
    }

    /// Declared versions not yet applied, ascending
    ///
    /// A declared version at or below `current()` that is missing from the
    /// applied set means the chain was skipped over; that is reported as
    /// `OutOfOrderMigration` instead of being silently re-ordered.
    pub async fn pending(&self, declared: &[Box<dyn Migration>]) -> Result<Vec<u32>, StoreError> {
        let applied = self.applied().await?;
        let applied_versions: Vec<u32> = applied.iter().map(|r| r.version).collect();
        let current = applied_versions.last().copied();

        let mut declared_versions: Vec<u32> = declared.iter().map(|m| m.version()).collect();
        declared_versions.sort_unstable();

        let mut pending = Vec::new();
        for version in declared_versions {
            if applied_versions.contains(&version) {
                continue;
            }
            if let Some(current) = current {
                if version <= current {
                    return Err(StoreError::OutOfOrderMigration {
                        attempted: version,
                        current: Some(current),
                    });
                }
            }
            pending.push(version);
        }
        Ok(pending)
    }

    /// Apply one migration
    ///
    /// Returns `false` without touching the schema when the version is
    /// already applied; fails with `OutOfOrderMigration` unless the version
    /// is exactly one greater than `current()`.
    #[instrument(skip(self, migration), fields(version = migration.version(), name = migration.name()))]
    pub async fn apply(&self, migration: &dyn Migration) -> Result<bool, StoreError> {
        let applied = self.applied().await?;
        let version = migration.version();

        if applied.iter().any(|r| r.version == version) {
            info!(version, "Migration already applied, skipping");
            return Ok(false);
        }

        let current = applied.last().map(|r| r.version);
        let expected = current.map_or(1, |c| c + 1);
        if version != expected {
            return Err(StoreError::OutOfOrderMigration {
                attempted: version,
                current,
            });
        }

        let mut conn = self.pool.acquire().await?;
        conn.apply_schema(version, migration.name(), &migration.changes())
            .await?;
        info!(version, name = migration.name(), "Migration applied");
        Ok(true)
    }

    /// Apply every pending migration in chain order; returns how many ran
    #[instrument(skip(self, declared), fields(declared = declared.len()))]
    pub async fn apply_all(&self, declared: &[Box<dyn Migration>]) -> Result<usize, StoreError> {
        let pending = self.pending(declared).await?;
        let mut ran = 0;
        for version in pending {
            let migration = declared
                .iter()
                .find(|m| m.version() == version)
                .expect("pending versions come from declared");
            if self.apply(migration.as_ref()).await? {
                ran += 1;
            }
        }
        info!(ran, "Migrations up to date");
        Ok(ran)
    }
}
