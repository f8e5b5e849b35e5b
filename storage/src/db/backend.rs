// Backing store abstraction: one trait pair per store technology
// The pool, session and repository layers are generic over these traits

use crate::db::repositories::query::{Filter, Page, Sort};
use crate::errors::StoreError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Field name → JSON value mapping for one row
///
/// Generated fields (`id`, `created_at`, `updated_at`) are part of the map
/// once a row has been written.
pub type FieldMap = serde_json::Map<String, serde_json::Value>;

/// Declared shape of one table: name plus the fields the store must keep
/// unique across rows
///
/// Constraint enforcement is pushed down to the store; the repository only
/// surfaces the resulting conflict as a typed error.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TableSchema {
    pub name: String,
    pub unique_fields: Vec<String>,
}

impl TableSchema {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            unique_fields: Vec::new(),
        }
    }

    pub fn with_unique(mut self, field: impl Into<String>) -> Self {
        self.unique_fields.push(field.into());
        self
    }
}

/// One declarative step of a migration
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemaChange {
    CreateTable(TableSchema),
    AddUniqueField { table: String, field: String },
    DropTable(String),
}

/// Record of one applied migration, ordered by version
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrationRecord {
    pub version: u32,
    pub name: String,
    pub applied_at: DateTime<Utc>,
}

/// An exclusive handle to one physical link to the backing store
///
/// Owned by the pool when idle and by exactly one session when checked out;
/// never shared between two concurrent sessions. All row operations act on
/// the connection's current transaction and become visible to other
/// connections only when `commit` returns.
#[async_trait]
pub trait Connection: Send + 'static {
    /// Start a transaction; any previous uncommitted state is discarded
    async fn begin(&mut self) -> Result<(), StoreError>;

    /// Make all pending writes durable and visible to connections that
    /// begin after this call returns
    async fn commit(&mut self) -> Result<(), StoreError>;

    /// Discard all pending writes
    async fn rollback(&mut self) -> Result<(), StoreError>;

    /// Single-row lookup by primary key
    async fn get(&mut self, table: &str, id: i64) -> Result<Option<FieldMap>, StoreError>;

    /// Filtered, ordered, paginated scan
    async fn select(
        &mut self,
        table: &str,
        filter: &Filter,
        sort: &Sort,
        page: &Page,
    ) -> Result<Vec<FieldMap>, StoreError>;

    /// Insert a row, assigning generated fields; fails with
    /// `UniqueConstraintViolation` on a declared unique collision
    async fn insert(&mut self, table: &str, fields: FieldMap) -> Result<FieldMap, StoreError>;

    /// Merge the provided fields into an existing row; `Ok(None)` when no
    /// row matches the id
    async fn update(
        &mut self,
        table: &str,
        id: i64,
        fields: FieldMap,
    ) -> Result<Option<FieldMap>, StoreError>;

    /// Remove a row; returns whether one was removed
    async fn delete(&mut self, table: &str, id: i64) -> Result<bool, StoreError>;

    /// Migration bookkeeping: all applied versions in ascending order
    async fn applied_migrations(&mut self) -> Result<Vec<MigrationRecord>, StoreError>;

    /// Apply one migration's schema changes and record its version as a
    /// single atomic step: either all changes and the record land, or none
    async fn apply_schema(
        &mut self,
        version: u32,
        name: &str,
        changes: &[SchemaChange],
    ) -> Result<(), StoreError>;

    /// Cheap synchronous liveness probe, used by the pool on release
    fn is_healthy(&self) -> bool;

    /// Discard any unfinished transaction and its reservations
    ///
    /// Invoked by the pool on every release path, including drops caused by
    /// task cancellation; after reset the connection is safe to recycle.
    fn reset(&mut self);
}

/// Factory for store connections
#[async_trait]
pub trait Backend: Send + Sync + 'static {
    type Conn: Connection;

    /// Open one new physical connection
    async fn connect(&self) -> Result<Self::Conn, StoreError>;

    /// Human-readable backend identifier for logs
    fn name(&self) -> &str;
}
