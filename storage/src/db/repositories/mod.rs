// Repository layer: generic CRUD operations over any entity type
//
// A repository is stateless and holds no data; every operation runs inside
// the caller-supplied session's transaction and none of them commit. The
// commit/rollback boundary belongs to the service layer.

pub mod query;
pub mod user;

use crate::db::backend::{Backend, Connection, FieldMap, TableSchema};
use crate::db::session::Session;
use crate::errors::StoreError;
use query::{Filter, Page, Sort};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::marker::PhantomData;
use tracing::instrument;

pub use user::UserRepository;

/// A persisted record type with a declared table shape
///
/// Entities are immutable value snapshots once read; mutation happens only
/// through repository write operations that return a new snapshot. The
/// mapping metadata is resolved at compile time through this trait, not by
/// runtime reflection.
pub trait Entity: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Table the entity persists to
    const TABLE: &'static str;

    /// Declared table shape, consumed by migrations
    fn table_schema() -> TableSchema;

    /// Primary key of this snapshot
    fn id(&self) -> i64;

    /// Decode one stored row
    fn from_row(row: FieldMap) -> Result<Self, StoreError> {
        serde_json::from_value(Value::Object(row)).map_err(|e| StoreError::Decode {
            table: Self::TABLE.to_string(),
            reason: e.to_string(),
        })
    }
}

/// Encode a create/update payload into a field map
fn to_field_map<T: Serialize>(table: &str, value: &T) -> Result<FieldMap, StoreError> {
    match serde_json::to_value(value) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(StoreError::Encode {
            table: table.to_string(),
            reason: format!("expected a JSON object, got {other}"),
        }),
        Err(e) => Err(StoreError::Encode {
            table: table.to_string(),
            reason: e.to_string(),
        }),
    }
}

/// Stateless CRUD operation set for one entity type
#[derive(Debug)]
pub struct Repository<E: Entity> {
    _entity: PhantomData<fn() -> E>,
}

impl<E: Entity> Clone for Repository<E> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<E: Entity> Copy for Repository<E> {}

impl<E: Entity> Default for Repository<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Entity> Repository<E> {
    pub const fn new() -> Self {
        Self {
            _entity: PhantomData,
        }
    }

    /// Single-row lookup by primary key; `NotFound` when absent
    #[instrument(skip(self, session), fields(table = E::TABLE))]
    pub async fn get<B: Backend>(
        &self,
        session: &mut Session<B>,
        id: i64,
    ) -> Result<E, StoreError> {
        self.find(session, id)
            .await?
            .ok_or(StoreError::NotFound {
                entity: E::TABLE,
                id,
            })
    }

    /// Single-row lookup by primary key; `None` when absent
    pub async fn find<B: Backend>(
        &self,
        session: &mut Session<B>,
        id: i64,
    ) -> Result<Option<E>, StoreError> {
        let row = session.connection()?.get(E::TABLE, id).await?;
        row.map(E::from_row).transpose()
    }

    /// Filtered scan, ordered by primary key ascending unless an explicit
    /// sort key is given; the page's limit always caps the result
    #[instrument(skip(self, session, filter, sort), fields(table = E::TABLE, offset = page.offset, limit = page.limit))]
    pub async fn list<B: Backend>(
        &self,
        session: &mut Session<B>,
        filter: &Filter,
        sort: &Sort,
        page: &Page,
    ) -> Result<Vec<E>, StoreError> {
        let rows = session
            .connection()?
            .select(E::TABLE, filter, sort, page)
            .await?;
        rows.into_iter().map(E::from_row).collect()
    }

    /// Insert a new row and return the stored snapshot including generated
    /// fields (primary key, timestamps)
    #[instrument(skip(self, session, input), fields(table = E::TABLE))]
    pub async fn create<B: Backend, C: Serialize>(
        &self,
        session: &mut Session<B>,
        input: &C,
    ) -> Result<E, StoreError> {
        let fields = to_field_map(E::TABLE, input)?;
        let row = session.connection()?.insert(E::TABLE, fields).await?;
        E::from_row(row)
    }

    /// Merge only the provided fields into an existing row
    ///
    /// The patch type decides what "provided" means; optional fields that
    /// skip serialization when unset leave the stored value untouched.
    #[instrument(skip(self, session, patch), fields(table = E::TABLE, id))]
    pub async fn update<B: Backend, P: Serialize>(
        &self,
        session: &mut Session<B>,
        id: i64,
        patch: &P,
    ) -> Result<E, StoreError> {
        let fields = to_field_map(E::TABLE, patch)?;
        let row = session.connection()?.update(E::TABLE, id, fields).await?;
        match row {
            Some(row) => E::from_row(row),
            None => Err(StoreError::NotFound {
                entity: E::TABLE,
                id,
            }),
        }
    }

    /// Remove a row; returns whether one was removed, absence is not an
    /// error
    #[instrument(skip(self, session), fields(table = E::TABLE, id))]
    pub async fn delete<B: Backend>(
        &self,
        session: &mut Session<B>,
        id: i64,
    ) -> Result<bool, StoreError> {
        session.connection()?.delete(E::TABLE, id).await
    }
}
