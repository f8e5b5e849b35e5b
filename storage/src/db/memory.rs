// In-process backing store with transactional connections
//
// Committed state lives behind an RwLock shared by every connection; each
// connection keeps its own transaction overlay, so uncommitted writes are
// visible only to the session that made them (read-committed semantics).
// Declared unique fields are enforced here, not in the repository layer.

use crate::db::backend::{
    Backend, Connection, FieldMap, MigrationRecord, SchemaChange, TableSchema,
};
use crate::db::repositories::query::{compare_values, Filter, Page, Sort};
use crate::errors::StoreError;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex};
use tokio::sync::RwLock;
use tracing::{debug, instrument, warn};

/// Committed store state, shared by all connections of one backend
#[derive(Debug, Default)]
struct StoreState {
    schema: BTreeMap<String, TableSchema>,
    tables: BTreeMap<String, BTreeMap<i64, FieldMap>>,
    migrations: Vec<MigrationRecord>,
}

/// Key of one unique-value reservation: (table, field, canonical value)
type ReservedKey = (String, String, String);

#[derive(Debug, Default)]
struct Shared {
    state: RwLock<StoreState>,
    /// Unique values claimed by open transactions, keyed to the owning
    /// connection; makes the loser of two concurrent conflicting inserts
    /// fail at insert time instead of at commit
    reservations: Mutex<HashMap<ReservedKey, u64>>,
    /// Per-table id sequences; ids burned by a rolled-back insert are not
    /// reused
    next_ids: Mutex<BTreeMap<String, i64>>,
}

/// In-process store backend
///
/// Cheap to clone; clones share the same committed state.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    shared: Arc<Shared>,
    conn_counter: Arc<AtomicU64>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    type Conn = MemoryConnection;

    async fn connect(&self) -> Result<MemoryConnection, StoreError> {
        let id = self.conn_counter.fetch_add(1, AtomicOrdering::Relaxed) + 1;
        debug!(conn_id = id, "Opened memory store connection");
        Ok(MemoryConnection {
            id,
            shared: Arc::clone(&self.shared),
            txn: None,
        })
    }

    fn name(&self) -> &str {
        "memory"
    }
}

/// Pending writes of one open transaction
#[derive(Debug, Default)]
struct Txn {
    /// (table, id) → new row, or None for a pending delete
    overlay: BTreeMap<(String, i64), Option<FieldMap>>,
    /// Reservations taken by this transaction, released on finalize
    reserved: Vec<ReservedKey>,
}

/// One physical connection to the in-process store
#[derive(Debug)]
pub struct MemoryConnection {
    id: u64,
    shared: Arc<Shared>,
    txn: Option<Txn>,
}

impl MemoryConnection {
    /// Committed rows of one table with this transaction's overlay applied
    async fn visible_rows(&self, table: &str) -> Result<BTreeMap<i64, FieldMap>, StoreError> {
        let state = self.shared.state.read().await;
        let mut rows = state
            .tables
            .get(table)
            .cloned()
            .ok_or_else(|| StoreError::UnknownTable(table.to_string()))?;
        drop(state);

        if let Some(txn) = &self.txn {
            for ((t, id), change) in &txn.overlay {
                if t == table {
                    match change {
                        Some(row) => {
                            rows.insert(*id, row.clone());
                        }
                        None => {
                            rows.remove(id);
                        }
                    }
                }
            }
        }
        Ok(rows)
    }

    async fn table_schema(&self, table: &str) -> Result<TableSchema, StoreError> {
        let state = self.shared.state.read().await;
        state
            .schema
            .get(table)
            .cloned()
            .ok_or_else(|| StoreError::UnknownTable(table.to_string()))
    }

    fn next_id(&self, table: &str) -> i64 {
        let mut ids = self.shared.next_ids.lock().unwrap_or_else(|p| p.into_inner());
        let next = ids.entry(table.to_string()).or_insert(0);
        *next += 1;
        *next
    }

    /// Claim a unique value for this connection's open transaction
    ///
    /// Fails when another open transaction already holds the value; the
    /// check against committed rows happens separately in the caller.
    fn reserve(&mut self, table: &str, field: &str, value: &Value) -> Result<(), StoreError> {
        let key: ReservedKey = (table.to_string(), field.to_string(), value.to_string());
        let mut reservations = self
            .shared
            .reservations
            .lock()
            .unwrap_or_else(|p| p.into_inner());
        match reservations.get(&key) {
            Some(owner) if *owner != self.id => Err(StoreError::UniqueConstraintViolation {
                table: table.to_string(),
                field: field.to_string(),
            }),
            Some(_) => Ok(()),
            None => {
                reservations.insert(key.clone(), self.id);
                if let Some(txn) = self.txn.as_mut() {
                    txn.reserved.push(key);
                }
                Ok(())
            }
        }
    }

    fn release_reservations(&self, keys: &[ReservedKey]) {
        let mut reservations = self
            .shared
            .reservations
            .lock()
            .unwrap_or_else(|p| p.into_inner());
        for key in keys {
            if reservations.get(key) == Some(&self.id) {
                reservations.remove(key);
            }
        }
    }

    /// Enforce declared unique fields for one candidate row against the
    /// rows visible to this transaction
    async fn check_uniques(
        &mut self,
        table: &str,
        schema: &TableSchema,
        row: &FieldMap,
        exclude_id: Option<i64>,
    ) -> Result<(), StoreError> {
        let visible = self.visible_rows(table).await?;
        for field in &schema.unique_fields {
            let value = match row.get(field) {
                Some(v) if !v.is_null() => v,
                // Absent/null values carry no uniqueness obligation
                _ => continue,
            };
            let collision = visible.iter().any(|(id, existing)| {
                Some(*id) != exclude_id && existing.get(field) == Some(value)
            });
            if collision {
                return Err(StoreError::UniqueConstraintViolation {
                    table: table.to_string(),
                    field: field.clone(),
                });
            }
            self.reserve(table, field, value)?;
        }
        Ok(())
    }

    fn txn_mut(&mut self) -> &mut Txn {
        self.txn.get_or_insert_with(Txn::default)
    }

    /// Make one transaction's overlay durable
    ///
    /// Affected tables are staged, unique fields re-verified under the write
    /// lock, and the swap happens only when every check passed.
    async fn apply_overlay(&self, txn: &Txn) -> Result<(), StoreError> {
        if txn.overlay.is_empty() {
            return Ok(());
        }
        let mut state = self.shared.state.write().await;

        let mut staged: BTreeMap<String, BTreeMap<i64, FieldMap>> = BTreeMap::new();
        for ((table, id), change) in &txn.overlay {
            if !staged.contains_key(table) {
                let rows = state
                    .tables
                    .get(table)
                    .cloned()
                    .ok_or_else(|| StoreError::UnknownTable(table.clone()))?;
                staged.insert(table.clone(), rows);
            }
            let rows = staged.get_mut(table).expect("staged above");
            match change {
                Some(row) => {
                    rows.insert(*id, row.clone());
                }
                None => {
                    rows.remove(id);
                }
            }
        }

        for (table, rows) in &staged {
            let schema = state
                .schema
                .get(table)
                .ok_or_else(|| StoreError::UnknownTable(table.clone()))?;
            for field in &schema.unique_fields {
                let mut seen: HashMap<String, i64> = HashMap::new();
                for (id, row) in rows {
                    let Some(value) = row.get(field).filter(|v| !v.is_null()) else {
                        continue;
                    };
                    if seen.insert(value.to_string(), *id).is_some() {
                        return Err(StoreError::UniqueConstraintViolation {
                            table: table.clone(),
                            field: field.clone(),
                        });
                    }
                }
            }
        }

        for (table, rows) in staged {
            state.tables.insert(table, rows);
        }
        Ok(())
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn begin(&mut self) -> Result<(), StoreError> {
        self.reset();
        self.txn = Some(Txn::default());
        Ok(())
    }

    #[instrument(skip(self), fields(conn_id = self.id))]
    async fn commit(&mut self) -> Result<(), StoreError> {
        let Some(txn) = self.txn.take() else {
            return Ok(());
        };
        let result = self.apply_overlay(&txn).await;
        self.release_reservations(&txn.reserved);
        if result.is_ok() {
            debug!(conn_id = self.id, rows = txn.overlay.len(), "Transaction committed");
        }
        result
    }

    async fn rollback(&mut self) -> Result<(), StoreError> {
        if let Some(txn) = self.txn.take() {
            self.release_reservations(&txn.reserved);
            debug!(conn_id = self.id, "Transaction rolled back");
        }
        Ok(())
    }

    async fn get(&mut self, table: &str, id: i64) -> Result<Option<FieldMap>, StoreError> {
        if let Some(txn) = &self.txn {
            if let Some(change) = txn.overlay.get(&(table.to_string(), id)) {
                return Ok(change.clone());
            }
        }
        let state = self.shared.state.read().await;
        let rows = state
            .tables
            .get(table)
            .ok_or_else(|| StoreError::UnknownTable(table.to_string()))?;
        Ok(rows.get(&id).cloned())
    }

    async fn select(
        &mut self,
        table: &str,
        filter: &Filter,
        sort: &Sort,
        page: &Page,
    ) -> Result<Vec<FieldMap>, StoreError> {
        let rows = self.visible_rows(table).await?;

        // BTreeMap iteration already yields primary-key ascending order
        let mut matched: Vec<FieldMap> =
            rows.into_values().filter(|row| filter.matches(row)).collect();

        if let Some(field) = &sort.field {
            matched.sort_by(|a, b| {
                let av = a.get(field).unwrap_or(&Value::Null);
                let bv = b.get(field).unwrap_or(&Value::Null);
                compare_values(av, bv).unwrap_or(Ordering::Equal)
            });
        }
        if sort.descending {
            matched.reverse();
        }

        Ok(matched
            .into_iter()
            .skip(page.offset as usize)
            .take(page.limit as usize)
            .collect())
    }

    async fn insert(&mut self, table: &str, mut fields: FieldMap) -> Result<FieldMap, StoreError> {
        let schema = self.table_schema(table).await?;

        let id = self.next_id(table);
        let now = serde_json::to_value(Utc::now()).map_err(|e| StoreError::Encode {
            table: table.to_string(),
            reason: e.to_string(),
        })?;
        fields.insert("id".to_string(), Value::from(id));
        fields.insert("created_at".to_string(), now.clone());
        fields.insert("updated_at".to_string(), now);

        self.txn_mut();
        self.check_uniques(table, &schema, &fields, None).await?;

        self.txn_mut()
            .overlay
            .insert((table.to_string(), id), Some(fields.clone()));
        Ok(fields)
    }

    async fn update(
        &mut self,
        table: &str,
        id: i64,
        fields: FieldMap,
    ) -> Result<Option<FieldMap>, StoreError> {
        let schema = self.table_schema(table).await?;

        let Some(mut merged) = self.get(table, id).await? else {
            return Ok(None);
        };
        for (key, value) in fields {
            // Generated fields are never caller-writable
            if key == "id" || key == "created_at" || key == "updated_at" {
                continue;
            }
            merged.insert(key, value);
        }
        merged.insert(
            "updated_at".to_string(),
            serde_json::to_value(Utc::now()).map_err(|e| StoreError::Encode {
                table: table.to_string(),
                reason: e.to_string(),
            })?,
        );

        self.txn_mut();
        self.check_uniques(table, &schema, &merged, Some(id)).await?;

        self.txn_mut()
            .overlay
            .insert((table.to_string(), id), Some(merged.clone()));
        Ok(Some(merged))
    }

    async fn delete(&mut self, table: &str, id: i64) -> Result<bool, StoreError> {
        let existing = self.get(table, id).await?;
        if existing.is_none() {
            return Ok(false);
        }
        self.txn_mut()
            .overlay
            .insert((table.to_string(), id), None);
        Ok(true)
    }

    async fn applied_migrations(&mut self) -> Result<Vec<MigrationRecord>, StoreError> {
        let state = self.shared.state.read().await;
        Ok(state.migrations.clone())
    }

    #[instrument(skip(self, changes), fields(conn_id = self.id, version, name))]
    async fn apply_schema(
        &mut self,
        version: u32,
        name: &str,
        changes: &[SchemaChange],
    ) -> Result<(), StoreError> {
        let mut state = self.shared.state.write().await;

        if state.migrations.iter().any(|m| m.version == version) {
            debug!(version, "Migration already recorded, skipping");
            return Ok(());
        }

        // Stage every change against a copy of the schema; the swap below
        // together with the record push is the all-or-nothing boundary
        let mut schema = state.schema.clone();
        let mut tables = state.tables.clone();
        for change in changes {
            match change {
                SchemaChange::CreateTable(table) => {
                    if schema.contains_key(&table.name) {
                        return Err(StoreError::InvalidSchemaChange(format!(
                            "table already exists: {}",
                            table.name
                        )));
                    }
                    schema.insert(table.name.clone(), table.clone());
                    tables.insert(table.name.clone(), BTreeMap::new());
                }
                SchemaChange::AddUniqueField { table, field } => {
                    let entry = schema.get_mut(table).ok_or_else(|| {
                        StoreError::InvalidSchemaChange(format!("no such table: {table}"))
                    })?;
                    let rows = tables.get(table).expect("schema and tables stay in step");
                    let mut seen = std::collections::HashSet::new();
                    for row in rows.values() {
                        if let Some(value) = row.get(field).filter(|v| !v.is_null()) {
                            if !seen.insert(value.to_string()) {
                                return Err(StoreError::InvalidSchemaChange(format!(
                                    "existing rows violate uniqueness of {table}.{field}"
                                )));
                            }
                        }
                    }
                    if !entry.unique_fields.contains(field) {
                        entry.unique_fields.push(field.clone());
                    }
                }
                SchemaChange::DropTable(table) => {
                    if schema.remove(table).is_none() {
                        return Err(StoreError::InvalidSchemaChange(format!(
                            "no such table: {table}"
                        )));
                    }
                    tables.remove(table);
                }
            }
        }

        state.schema = schema;
        state.tables = tables;
        state.migrations.push(MigrationRecord {
            version,
            name: name.to_string(),
            applied_at: Utc::now(),
        });
        state.migrations.sort_by_key(|m| m.version);
        Ok(())
    }

    fn is_healthy(&self) -> bool {
        true
    }

    fn reset(&mut self) {
        if let Some(txn) = self.txn.take() {
            if !txn.overlay.is_empty() {
                warn!(
                    conn_id = self.id,
                    pending = txn.overlay.len(),
                    "Discarding unfinished transaction on connection reset"
                );
            }
            self.release_reservations(&txn.reserved);
        }
    }
}
