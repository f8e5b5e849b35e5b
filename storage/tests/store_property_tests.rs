// Property-based tests for the data layer

use proptest::prelude::*;
use std::time::Duration;
use storage::db::backend::{Backend as _, Connection as _, SchemaChange, TableSchema};
use storage::db::memory::MemoryBackend;
use storage::db::migrations::{Migration, MigrationTracker};
use storage::db::pool::{Pool, PoolOptions};
use storage::db::repositories::query::{Filter, Page, Sort};
use storage::errors::StoreError;

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("test runtime")
}

struct TableMigration {
    version: u32,
    table: String,
}

impl Migration for TableMigration {
    fn version(&self) -> u32 {
        self.version
    }

    fn name(&self) -> &str {
        &self.table
    }

    fn changes(&self) -> Vec<SchemaChange> {
        vec![SchemaChange::CreateTable(TableSchema::new(&self.table))]
    }
}

fn chain_of(len: u32) -> Vec<Box<dyn Migration>> {
    (1..=len)
        .map(|version| {
            Box::new(TableMigration {
                version,
                table: format!("table_{version}"),
            }) as Box<dyn Migration>
        })
        .collect()
}

/// *For any* interleaving of acquires and releases, the number of
/// checked-out connections never exceeds max_size + max_overflow, and
/// every release frees capacity for a later acquire.
#[test]
fn property_pool_capacity_is_never_exceeded() {
    proptest!(ProptestConfig::with_cases(64), |(
        max_size in 1u32..4,
        max_overflow in 0u32..3,
        ops in prop::collection::vec(any::<bool>(), 1..15),
    )| {
        runtime().block_on(async {
            let opts = PoolOptions {
                min_size: 0,
                max_size,
                max_overflow,
                acquire_timeout: Duration::from_millis(5),
                health_check_on_release: true,
                shutdown_grace: Duration::from_millis(100),
            };
            let capacity = (max_size + max_overflow) as usize;
            let pool = Pool::new(MemoryBackend::new(), opts).await.unwrap();

            let mut held = Vec::new();
            for acquire in ops {
                if acquire {
                    match pool.acquire().await {
                        Ok(conn) => held.push(conn),
                        // Only a full pool may refuse
                        Err(StoreError::PoolExhausted { .. }) => {
                            prop_assert_eq!(held.len(), capacity);
                        }
                        Err(err) => return Err(TestCaseError::fail(format!("{err}"))),
                    }
                } else {
                    held.pop();
                }

                let status = pool.status();
                prop_assert!(status.checked_out <= capacity);
                prop_assert!(status.total <= capacity);
                prop_assert_eq!(status.checked_out, held.len());
            }

            drop(held);
            prop_assert_eq!(pool.status().checked_out, 0);
            Ok(())
        })?;
    });
}

/// *For any* chain length, applying the whole chain lands on exactly that
/// version, leaves nothing pending, and a second run is a no-op.
#[test]
fn property_migration_chain_applies_in_order_and_once() {
    proptest!(ProptestConfig::with_cases(32), |(len in 1u32..6)| {
        runtime().block_on(async {
            let pool = Pool::new(MemoryBackend::new(), PoolOptions::default())
                .await
                .unwrap();
            let tracker = MigrationTracker::new(pool);
            let chain = chain_of(len);

            prop_assert_eq!(tracker.apply_all(&chain).await.unwrap(), len as usize);
            prop_assert_eq!(tracker.current().await.unwrap(), Some(len));
            prop_assert!(tracker.pending(&chain).await.unwrap().is_empty());

            prop_assert_eq!(tracker.apply_all(&chain).await.unwrap(), 0);
            prop_assert_eq!(tracker.current().await.unwrap(), Some(len));
            Ok(())
        })?;
    });
}

/// *For any* version other than current + 1, a single apply is rejected as
/// out of order and the store's version does not move.
#[test]
fn property_version_gap_is_rejected() {
    proptest!(ProptestConfig::with_cases(32), |(attempted in 2u32..10)| {
        runtime().block_on(async {
            let pool = Pool::new(MemoryBackend::new(), PoolOptions::default())
                .await
                .unwrap();
            let tracker = MigrationTracker::new(pool);
            let migration = TableMigration {
                version: attempted,
                table: "orphan".to_string(),
            };

            let err = tracker.apply(&migration).await.unwrap_err();
            let rejected = matches!(
                err,
                StoreError::OutOfOrderMigration { attempted: a, current: None } if a == attempted
            );
            prop_assert!(rejected, "unexpected error: {err}");
            prop_assert_eq!(tracker.current().await.unwrap(), None);
            Ok(())
        })?;
    });
}

/// *For any* row count, offset and limit, a listing returns the rows of
/// exactly that window in ascending id order.
#[test]
fn property_pagination_returns_the_exact_window() {
    proptest!(ProptestConfig::with_cases(48), |(
        rows in 0u64..25,
        offset in 0u64..30,
        limit in 0u64..15,
    )| {
        runtime().block_on(async {
            let backend = MemoryBackend::new();
            let mut conn = backend.connect().await.unwrap();
            conn.apply_schema(1, "items", &[SchemaChange::CreateTable(TableSchema::new("items"))])
                .await
                .unwrap();

            conn.begin().await.unwrap();
            for n in 0..rows {
                let mut fields = serde_json::Map::new();
                fields.insert("serial".to_string(), serde_json::json!(n));
                conn.insert("items", fields).await.unwrap();
            }
            conn.commit().await.unwrap();

            let all = conn
                .select("items", &Filter::new(), &Sort::primary_key(), &Page::new(0, rows.max(1)))
                .await
                .unwrap();
            let window = conn
                .select("items", &Filter::new(), &Sort::primary_key(), &Page::new(offset, limit))
                .await
                .unwrap();

            let expected: Vec<_> = all
                .iter()
                .skip(offset as usize)
                .take(limit as usize)
                .cloned()
                .collect();
            prop_assert_eq!(window, expected);

            let ids: Vec<i64> = all.iter().map(|row| row["id"].as_i64().unwrap()).collect();
            prop_assert!(ids.windows(2).all(|pair| pair[0] < pair[1]));
            Ok(())
        })?;
    });
}

/// *For any* integer field value and threshold, each comparison operator
/// agrees with the ordinary integer comparison.
#[test]
fn property_filter_operators_agree_with_integer_order() {
    proptest!(|(value in -1000i64..1000, threshold in -1000i64..1000)| {
        let mut row = serde_json::Map::new();
        row.insert("n".to_string(), serde_json::json!(value));

        prop_assert_eq!(Filter::new().eq("n", threshold).matches(&row), value == threshold);
        prop_assert_eq!(Filter::new().lt("n", threshold).matches(&row), value < threshold);
        prop_assert_eq!(Filter::new().le("n", threshold).matches(&row), value <= threshold);
        prop_assert_eq!(Filter::new().gt("n", threshold).matches(&row), value > threshold);
        prop_assert_eq!(Filter::new().ge("n", threshold).matches(&row), value >= threshold);
    });
}
