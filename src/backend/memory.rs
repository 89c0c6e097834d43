//! In-process backend over a `RawDataset`, with a broadcast change feed.
//!
//! Stands in for the hosted service in the CLI and in tests. Every write emits
//! the same change events the hosted feed would.

use super::{Backend, BackendError, CreatedOrder};
use crate::data::changes::{ChangeEvent, ChangeKind, Table, upsert};
use crate::data::{
    EmployeeRow, InventoryRow, OrderItemRow, OrderRow, ProductRow, RawDataset, Role, Row, RowId,
};
use anyhow::Context;
use async_trait::async_trait;
use std::path::Path;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use tokio::sync::{Mutex, broadcast};
use tracing::{debug, info};

const FEED_CAPACITY: usize = 256;

pub struct MemoryBackend {
    tables: Mutex<RawDataset>,
    next_id: AtomicI64,
    feed: broadcast::Sender<ChangeEvent>,
    fetches: AtomicUsize,
}

impl MemoryBackend {
    pub fn new(dataset: RawDataset) -> Self {
        let max_id = [
            dataset.products.iter().map(Row::id).max(),
            dataset.product_variants.iter().map(Row::id).max(),
            dataset.inventory.iter().map(Row::id).max(),
            dataset.orders.iter().map(Row::id).max(),
            dataset.order_items.iter().map(Row::id).max(),
            dataset.employees.iter().map(Row::id).max(),
        ]
        .into_iter()
        .flatten()
        .max()
        .unwrap_or(0);

        let (feed, _) = broadcast::channel(FEED_CAPACITY);
        Self {
            tables: Mutex::new(dataset),
            next_id: AtomicI64::new(max_id + 1),
            feed,
            fetches: AtomicUsize::new(0),
        }
    }

    /// Load a JSON fixture shaped like `RawDataset`.
    pub async fn from_fixture(path: &Path) -> anyhow::Result<Self> {
        let text = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read fixture {}", path.display()))?;
        let dataset: RawDataset = serde_json::from_str(&text)
            .with_context(|| format!("failed to parse fixture {}", path.display()))?;
        info!(
            path = %path.display(),
            products = dataset.products.len(),
            orders = dataset.orders.len(),
            "fixture loaded"
        );
        Ok(Self::new(dataset))
    }

    /// How many times `fetch_all` has been served.
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    /// Push an event onto the feed without touching the tables, as if another
    /// client had written it.
    pub fn publish(&self, event: ChangeEvent) {
        // No subscribers is not an error for a feed.
        let _ = self.feed.send(event);
    }

    /// Apply a change to the stored tables and announce it.
    pub async fn apply_external(&self, event: ChangeEvent) -> Result<(), BackendError> {
        let mut tables = self.tables.lock().await;
        if event.table == "employees" {
            apply_employee(&mut tables.employees, &event)?;
        } else {
            crate::data::changes::apply(&mut tables, &event)
                .map_err(|e| BackendError::Rejected(e.to_string()))?;
        }
        drop(tables);
        self.publish(event);
        Ok(())
    }

    /// Add an employee. Employees are not patched locally by providers, so this
    /// exercises the refetch path.
    pub async fn insert_employee(&self, name: &str, role: Role) -> EmployeeRow {
        let row = EmployeeRow {
            id: self.assign_id(),
            name: name.to_owned(),
            role,
        };
        self.tables.lock().await.employees.push(row.clone());
        self.publish(ChangeEvent {
            table: "employees".to_owned(),
            kind: ChangeKind::Insert,
            record: serde_json::to_value(&row).unwrap_or_default(),
            id: Some(row.id),
        });
        row
    }

    fn assign_id(&self) -> RowId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }
}

/// Employees are stored here but never patched by providers.
fn apply_employee(rows: &mut Vec<EmployeeRow>, event: &ChangeEvent) -> Result<(), BackendError> {
    match event.kind {
        ChangeKind::Insert | ChangeKind::Update => {
            let row: EmployeeRow = serde_json::from_value(event.record.clone())
                .map_err(|e| BackendError::Rejected(format!("bad employee record: {e}")))?;
            upsert(rows, row);
        }
        ChangeKind::Delete => {
            let id = event
                .id
                .or_else(|| event.record.get("id").and_then(serde_json::Value::as_i64))
                .ok_or_else(|| BackendError::Rejected("employee delete without id".into()))?;
            rows.retain(|e| e.id != id);
        }
    }
    Ok(())
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn fetch_all(&self) -> Result<RawDataset, BackendError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let tables = self.tables.lock().await;
        debug!(
            products = tables.products.len(),
            orders = tables.orders.len(),
            "serving fetch_all"
        );
        Ok(tables.clone())
    }

    async fn insert_order(
        &self,
        order: &OrderRow,
        items: &[OrderItemRow],
    ) -> Result<CreatedOrder, BackendError> {
        let mut tables = self.tables.lock().await;
        for item in items {
            if tables.variant(item.variant_id).is_none() {
                return Err(BackendError::NotFound {
                    table: Table::Variants.name(),
                    id: item.variant_id,
                });
            }
        }

        let order = OrderRow {
            id: self.assign_id(),
            ..order.clone()
        };
        let items: Vec<OrderItemRow> = items
            .iter()
            .map(|item| OrderItemRow {
                id: self.assign_id(),
                order_id: order.id,
                ..item.clone()
            })
            .collect();

        tables.orders.push(order.clone());
        tables.order_items.extend(items.iter().cloned());
        drop(tables);

        self.publish(ChangeEvent::upsert(Table::Orders, ChangeKind::Insert, &order));
        for item in &items {
            self.publish(ChangeEvent::upsert(Table::OrderItems, ChangeKind::Insert, item));
        }
        Ok(CreatedOrder { order, items })
    }

    async fn update_order(&self, order: &OrderRow) -> Result<(), BackendError> {
        let mut tables = self.tables.lock().await;
        let Some(existing) = tables.orders.iter_mut().find(|o| o.id == order.id) else {
            return Err(BackendError::NotFound {
                table: Table::Orders.name(),
                id: order.id,
            });
        };
        *existing = order.clone();
        drop(tables);
        self.publish(ChangeEvent::upsert(Table::Orders, ChangeKind::Update, order));
        Ok(())
    }

    async fn delete_order(&self, id: RowId) -> Result<(), BackendError> {
        let mut tables = self.tables.lock().await;
        if tables.order(id).is_none() {
            return Err(BackendError::NotFound {
                table: Table::Orders.name(),
                id,
            });
        }
        tables.orders.retain(|o| o.id != id);
        let (removed, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut tables.order_items)
            .into_iter()
            .partition(|i| i.order_id == id);
        tables.order_items = kept;
        drop(tables);

        for item in &removed {
            self.publish(ChangeEvent::delete(Table::OrderItems, item.id));
        }
        self.publish(ChangeEvent::delete(Table::Orders, id));
        Ok(())
    }

    async fn update_product(&self, product: &ProductRow) -> Result<(), BackendError> {
        let mut tables = self.tables.lock().await;
        let Some(existing) = tables.products.iter_mut().find(|p| p.id == product.id) else {
            return Err(BackendError::NotFound {
                table: Table::Products.name(),
                id: product.id,
            });
        };
        *existing = product.clone();
        drop(tables);
        self.publish(ChangeEvent::upsert(Table::Products, ChangeKind::Update, product));
        Ok(())
    }

    async fn upsert_inventory(&self, row: &InventoryRow) -> Result<InventoryRow, BackendError> {
        if row.quantity < 0 {
            return Err(BackendError::Rejected(format!(
                "inventory quantity must not be negative (got {})",
                row.quantity
            )));
        }
        let mut tables = self.tables.lock().await;
        if tables.variant(row.variant_id).is_none() {
            return Err(BackendError::NotFound {
                table: Table::Variants.name(),
                id: row.variant_id,
            });
        }

        let (stored, kind) = if row.id > 0 {
            (row.clone(), ChangeKind::Update)
        } else {
            let stored = InventoryRow {
                id: self.assign_id(),
                ..row.clone()
            };
            (stored, ChangeKind::Insert)
        };
        upsert(&mut tables.inventory, stored.clone());
        drop(tables);

        self.publish(ChangeEvent::upsert(Table::Inventory, kind, &stored));
        Ok(stored)
    }

    fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.feed.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{OrderStatus, VariantRow};
    use chrono::Utc;

    fn backend() -> MemoryBackend {
        MemoryBackend::new(RawDataset {
            product_variants: vec![VariantRow {
                id: 10,
                product_id: 1,
                sku: "SKU".into(),
                name: "one".into(),
                price_cents: 500,
            }],
            ..RawDataset::default()
        })
    }

    fn draft_order() -> OrderRow {
        OrderRow {
            id: -1,
            customer: "Ada".into(),
            status: OrderStatus::Pending,
            created_by: 3,
            assigned_to: vec![],
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn insert_assigns_ids_and_emits_events() {
        let backend = backend();
        let mut feed = backend.subscribe();
        let item = OrderItemRow {
            id: -2,
            order_id: -1,
            variant_id: 10,
            quantity: 2,
            unit_price_cents: 500,
        };

        let created = backend.insert_order(&draft_order(), &[item]).await.unwrap();
        assert_eq!(created.order.id, 11);
        assert_eq!(created.items[0].id, 12);
        assert_eq!(created.items[0].order_id, 11);

        let first = feed.recv().await.unwrap();
        assert_eq!(first.table, "orders");
        assert_eq!(first.kind, ChangeKind::Insert);
        assert_eq!(feed.recv().await.unwrap().table, "order_items");

        let all = backend.fetch_all().await.unwrap();
        assert_eq!(all.orders.len(), 1);
        assert_eq!(backend.fetch_count(), 1);
    }

    #[tokio::test]
    async fn writes_to_missing_rows_fail() {
        let backend = backend();
        assert!(matches!(
            backend.delete_order(42).await,
            Err(BackendError::NotFound { table: "orders", id: 42 })
        ));
        let bad_item = OrderItemRow {
            id: 0,
            order_id: 0,
            variant_id: 999,
            quantity: 1,
            unit_price_cents: 1,
        };
        assert!(backend.insert_order(&draft_order(), &[bad_item]).await.is_err());
        assert!(backend.fetch_all().await.unwrap().orders.is_empty());
    }

    #[tokio::test]
    async fn delete_removes_items() {
        let backend = backend();
        let item = OrderItemRow {
            id: 0,
            order_id: 0,
            variant_id: 10,
            quantity: 1,
            unit_price_cents: 500,
        };
        let created = backend.insert_order(&draft_order(), &[item]).await.unwrap();
        backend.delete_order(created.order.id).await.unwrap();
        let all = backend.fetch_all().await.unwrap();
        assert!(all.orders.is_empty());
        assert!(all.order_items.is_empty());
    }

    #[tokio::test]
    async fn external_changes_reach_tables_and_feed() {
        let backend = backend();
        let mut feed = backend.subscribe();
        backend
            .apply_external(ChangeEvent {
                table: "employees".into(),
                kind: ChangeKind::Insert,
                record: serde_json::json!({ "id": 4, "name": "Lee", "role": "staff" }),
                id: None,
            })
            .await
            .unwrap();
        backend
            .apply_external(ChangeEvent::delete(Table::Variants, 10))
            .await
            .unwrap();

        assert_eq!(feed.recv().await.unwrap().table, "employees");
        assert_eq!(feed.recv().await.unwrap().kind, ChangeKind::Delete);
        let all = backend.fetch_all().await.unwrap();
        assert_eq!(all.employees[0].role, Role::Staff);
        assert!(all.product_variants.is_empty());
    }

    #[tokio::test]
    async fn inventory_rejects_negative_quantity() {
        let backend = backend();
        let row = InventoryRow {
            id: 0,
            variant_id: 10,
            location: "front".into(),
            quantity: -1,
        };
        assert!(matches!(
            backend.upsert_inventory(&row).await,
            Err(BackendError::Rejected(_))
        ));
    }
}
