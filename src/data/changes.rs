//! Row-level change notifications and in-place patching of the raw dataset.

use super::{RawDataset, Row, RowId};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// One notification from the change feed.
///
/// Inserts and updates carry the full new row in `record`; deletes carry at
/// least the primary key, either in `id` or inside `record`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub table: String,
    pub kind: ChangeKind,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub record: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<RowId>,
}

impl ChangeEvent {
    pub fn upsert<R: Serialize + Row>(table: Table, kind: ChangeKind, row: &R) -> Self {
        Self {
            table: table.name().to_owned(),
            kind,
            record: serde_json::to_value(row).unwrap_or_default(),
            id: Some(row.id()),
        }
    }

    pub fn delete(table: Table, id: RowId) -> Self {
        Self {
            table: table.name().to_owned(),
            kind: ChangeKind::Delete,
            record: serde_json::Value::Null,
            id: Some(id),
        }
    }

    fn target_id(&self) -> Option<RowId> {
        self.id
            .or_else(|| self.record.get("id").and_then(serde_json::Value::as_i64))
    }
}

/// Tables patched in place. Anything else needs a full refetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Table {
    Products,
    Variants,
    Inventory,
    Orders,
    OrderItems,
}

impl Table {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "products" => Some(Table::Products),
            "product_variants" => Some(Table::Variants),
            "inventory" => Some(Table::Inventory),
            "orders" => Some(Table::Orders),
            "order_items" => Some(Table::OrderItems),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Table::Products => "products",
            Table::Variants => "product_variants",
            Table::Inventory => "inventory",
            Table::Orders => "orders",
            Table::OrderItems => "order_items",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PatchError {
    #[error("`{table}` {kind:?} event has no usable record")]
    MalformedRecord {
        table: &'static str,
        kind: ChangeKind,
        #[source]
        source: serde_json::Error,
    },
    #[error("`{table}` delete event carries no id")]
    MissingId { table: &'static str },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Patched {
    /// The dataset was updated (or already reflected the event).
    Applied(Table),
    /// The table is not patched locally; the caller should refetch.
    Unhandled,
}

/// Apply `event` to `raw` by primary key.
pub fn apply(raw: &mut RawDataset, event: &ChangeEvent) -> Result<Patched, PatchError> {
    let Some(table) = Table::parse(&event.table) else {
        return Ok(Patched::Unhandled);
    };
    match table {
        Table::Products => patch_rows(&mut raw.products, table, event)?,
        Table::Variants => patch_rows(&mut raw.product_variants, table, event)?,
        Table::Inventory => patch_rows(&mut raw.inventory, table, event)?,
        Table::Orders => patch_rows(&mut raw.orders, table, event)?,
        Table::OrderItems => patch_rows(&mut raw.order_items, table, event)?,
    }
    Ok(Patched::Applied(table))
}

fn patch_rows<R>(rows: &mut Vec<R>, table: Table, event: &ChangeEvent) -> Result<(), PatchError>
where
    R: Row + DeserializeOwned,
{
    match event.kind {
        ChangeKind::Insert | ChangeKind::Update => {
            let row: R = serde_json::from_value(event.record.clone()).map_err(|source| {
                PatchError::MalformedRecord {
                    table: table.name(),
                    kind: event.kind,
                    source,
                }
            })?;
            upsert(rows, row);
        }
        ChangeKind::Delete => {
            let id = event.target_id().ok_or(PatchError::MissingId {
                table: table.name(),
            })?;
            rows.retain(|r| r.id() != id);
        }
    }
    Ok(())
}

/// Replace the row with the same id, or append it.
pub fn upsert<R: Row>(rows: &mut Vec<R>, row: R) {
    match rows.iter_mut().find(|r| r.id() == row.id()) {
        Some(existing) => *existing = row,
        None => rows.push(row),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{InventoryRow, OrderStatus};
    use serde_json::json;

    fn with_inventory() -> RawDataset {
        RawDataset {
            inventory: vec![InventoryRow {
                id: 1,
                variant_id: 10,
                location: "front".into(),
                quantity: 3,
            }],
            ..RawDataset::default()
        }
    }

    #[test]
    fn update_replaces_by_id() {
        let mut raw = with_inventory();
        let event: ChangeEvent = serde_json::from_value(json!({
            "table": "inventory",
            "kind": "update",
            "record": {"id": 1, "variant_id": 10, "location": "front", "quantity": 9}
        }))
        .unwrap();
        assert_eq!(
            apply(&mut raw, &event).unwrap(),
            Patched::Applied(Table::Inventory)
        );
        assert_eq!(raw.inventory.len(), 1);
        assert_eq!(raw.inventory[0].quantity, 9);
    }

    #[test]
    fn insert_appends_and_is_idempotent() {
        let mut raw = with_inventory();
        let row = InventoryRow {
            id: 2,
            variant_id: 10,
            location: "back".into(),
            quantity: 1,
        };
        let event = ChangeEvent::upsert(Table::Inventory, ChangeKind::Insert, &row);
        apply(&mut raw, &event).unwrap();
        apply(&mut raw, &event).unwrap();
        assert_eq!(raw.inventory.len(), 2);
    }

    #[test]
    fn delete_by_id_or_record() {
        let mut raw = with_inventory();
        apply(&mut raw, &ChangeEvent::delete(Table::Inventory, 1)).unwrap();
        assert!(raw.inventory.is_empty());

        let mut raw = with_inventory();
        let event: ChangeEvent = serde_json::from_value(json!({
            "table": "inventory", "kind": "delete", "record": {"id": 1}
        }))
        .unwrap();
        apply(&mut raw, &event).unwrap();
        assert!(raw.inventory.is_empty());

        // Deleting something already gone is fine.
        apply(&mut raw, &ChangeEvent::delete(Table::Inventory, 1)).unwrap();
    }

    #[test]
    fn unknown_table_is_unhandled() {
        let mut raw = with_inventory();
        let event: ChangeEvent = serde_json::from_value(json!({
            "table": "profit_shares", "kind": "insert", "record": {"id": 4}
        }))
        .unwrap();
        assert_eq!(apply(&mut raw, &event).unwrap(), Patched::Unhandled);
        assert_eq!(raw, with_inventory());
    }

    #[test]
    fn malformed_events_are_rejected() {
        let mut raw = with_inventory();
        let bad_record: ChangeEvent = serde_json::from_value(json!({
            "table": "orders", "kind": "update", "record": {"id": 1, "status": "lost"}
        }))
        .unwrap();
        assert!(matches!(
            apply(&mut raw, &bad_record),
            Err(PatchError::MalformedRecord { table: "orders", .. })
        ));

        let no_id: ChangeEvent =
            serde_json::from_value(json!({"table": "orders", "kind": "delete"})).unwrap();
        assert!(matches!(
            apply(&mut raw, &no_id),
            Err(PatchError::MissingId { table: "orders" })
        ));
        assert_eq!(raw, with_inventory());
    }

    #[test]
    fn order_status_wire_names() {
        assert_eq!(
            serde_json::to_value(OrderStatus::Shipped).unwrap(),
            json!("shipped")
        );
    }
}
