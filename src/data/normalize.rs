//! Reshape flat table rows into nested records.
//!
//! Children are attached to parents by foreign key. Rows whose parent is not
//! present (deleted, or filtered out for the actor) are dropped.

use super::{AppData, InventoryRow, Order, OrderItemRow, Product, RawDataset, RowId, Variant};
use std::collections::HashMap;

fn group_by<T: Clone>(rows: &[T], key: impl Fn(&T) -> RowId) -> HashMap<RowId, Vec<T>> {
    let mut groups: HashMap<RowId, Vec<T>> = HashMap::new();
    for row in rows {
        groups.entry(key(row)).or_default().push(row.clone());
    }
    groups
}

pub fn normalize(raw: &RawDataset) -> AppData {
    let mut inventory = group_by(&raw.inventory, |i: &InventoryRow| i.variant_id);
    let mut variants_by_product: HashMap<RowId, Vec<Variant>> = HashMap::new();
    for row in &raw.product_variants {
        let mut rows = inventory.remove(&row.id).unwrap_or_default();
        rows.sort_by_key(|i| i.id);
        let stock = saturating_sum(rows.iter().map(|i| i.quantity));
        variants_by_product
            .entry(row.product_id)
            .or_default()
            .push(Variant {
                row: row.clone(),
                inventory: rows,
                stock,
            });
    }

    let mut products: Vec<Product> = raw
        .products
        .iter()
        .map(|row| {
            let mut variants = variants_by_product.remove(&row.id).unwrap_or_default();
            variants.sort_by_key(|v| v.row.id);
            let stock = saturating_sum(variants.iter().map(|v| v.stock));
            Product {
                row: row.clone(),
                variants,
                stock,
            }
        })
        .collect();
    products.sort_by_key(|p| p.row.id);

    let mut items = group_by(&raw.order_items, |i: &OrderItemRow| i.order_id);
    let mut orders: Vec<Order> = raw
        .orders
        .iter()
        .map(|row| {
            let mut items = items.remove(&row.id).unwrap_or_default();
            items.sort_by_key(|i| i.id);
            Order {
                row: row.clone(),
                total_cents: order_total(&items),
                items,
            }
        })
        .collect();
    orders.sort_by_key(|o| o.row.id);

    let mut employees = raw.employees.clone();
    employees.sort_by_key(|e| e.id);

    AppData {
        products,
        orders,
        employees,
    }
}

/// Sum of line totals. Rows come from outside, so the arithmetic saturates
/// at the `i64` bounds instead of overflowing.
pub fn order_total(items: &[OrderItemRow]) -> i64 {
    saturating_sum(
        items
            .iter()
            .map(|i| i.quantity.saturating_mul(i.unit_price_cents)),
    )
}

fn saturating_sum(values: impl Iterator<Item = i64>) -> i64 {
    values.fold(0, i64::saturating_add)
}
