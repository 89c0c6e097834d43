//! Retail records as the backend returns them, and the views built from them.

pub mod changes;
pub mod normalize;
pub mod visibility;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type RowId = i64;

/// Anything stored in a table keyed by a numeric primary key.
pub trait Row {
    fn id(&self) -> RowId;
}

macro_rules! impl_row {
    ($($ty:ty),* $(,)?) => {
        $(impl Row for $ty {
            fn id(&self) -> RowId {
                self.id
            }
        })*
    };
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductRow {
    pub id: RowId,
    pub name: String,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub hidden: bool,
    pub created_by: RowId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariantRow {
    pub id: RowId,
    pub product_id: RowId,
    pub sku: String,
    pub name: String,
    pub price_cents: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InventoryRow {
    pub id: RowId,
    pub variant_id: RowId,
    pub location: String,
    pub quantity: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Paid,
    Shipped,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRow {
    pub id: RowId,
    pub customer: String,
    pub status: OrderStatus,
    pub created_by: RowId,
    #[serde(default)]
    pub assigned_to: Vec<RowId>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderItemRow {
    pub id: RowId,
    pub order_id: RowId,
    pub variant_id: RowId,
    pub quantity: i64,
    pub unit_price_cents: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Manager,
    Staff,
}

impl Role {
    pub fn is_privileged(self) -> bool {
        matches!(self, Role::Admin | Role::Manager)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmployeeRow {
    pub id: RowId,
    pub name: String,
    pub role: Role,
}

impl_row!(
    ProductRow,
    VariantRow,
    InventoryRow,
    OrderRow,
    OrderItemRow,
    EmployeeRow,
);

/// Everything the backend returns for the composite "all data" query.
///
/// This is the value cached under `ALL_DATA_KEY` and written to the mirror.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RawDataset {
    pub products: Vec<ProductRow>,
    pub product_variants: Vec<VariantRow>,
    pub inventory: Vec<InventoryRow>,
    pub orders: Vec<OrderRow>,
    pub order_items: Vec<OrderItemRow>,
    pub employees: Vec<EmployeeRow>,
}

impl RawDataset {
    pub fn order(&self, id: RowId) -> Option<&OrderRow> {
        self.orders.iter().find(|o| o.id == id)
    }

    pub fn product(&self, id: RowId) -> Option<&ProductRow> {
        self.products.iter().find(|p| p.id == id)
    }

    pub fn variant(&self, id: RowId) -> Option<&VariantRow> {
        self.product_variants.iter().find(|v| v.id == id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Variant {
    #[serde(flatten)]
    pub row: VariantRow,
    pub inventory: Vec<InventoryRow>,
    pub stock: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Product {
    #[serde(flatten)]
    pub row: ProductRow,
    pub variants: Vec<Variant>,
    pub stock: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Order {
    #[serde(flatten)]
    pub row: OrderRow,
    pub items: Vec<OrderItemRow>,
    pub total_cents: i64,
}

/// Normalized, actor-filtered view published to readers.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AppData {
    pub products: Vec<Product>,
    pub orders: Vec<Order>,
    pub employees: Vec<EmployeeRow>,
}

impl AppData {
    pub fn order(&self, id: RowId) -> Option<&Order> {
        self.orders.iter().find(|o| o.row.id == id)
    }

    pub fn product(&self, id: RowId) -> Option<&Product> {
        self.products.iter().find(|p| p.row.id == id)
    }
}
