//! The hosted backend seam: queries, writes, and the change feed.

pub mod memory;

pub use memory::MemoryBackend;

use crate::data::changes::ChangeEvent;
use crate::data::{InventoryRow, OrderItemRow, OrderRow, ProductRow, RawDataset, RowId};
use async_trait::async_trait;
use tokio::sync::broadcast;

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("{table} row {id} does not exist")]
    NotFound { table: &'static str, id: RowId },
    #[error("backend rejected the write: {0}")]
    Rejected(String),
    #[error("backend unavailable: {0}")]
    Unavailable(String),
}

/// An order as the backend stored it, with its assigned ids.
#[derive(Debug, Clone, PartialEq)]
pub struct CreatedOrder {
    pub order: OrderRow,
    pub items: Vec<OrderItemRow>,
}

#[async_trait]
pub trait Backend: Send + Sync {
    /// The composite query behind `ALL_DATA_KEY`.
    async fn fetch_all(&self) -> Result<RawDataset, BackendError>;

    /// Insert an order and its items. Incoming ids are ignored and reassigned.
    async fn insert_order(
        &self,
        order: &OrderRow,
        items: &[OrderItemRow],
    ) -> Result<CreatedOrder, BackendError>;

    async fn update_order(&self, order: &OrderRow) -> Result<(), BackendError>;

    /// Delete an order and its items.
    async fn delete_order(&self, id: RowId) -> Result<(), BackendError>;

    async fn update_product(&self, product: &ProductRow) -> Result<(), BackendError>;

    /// Insert or update an inventory row. A non-positive id asks for a new row.
    async fn upsert_inventory(&self, row: &InventoryRow) -> Result<InventoryRow, BackendError>;

    /// Subscribe to row-level change notifications.
    fn subscribe(&self) -> broadcast::Receiver<ChangeEvent>;
}
