#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use stockroom::backend::{Backend, BackendError, CreatedOrder, MemoryBackend};
use stockroom::cache::{CacheSettings, RequestCache};
use stockroom::data::changes::ChangeEvent;
use stockroom::data::visibility::Actor;
use stockroom::data::{
    EmployeeRow, InventoryRow, OrderItemRow, OrderRow, OrderStatus, ProductRow, RawDataset, Role,
    RowId, VariantRow,
};
use stockroom::provider::{Provider, ProviderSettings};
use tokio::sync::broadcast;

pub const ADMIN: RowId = 1;
pub const SAM: RowId = 2;
pub const KAI: RowId = 3;

/// A small shop: two products (one hidden), three employees, two orders.
pub fn fixture() -> RawDataset {
    let created_at = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
    RawDataset {
        products: vec![
            ProductRow {
                id: 1,
                name: "Tee".into(),
                category: Some("apparel".into()),
                hidden: false,
                created_by: ADMIN,
            },
            ProductRow {
                id: 2,
                name: "Prototype".into(),
                category: None,
                hidden: true,
                created_by: ADMIN,
            },
        ],
        product_variants: vec![
            make_variant(10, 1, 1500),
            make_variant(11, 1, 1800),
            make_variant(20, 2, 9900),
        ],
        inventory: vec![
            make_inventory(100, 10, "front", 4),
            make_inventory(101, 10, "back", 6),
            make_inventory(102, 11, "front", 2),
        ],
        orders: vec![
            OrderRow {
                id: 500,
                customer: "Grace".into(),
                status: OrderStatus::Pending,
                created_by: SAM,
                assigned_to: vec![],
                created_at,
            },
            OrderRow {
                id: 501,
                customer: "Linus".into(),
                status: OrderStatus::Paid,
                created_by: ADMIN,
                assigned_to: vec![KAI],
                created_at,
            },
        ],
        order_items: vec![
            OrderItemRow {
                id: 900,
                order_id: 500,
                variant_id: 10,
                quantity: 2,
                unit_price_cents: 1500,
            },
            OrderItemRow {
                id: 901,
                order_id: 501,
                variant_id: 11,
                quantity: 1,
                unit_price_cents: 1800,
            },
        ],
        employees: vec![
            make_employee(ADMIN, "Ada", Role::Admin),
            make_employee(SAM, "Sam", Role::Staff),
            make_employee(KAI, "Kai", Role::Staff),
        ],
    }
}

pub fn make_variant(id: RowId, product_id: RowId, price_cents: i64) -> VariantRow {
    VariantRow {
        id,
        product_id,
        sku: format!("SKU-{id}"),
        name: format!("variant {id}"),
        price_cents,
    }
}

pub fn make_inventory(id: RowId, variant_id: RowId, location: &str, quantity: i64) -> InventoryRow {
    InventoryRow {
        id,
        variant_id,
        location: location.to_owned(),
        quantity,
    }
}

pub fn make_employee(id: RowId, name: &str, role: Role) -> EmployeeRow {
    EmployeeRow {
        id,
        name: name.to_owned(),
        role,
    }
}

pub fn settings() -> CacheSettings {
    CacheSettings {
        ttl: Duration::from_secs(60),
        wait_timeout: Duration::from_secs(5),
        debounce_delay: Duration::from_millis(100),
    }
}

pub fn provider(backend: Arc<dyn Backend>, cache: RequestCache<RawDataset>, actor: Actor) -> Provider {
    Provider::new(
        backend,
        cache,
        actor,
        ProviderSettings {
            refetch_delay: Duration::from_millis(200),
        },
    )
}

pub fn admin() -> Actor {
    Actor::new(ADMIN, Role::Admin)
}

/// Wraps a `MemoryBackend` with switchable failures and write latency.
pub struct FlakyBackend {
    pub inner: MemoryBackend,
    pub fail_reads: AtomicBool,
    pub fail_writes: AtomicBool,
    pub write_delay: Duration,
}

impl FlakyBackend {
    pub fn new(dataset: RawDataset) -> Self {
        Self {
            inner: MemoryBackend::new(dataset),
            fail_reads: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
            write_delay: Duration::ZERO,
        }
    }

    pub fn with_write_delay(mut self, delay: Duration) -> Self {
        self.write_delay = delay;
        self
    }

    async fn before_write(&self) -> Result<(), BackendError> {
        if !self.write_delay.is_zero() {
            tokio::time::sleep(self.write_delay).await;
        }
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(BackendError::Unavailable("write path down".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl Backend for FlakyBackend {
    async fn fetch_all(&self) -> Result<RawDataset, BackendError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(BackendError::Unavailable("read path down".into()));
        }
        self.inner.fetch_all().await
    }

    async fn insert_order(
        &self,
        order: &OrderRow,
        items: &[OrderItemRow],
    ) -> Result<CreatedOrder, BackendError> {
        self.before_write().await?;
        self.inner.insert_order(order, items).await
    }

    async fn update_order(&self, order: &OrderRow) -> Result<(), BackendError> {
        self.before_write().await?;
        self.inner.update_order(order).await
    }

    async fn delete_order(&self, id: RowId) -> Result<(), BackendError> {
        self.before_write().await?;
        self.inner.delete_order(id).await
    }

    async fn update_product(&self, product: &ProductRow) -> Result<(), BackendError> {
        self.before_write().await?;
        self.inner.update_product(product).await
    }

    async fn upsert_inventory(&self, row: &InventoryRow) -> Result<InventoryRow, BackendError> {
        self.before_write().await?;
        self.inner.upsert_inventory(row).await
    }

    fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.inner.subscribe()
    }
}
