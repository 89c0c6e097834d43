//! Application data provider: one actor's view of the whole dataset.
//!
//! Loads the composite dataset through the request cache, keeps the raw rows,
//! and publishes normalized, visibility-filtered snapshots on a `watch`
//! channel so readers never wait on a write. Change-feed events patch the raw
//! rows in place; writes are applied optimistically and rolled back to a
//! snapshot if the backend refuses them.

use crate::backend::{Backend, BackendError, CreatedOrder};
use crate::cache::{CacheError, Debouncer, FetchOptions, Origin, RequestCache};
use crate::data::changes::{self, ChangeEvent, Patched, upsert};
use crate::data::normalize::normalize;
use crate::data::visibility::{Actor, visible_to};
use crate::data::{
    AppData, InventoryRow, OrderItemRow, OrderRow, OrderStatus, RawDataset, RowId,
};
use crate::utils::{fmt_duration, log_if_slow};
use chrono::Utc;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Cache key for the composite "everything" query.
pub const ALL_DATA_KEY: &str = "all_data";

const SLOW_LOAD_THRESHOLD: Duration = Duration::from_secs(2);

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("failed to load data")]
    Load(#[from] CacheError),
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error("{table} row {id} is not loaded")]
    NotFound { table: &'static str, id: RowId },
    #[error("invalid request: {0}")]
    Invalid(String),
}

/// A line of a new order, before ids exist.
#[derive(Debug, Clone, PartialEq)]
pub struct NewOrderItem {
    pub variant_id: RowId,
    pub quantity: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewOrder {
    pub customer: String,
    pub assigned_to: Vec<RowId>,
    pub items: Vec<NewOrderItem>,
}

/// What a change event did to local state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOutcome {
    Patched,
    RefetchScheduled,
    Ignored,
}

#[derive(Debug, Clone, Copy)]
pub struct ProviderSettings {
    /// Quiet period before a full refetch triggered by unpatched tables.
    pub refetch_delay: Duration,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            refetch_delay: Duration::from_millis(500),
        }
    }
}

/// Shared provider. Clone-cheap (all `Arc`-wrapped internals).
#[derive(Clone)]
pub struct Provider {
    backend: Arc<dyn Backend>,
    cache: RequestCache<RawDataset>,
    actor: Actor,
    settings: ProviderSettings,
    /// Raw rows; mutations and change patches are serialized on this lock.
    raw: Arc<Mutex<RawDataset>>,
    tx: Arc<watch::Sender<Arc<AppData>>>,
    rx: watch::Receiver<Arc<AppData>>,
    refetch: Debouncer,
    /// Temporary ids for optimistic inserts count down from -1.
    next_temp_id: Arc<AtomicI64>,
    /// Change patches applied so far, and how many the last load accounted for.
    /// While they differ the cached composite is older than `raw`.
    patches: Arc<AtomicU64>,
    loaded_patches: Arc<AtomicU64>,
    shutdown: CancellationToken,
}

impl Provider {
    pub fn new(
        backend: Arc<dyn Backend>,
        cache: RequestCache<RawDataset>,
        actor: Actor,
        settings: ProviderSettings,
    ) -> Self {
        let (tx, rx) = watch::channel(Arc::new(AppData::default()));
        Self {
            backend,
            cache,
            actor,
            settings,
            raw: Arc::new(Mutex::new(RawDataset::default())),
            tx: Arc::new(tx),
            rx,
            refetch: Debouncer::new(),
            next_temp_id: Arc::new(AtomicI64::new(-1)),
            patches: Arc::new(AtomicU64::new(0)),
            loaded_patches: Arc::new(AtomicU64::new(0)),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn actor(&self) -> Actor {
        self.actor
    }

    pub fn cache(&self) -> &RequestCache<RawDataset> {
        &self.cache
    }

    /// Current view. Never blocks.
    pub fn snapshot(&self) -> Arc<AppData> {
        self.rx.borrow().clone()
    }

    /// Receiver that is notified on every published view.
    pub fn subscribe(&self) -> watch::Receiver<Arc<AppData>> {
        self.tx.subscribe()
    }

    /// Load the full dataset through the cache and publish it.
    ///
    /// Bypasses the cache while local patches are newer than the cached
    /// composite, so a load never reverts them.
    pub async fn load(&self, force: bool) -> Result<(), ProviderError> {
        let start = Instant::now();
        let seen = self.patches.load(Ordering::SeqCst);
        let patched_since = seen != self.loaded_patches.load(Ordering::SeqCst);
        if patched_since && !force {
            debug!("local patches are newer than the cache, forcing fetch");
        }
        let force = force || patched_since;
        let backend = self.backend.clone();
        let fetched = self
            .cache
            .fetch(
                ALL_DATA_KEY,
                move || async move { backend.fetch_all().await },
                FetchOptions { force },
            )
            .await?;

        let mut raw = self.raw.lock().await;
        *raw = RawDataset::clone(&fetched.value);
        self.loaded_patches.store(seen, Ordering::SeqCst);
        self.publish(&raw);
        drop(raw);

        log_if_slow(start, SLOW_LOAD_THRESHOLD, "provider load");
        if matches!(fetched.origin, Origin::Producer | Origin::Joined) {
            info!(
                origin = ?fetched.origin,
                elapsed = fmt_duration(start.elapsed()),
                "data loaded"
            );
        } else {
            debug!(origin = ?fetched.origin, "data loaded from cache");
        }
        Ok(())
    }

    fn publish(&self, raw: &RawDataset) {
        let view = normalize(&visible_to(raw, &self.actor));
        self.tx.send_replace(Arc::new(view));
    }

    /// Apply one change-feed event to local state.
    pub async fn apply_change(&self, event: &ChangeEvent) -> ChangeOutcome {
        let mut raw = self.raw.lock().await;
        match changes::apply(&mut raw, event) {
            Ok(Patched::Applied(table)) => {
                self.patches.fetch_add(1, Ordering::SeqCst);
                self.publish(&raw);
                drop(raw);
                // The cached composite no longer matches; let bursts settle first.
                self.cache.debounced_invalidate_default(ALL_DATA_KEY);
                debug!(table = table.name(), kind = ?event.kind, "change patched");
                ChangeOutcome::Patched
            }
            Ok(Patched::Unhandled) => {
                drop(raw);
                self.schedule_refetch();
                debug!(table = %event.table, "change on unpatched table, refetch scheduled");
                ChangeOutcome::RefetchScheduled
            }
            Err(e) => {
                warn!(table = %event.table, error = %e, "ignoring malformed change event");
                ChangeOutcome::Ignored
            }
        }
    }

    fn schedule_refetch(&self) {
        let provider = self.clone();
        self.refetch
            .schedule(ALL_DATA_KEY, self.settings.refetch_delay, move || {
                tokio::spawn(async move { provider.refetch().await });
            });
    }

    async fn refetch(&self) {
        self.cache.invalidate(ALL_DATA_KEY);
        if let Err(e) = self.load(true).await {
            warn!(error = %e, "debounced refetch failed");
        }
    }

    /// Run a pending debounced refetch now. Returns whether one was pending.
    pub async fn flush_refetch(&self) -> bool {
        if !self.refetch.cancel(ALL_DATA_KEY) {
            return false;
        }
        self.refetch().await;
        true
    }

    /// Apply events from a feed until it closes or the provider shuts down.
    pub fn spawn_change_listener(
        &self,
        mut feed: broadcast::Receiver<ChangeEvent>,
    ) -> JoinHandle<()> {
        let provider = self.clone();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = provider.shutdown.cancelled() => break,
                    received = feed.recv() => received,
                };
                match event {
                    Ok(event) => {
                        provider.apply_change(&event).await;
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        // Missed events cannot be patched; start over from the backend.
                        warn!(skipped, "change feed lagged, scheduling refetch");
                        provider.schedule_refetch();
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        debug!("change feed closed");
                        break;
                    }
                }
            }
        })
    }

    /// Optimistic write: mutate and publish, then commit to the backend.
    ///
    /// `apply` edits the raw rows and returns what `commit` sends. On failure
    /// the rows are restored to the snapshot taken before `apply`. On success
    /// `settle` reconciles local rows with what the backend returned and the
    /// cached composite is invalidated.
    async fn mutate<P, T, M, C, Fut, S>(
        &self,
        action: &'static str,
        apply: M,
        commit: C,
        settle: S,
    ) -> Result<T, ProviderError>
    where
        M: FnOnce(&mut RawDataset) -> Result<P, ProviderError>,
        C: FnOnce(P) -> Fut,
        Fut: Future<Output = Result<T, BackendError>>,
        S: FnOnce(&mut RawDataset, &T),
    {
        let mut raw = self.raw.lock().await;
        let snapshot = raw.clone();
        let payload = match apply(&mut raw) {
            Ok(payload) => payload,
            Err(e) => {
                *raw = snapshot;
                return Err(e);
            }
        };
        self.publish(&raw);

        match commit(payload).await {
            Ok(committed) => {
                settle(&mut raw, &committed);
                self.publish(&raw);
                drop(raw);
                self.cache.invalidate(ALL_DATA_KEY);
                debug!(action, "write committed");
                Ok(committed)
            }
            Err(e) => {
                *raw = snapshot;
                self.publish(&raw);
                warn!(action, error = %e, "write failed, local state rolled back");
                Err(e.into())
            }
        }
    }

    fn temp_id(&self) -> RowId {
        self.next_temp_id.fetch_sub(1, Ordering::Relaxed)
    }

    pub async fn create_order(&self, new: NewOrder) -> Result<CreatedOrder, ProviderError> {
        if new.items.is_empty() {
            return Err(ProviderError::Invalid("an order needs at least one item".into()));
        }
        if let Some(bad) = new.items.iter().find(|i| i.quantity <= 0) {
            return Err(ProviderError::Invalid(format!(
                "quantity for variant {} must be positive",
                bad.variant_id
            )));
        }

        let order = OrderRow {
            id: self.temp_id(),
            customer: new.customer,
            status: OrderStatus::Pending,
            created_by: self.actor.employee_id,
            assigned_to: new.assigned_to,
            created_at: Utc::now(),
        };
        let temp_order_id = order.id;
        let lines = new.items;
        let backend = self.backend.clone();

        self.mutate(
            "create_order",
            |raw| {
                let mut items = Vec::with_capacity(lines.len());
                for line in &lines {
                    let variant = raw.variant(line.variant_id).ok_or(ProviderError::NotFound {
                        table: "product_variants",
                        id: line.variant_id,
                    })?;
                    items.push(OrderItemRow {
                        id: self.temp_id(),
                        order_id: temp_order_id,
                        variant_id: line.variant_id,
                        quantity: line.quantity,
                        unit_price_cents: variant.price_cents,
                    });
                }
                raw.orders.push(order.clone());
                raw.order_items.extend(items.iter().cloned());
                Ok((order, items))
            },
            |(order, items)| async move { backend.insert_order(&order, &items).await },
            |raw, created: &CreatedOrder| {
                raw.orders.retain(|o| o.id != temp_order_id);
                raw.order_items.retain(|i| i.order_id != temp_order_id);
                upsert(&mut raw.orders, created.order.clone());
                for item in &created.items {
                    upsert(&mut raw.order_items, item.clone());
                }
            },
        )
        .await
    }

    pub async fn update_order_status(
        &self,
        id: RowId,
        status: OrderStatus,
    ) -> Result<(), ProviderError> {
        let backend = self.backend.clone();
        self.mutate(
            "update_order_status",
            |raw| {
                let order = raw
                    .orders
                    .iter_mut()
                    .find(|o| o.id == id)
                    .ok_or(ProviderError::NotFound { table: "orders", id })?;
                order.status = status;
                Ok(order.clone())
            },
            |order| async move { backend.update_order(&order).await },
            |_, _| {},
        )
        .await
    }

    pub async fn delete_order(&self, id: RowId) -> Result<(), ProviderError> {
        let backend = self.backend.clone();
        self.mutate(
            "delete_order",
            |raw| {
                if raw.order(id).is_none() {
                    return Err(ProviderError::NotFound { table: "orders", id });
                }
                raw.orders.retain(|o| o.id != id);
                raw.order_items.retain(|i| i.order_id != id);
                Ok(())
            },
            |()| async move { backend.delete_order(id).await },
            |_, _| {},
        )
        .await
    }

    pub async fn set_product_visibility(
        &self,
        id: RowId,
        visible: bool,
    ) -> Result<(), ProviderError> {
        let backend = self.backend.clone();
        self.mutate(
            "set_product_visibility",
            |raw| {
                let product = raw
                    .products
                    .iter_mut()
                    .find(|p| p.id == id)
                    .ok_or(ProviderError::NotFound {
                        table: "products",
                        id,
                    })?;
                product.hidden = !visible;
                Ok(product.clone())
            },
            |product| async move { backend.update_product(&product).await },
            |_, _| {},
        )
        .await
    }

    /// Set the stock of a variant at a location, creating the row if needed.
    pub async fn set_inventory_quantity(
        &self,
        variant_id: RowId,
        location: &str,
        quantity: i64,
    ) -> Result<InventoryRow, ProviderError> {
        if quantity < 0 {
            return Err(ProviderError::Invalid(format!(
                "quantity must not be negative (got {quantity})"
            )));
        }
        let backend = self.backend.clone();
        self.mutate(
            "set_inventory_quantity",
            |raw| {
                if raw.variant(variant_id).is_none() {
                    return Err(ProviderError::NotFound {
                        table: "product_variants",
                        id: variant_id,
                    });
                }
                let existing = raw
                    .inventory
                    .iter_mut()
                    .find(|i| i.variant_id == variant_id && i.location == location);
                let row = match existing {
                    Some(row) => {
                        row.quantity = quantity;
                        row.clone()
                    }
                    None => {
                        let row = InventoryRow {
                            id: self.temp_id(),
                            variant_id,
                            location: location.to_owned(),
                            quantity,
                        };
                        raw.inventory.push(row.clone());
                        row
                    }
                };
                Ok(row)
            },
            |row| async move { backend.upsert_inventory(&row).await },
            |raw, stored: &InventoryRow| {
                raw.inventory.retain(|i| {
                    !(i.variant_id == stored.variant_id && i.location == stored.location)
                });
                raw.inventory.push(stored.clone());
            },
        )
        .await
    }

    /// Stop the change listener, drop pending refetches, and shut the cache down.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.refetch.cancel_all();
        self.cache.shutdown().await;
        info!("provider shut down");
    }
}
