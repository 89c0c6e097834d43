//! Role-based filtering of the raw dataset.

use super::{RawDataset, Role, RowId};
use serde::{Deserialize, Serialize};

/// The employee on whose behalf data is read and written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub employee_id: RowId,
    pub role: Role,
}

impl Actor {
    pub fn new(employee_id: RowId, role: Role) -> Self {
        Self { employee_id, role }
    }

    pub fn is_privileged(&self) -> bool {
        self.role.is_privileged()
    }
}

/// Rows of `raw` the actor may see.
///
/// Privileged roles see everything. Staff see orders they created or are
/// assigned to, products that are not hidden (or that they created), and only
/// their own employee record. Child rows of filtered parents are left in place;
/// normalization drops them as orphans.
pub fn visible_to(raw: &RawDataset, actor: &Actor) -> RawDataset {
    if actor.is_privileged() {
        return raw.clone();
    }
    let me = actor.employee_id;

    RawDataset {
        products: raw
            .products
            .iter()
            .filter(|p| !p.hidden || p.created_by == me)
            .cloned()
            .collect(),
        orders: raw
            .orders
            .iter()
            .filter(|o| o.created_by == me || o.assigned_to.contains(&me))
            .cloned()
            .collect(),
        employees: raw
            .employees
            .iter()
            .filter(|e| e.id == me)
            .cloned()
            .collect(),
        product_variants: raw.product_variants.clone(),
        inventory: raw.inventory.clone(),
        order_items: raw.order_items.clone(),
    }
}
