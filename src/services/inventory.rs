//! Inventory mutation engine.
//!
//! Purchase and sale lines are folded into one delta per item, then every
//! item is adjusted concurrently under the caller's transaction. Lost updates
//! surface as `Conflict` so the enclosing scope can retry.

use chrono::Utc;
use futures::future::join_all;
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::{json, Map, Value};
use tracing::{debug, error, instrument, warn};

use crate::db::TransactionHandle;
use crate::errors::ServiceError;
use crate::models::{
    add_amounts, subtract_amounts, to_decimal, Axis, Item, Measurements, PurchaseLine, SaleLine,
};
use crate::repositories::SharedRepository;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupOutcome {
    Success,
    Skipped,
    Error,
}

/// What happened to one item.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InventoryResult {
    pub item_id: Option<String>,
    pub outcome: GroupOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub axis: Option<Axis>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl InventoryResult {
    fn skipped(item_id: Option<String>, message: impl Into<String>) -> Self {
        Self {
            item_id,
            outcome: GroupOutcome::Skipped,
            axis: None,
            previous: None,
            current: None,
            message: Some(message.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Add,
    Remove,
}

/// Per-item sums over every line referencing the item.
#[derive(Debug, Clone, PartialEq)]
struct LineGroup {
    item_id: String,
    totals: Measurements,
    total_cost: Decimal,
    max_cost_per_unit: Decimal,
}

impl LineGroup {
    fn new(item_id: String) -> Self {
        Self {
            item_id,
            totals: Measurements::default(),
            total_cost: Decimal::ZERO,
            max_cost_per_unit: Decimal::ZERO,
        }
    }

    fn add_measurements(&mut self, line: &Measurements) {
        self.totals.quantity = add_amounts(self.totals.quantity, line.quantity);
        self.totals.weight = add_amounts(self.totals.weight, line.weight);
        self.totals.length = add_amounts(self.totals.length, line.length);
        self.totals.area = add_amounts(self.totals.area, line.area);
        self.totals.volume = add_amounts(self.totals.volume, line.volume);
    }
}

/// Groups by item id in order of first appearance. Lines without an item
/// come back separately so they can be reported as skipped.
fn group_lines<'a, I>(lines: I) -> (Vec<LineGroup>, usize)
where
    I: IntoIterator<Item = (Option<&'a String>, &'a Measurements, Decimal, Decimal)>,
{
    let mut groups: Vec<LineGroup> = Vec::new();
    let mut unreferenced = 0;
    for (item, measurements, cost_per_unit, total_cost) in lines {
        let Some(item_id) = item.filter(|id| !id.trim().is_empty()) else {
            unreferenced += 1;
            continue;
        };
        let index = match groups.iter().position(|g| &g.item_id == item_id) {
            Some(index) => index,
            None => {
                groups.push(LineGroup::new(item_id.clone()));
                groups.len() - 1
            }
        };
        let group = &mut groups[index];
        group.add_measurements(measurements);
        group.total_cost += total_cost;
        group.max_cost_per_unit = group.max_cost_per_unit.max(cost_per_unit);
    }
    (groups, unreferenced)
}

fn purchase_groups(lines: &[PurchaseLine]) -> (Vec<LineGroup>, usize) {
    group_lines(
        lines
            .iter()
            .filter(|line| !line.is_asset())
            .map(|line| (line.item.as_ref(), &line.measurements, line.cost_per_unit, line.total_cost)),
    )
}

fn sale_groups(lines: &[SaleLine]) -> (Vec<LineGroup>, usize) {
    group_lines(
        lines
            .iter()
            .map(|line| (line.item.as_ref(), &line.measurements, Decimal::ZERO, Decimal::ZERO)),
    )
}

/// New cost when a purchase is applied: the highest unit cost on the lines,
/// else the average cost over the received amount.
fn refreshed_cost(group: &LineGroup, amount: f64) -> Option<Decimal> {
    if group.max_cost_per_unit > Decimal::ZERO {
        return Some(group.max_cost_per_unit);
    }
    let amount = to_decimal(amount);
    if group.total_cost > Decimal::ZERO && amount > Decimal::ZERO {
        return group.total_cost.checked_div(amount);
    }
    None
}

#[derive(Clone)]
pub struct InventoryService {
    items: SharedRepository<Item>,
}

impl std::fmt::Debug for InventoryService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InventoryService").finish_non_exhaustive()
    }
}

impl InventoryService {
    pub fn new(items: SharedRepository<Item>) -> Self {
        Self { items }
    }

    /// Adds received goods to stock and refreshes cost and price.
    #[instrument(skip(self, lines, txn), fields(lines = lines.len()))]
    pub async fn apply_purchase(
        &self,
        lines: &[PurchaseLine],
        txn: &TransactionHandle,
    ) -> Result<Vec<InventoryResult>, ServiceError> {
        let (groups, unreferenced) = purchase_groups(lines);
        self.run(groups, unreferenced, Direction::Add, true, false, txn).await
    }

    /// Removes previously received goods. Cost and price stay as they are.
    #[instrument(skip(self, lines, txn), fields(lines = lines.len()))]
    pub async fn revert_purchase(
        &self,
        lines: &[PurchaseLine],
        txn: &TransactionHandle,
    ) -> Result<Vec<InventoryResult>, ServiceError> {
        let (groups, unreferenced) = purchase_groups(lines);
        self.run(groups, unreferenced, Direction::Remove, false, false, txn).await
    }

    /// Reverts the old lines, then applies the new ones. Pricing comes from
    /// the new lines only.
    pub async fn update_purchase(
        &self,
        old_lines: &[PurchaseLine],
        new_lines: &[PurchaseLine],
        txn: &TransactionHandle,
    ) -> Result<Vec<InventoryResult>, ServiceError> {
        let mut results = self.revert_purchase(old_lines, txn).await?;
        results.extend(self.apply_purchase(new_lines, txn).await?);
        Ok(results)
    }

    /// Takes sold goods out of stock, never below zero.
    #[instrument(skip(self, lines, txn), fields(lines = lines.len()))]
    pub async fn apply_sale(
        &self,
        lines: &[SaleLine],
        txn: &TransactionHandle,
    ) -> Result<Vec<InventoryResult>, ServiceError> {
        let (groups, unreferenced) = sale_groups(lines);
        self.run(groups, unreferenced, Direction::Remove, false, true, txn).await
    }

    /// Puts sold goods back into stock.
    #[instrument(skip(self, lines, txn), fields(lines = lines.len()))]
    pub async fn revert_sale(
        &self,
        lines: &[SaleLine],
        txn: &TransactionHandle,
    ) -> Result<Vec<InventoryResult>, ServiceError> {
        let (groups, unreferenced) = sale_groups(lines);
        self.run(groups, unreferenced, Direction::Add, false, true, txn).await
    }

    async fn run(
        &self,
        groups: Vec<LineGroup>,
        unreferenced: usize,
        direction: Direction,
        refresh_pricing: bool,
        sale: bool,
        txn: &TransactionHandle,
    ) -> Result<Vec<InventoryResult>, ServiceError> {
        let mut results: Vec<InventoryResult> = (0..unreferenced)
            .map(|_| {
                warn!("Line without an item reference skipped");
                InventoryResult::skipped(None, "line has no item reference")
            })
            .collect();

        let adjusted = join_all(
            groups
                .iter()
                .map(|group| self.adjust(group, direction, refresh_pricing, sale, txn)),
        )
        .await;
        for result in adjusted {
            results.push(result?);
        }
        Ok(results)
    }

    async fn adjust(
        &self,
        group: &LineGroup,
        direction: Direction,
        refresh_pricing: bool,
        sale: bool,
        txn: &TransactionHandle,
    ) -> Result<InventoryResult, ServiceError> {
        let Some(item) = self.items.find_by_id_in(&group.item_id, Some(txn)).await? else {
            warn!(item_id = %group.item_id, "Referenced item not found; skipping");
            return Ok(InventoryResult::skipped(
                Some(group.item_id.clone()),
                "item not found",
            ));
        };

        let mut axis = item.axis();
        // A sale line without weight draws a weight-tracked item down by count.
        if sale && axis == Axis::Weight && group.totals.weight <= 0.0 {
            axis = Axis::Quantity;
        }
        let delta = group.totals.get(axis);
        let previous = item.measurements.get(axis);
        let current = match direction {
            Direction::Add => add_amounts(previous, delta),
            Direction::Remove => subtract_amounts(previous, delta).max(0.0),
        };

        let mut patch = Map::new();
        patch.insert(axis.field().to_string(), json!(current));
        patch.insert("lastUpdated".into(), serde_json::to_value(Utc::now())?);
        if refresh_pricing {
            if let Some(cost) = refreshed_cost(group, delta) {
                patch.insert("cost".into(), serde_json::to_value(cost)?);
                patch.insert("price".into(), serde_json::to_value(cost)?);
            }
        }

        match self.items.update(&group.item_id, Value::Object(patch), Some(txn)).await {
            Ok(_) => {
                debug!(item_id = %group.item_id, axis = %axis, previous, current, "Inventory adjusted");
                Ok(InventoryResult {
                    item_id: Some(group.item_id.clone()),
                    outcome: GroupOutcome::Success,
                    axis: Some(axis),
                    previous: Some(previous),
                    current: Some(current),
                    message: None,
                })
            }
            Err(err) if err.is_validation() => {
                error!(item_id = %group.item_id, error = %err, "Stored item rejected the adjustment");
                Ok(InventoryResult {
                    item_id: Some(group.item_id.clone()),
                    outcome: GroupOutcome::Error,
                    axis: Some(axis),
                    previous: Some(previous),
                    current: None,
                    message: Some(err.to_string()),
                })
            }
            Err(err) => Err(err),
        }
    }
}
