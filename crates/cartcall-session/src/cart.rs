//! Cart state derived from applied tool calls
//!
//! `CartState` is a pure function of the seq-ordered list of applied calls.
//! `apply` is the single step of that fold, so folding incrementally and
//! folding from scratch always agree.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::events::ToolArgs;

/// One product line in the cart
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CartLine {
    pub quantity: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

/// Record of a placed order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderConfirmation {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customer_name: Option<String>,
    /// Human-readable description of what was ordered
    pub summary: String,
    /// Seq of the `place_order` call
    pub seq: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CartState {
    /// Product-line id -> line, ordered by id
    pub lines: BTreeMap<String, CartLine>,
    pub order_confirmed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order: Option<OrderConfirmation>,
}

impl CartState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold applied calls from an empty cart
    pub fn fold<'a, I>(calls: I) -> Self
    where
        I: IntoIterator<Item = (u64, &'a ToolArgs)>,
    {
        Self::default().fold_onto(calls)
    }

    /// Fold applied calls onto this cart in seq order
    pub fn fold_onto<'a, I>(mut self, calls: I) -> Self
    where
        I: IntoIterator<Item = (u64, &'a ToolArgs)>,
    {
        let mut calls: Vec<(u64, &ToolArgs)> = calls.into_iter().collect();
        calls.sort_by_key(|(seq, _)| *seq);
        for (seq, args) in calls {
            self.apply(args, seq);
        }
        self
    }

    /// Apply the effect of one applied call. Returns whether the cart changed.
    pub fn apply(&mut self, args: &ToolArgs, seq: u64) -> bool {
        match args {
            ToolArgs::SearchProducts(_) => false,
            ToolArgs::AddToCart(add) => {
                let line = self
                    .lines
                    .entry(add.item.clone())
                    .or_insert_with(|| CartLine {
                        quantity: 0,
                        variant: None,
                    });
                line.quantity = line.quantity.saturating_add(add.quantity);
                if add.variant.is_some() {
                    line.variant = add.variant.clone();
                }
                add.quantity > 0
            }
            ToolArgs::UpdateCartItem(update) => {
                if update.quantity == 0 {
                    return self.lines.remove(&update.item).is_some();
                }
                let line = CartLine {
                    quantity: update.quantity,
                    variant: update.variant.clone().or_else(|| {
                        self.lines
                            .get(&update.item)
                            .and_then(|existing| existing.variant.clone())
                    }),
                };
                self.lines.insert(update.item.clone(), line.clone()) != Some(line)
            }
            ToolArgs::RemoveFromCart(remove) => self.lines.remove(&remove.item).is_some(),
            ToolArgs::PlaceOrder(order) => {
                let confirmation = OrderConfirmation {
                    order_id: order.order_id.clone(),
                    customer_name: order.customer_name.clone(),
                    summary: self.order_summary(order.customer_name.as_deref()),
                    seq,
                };
                let changed = !self.order_confirmed || self.order.as_ref() != Some(&confirmation);
                self.order_confirmed = true;
                self.order = Some(confirmation);
                changed
            }
        }
    }

    /// Short description of the cart lines, e.g. `1x hoodie-black-M, 2x mug (blue)`
    pub fn summary(&self) -> String {
        if self.lines.is_empty() {
            return "empty cart".to_string();
        }
        self.lines
            .iter()
            .map(|(item, line)| match &line.variant {
                Some(variant) => format!("{}x {} ({})", line.quantity, item, variant),
                None => format!("{}x {}", line.quantity, item),
            })
            .collect::<Vec<_>>()
            .join(", ")
    }

    fn order_summary(&self, customer: Option<&str>) -> String {
        let mut summary = self.summary();
        if let Some(name) = customer {
            summary.push_str(" for ");
            summary.push_str(name);
        }
        summary
    }

    /// Quantity of `item`, zero if absent
    pub fn quantity(&self, item: &str) -> u32 {
        self.lines.get(item).map(|l| l.quantity).unwrap_or(0)
    }

    /// Total number of units across all lines
    pub fn item_count(&self) -> u64 {
        self.lines.values().map(|l| l.quantity as u64).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}
