//! Provider price list and spend against the free credit

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::usage::UsageRecord;

/// Average call price assumed before any priced call was counted
const FALLBACK_AVG_PRICE: f64 = 0.015;

/// Per-unit prices and the credit granted each period
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Pricing {
    /// Price of one unit, by operation name
    pub unit_prices: BTreeMap<String, f64>,
    /// Price of one unit of an operation missing from `unit_prices`
    pub default_unit_price: f64,
    /// Free credit per accounting period
    pub credit_per_period: f64,
}

impl Default for Pricing {
    fn default() -> Self {
        let unit_prices = [
            ("places_nearby", 0.032),
            ("place_details", 0.017),
            ("directions", 0.005),
            ("geocoding", 0.005),
            ("distance_matrix", 0.005),
            ("places_search", 0.032),
        ]
        .into_iter()
        .map(|(operation, price)| (operation.to_string(), price))
        .collect();

        Self {
            unit_prices,
            default_unit_price: 0.0,
            credit_per_period: 200.0,
        }
    }
}

impl Pricing {
    /// Price list where every call is free
    pub fn free() -> Self {
        Self {
            unit_prices: BTreeMap::new(),
            default_unit_price: 0.0,
            credit_per_period: 0.0,
        }
    }

    /// Cost of `units` of `operation`
    pub fn cost(&self, operation: &str, units: u64) -> f64 {
        let price = self
            .unit_prices
            .get(operation)
            .copied()
            .unwrap_or(self.default_unit_price);
        price * units as f64
    }

    /// Spend of `record` measured against the period credit
    pub fn spend(&self, record: &UsageRecord) -> SpendStatus {
        let total_cost = record.total_cost;
        let credit_remaining = (self.credit_per_period - total_cost).max(0.0);
        let avg_cost = if record.call_count > 0 {
            total_cost / record.call_count as f64
        } else {
            FALLBACK_AVG_PRICE
        };
        let estimated_remaining_calls = if avg_cost > 0.0 {
            (credit_remaining / avg_cost) as u64
        } else {
            0
        };

        SpendStatus {
            total_cost,
            credit: self.credit_per_period,
            credit_remaining,
            estimated_remaining_calls,
            within_credit: total_cost <= self.credit_per_period,
        }
    }
}

/// Derived view of a period's spend
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SpendStatus {
    /// Estimated cost of the period's counted calls
    pub total_cost: f64,
    /// Credit granted for the period
    pub credit: f64,
    /// Credit left, never negative
    pub credit_remaining: f64,
    /// Calls the remaining credit covers at the period's average price
    pub estimated_remaining_calls: u64,
    /// Whether the spend is still covered by the credit
    pub within_credit: bool,
}

impl SpendStatus {
    /// Warning once spend passes 75% or 90% of the credit
    pub fn warning_message(&self) -> Option<String> {
        if self.credit <= 0.0 {
            return None;
        }
        if self.total_cost > self.credit * 0.9 {
            Some("WARNING: you have used 90%+ of your free credit this period!".to_string())
        } else if self.total_cost > self.credit * 0.75 {
            Some("CAUTION: you have used 75%+ of your free credit this period.".to_string())
        } else {
            None
        }
    }
}
