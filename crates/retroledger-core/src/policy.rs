use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use rust_decimal::Decimal;
use thiserror::Error;

/// Fixed catalog of adjustment categories.
///
/// Categories fall into two families: profit-reducing categories lower the
/// monthly profit figure and never touch the cash ledger (the deduction would
/// otherwise show up in period profit-and-loss twice), while capital-reducing
/// categories lower a company's capital balance and post a cash ledger row
/// dated at the target month so period reports reconcile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AdjustmentCategory {
    SalaryShortfallVsProfit,
    OperationalShortfallVsProfit,
    CapitalShortfall,
    GlobalOperational,
}

pub const ALL_CATEGORIES: [AdjustmentCategory; 4] = [
    AdjustmentCategory::SalaryShortfallVsProfit,
    AdjustmentCategory::OperationalShortfallVsProfit,
    AdjustmentCategory::CapitalShortfall,
    AdjustmentCategory::GlobalOperational,
];

impl AdjustmentCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            AdjustmentCategory::SalaryShortfallVsProfit => "Salary Shortfall vs Profit",
            AdjustmentCategory::OperationalShortfallVsProfit => "Operational Shortfall vs Profit",
            AdjustmentCategory::CapitalShortfall => "Capital Shortfall",
            AdjustmentCategory::GlobalOperational => "Global Operational",
        }
    }
}

impl fmt::Display for AdjustmentCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown adjustment category: {0}")]
pub struct UnknownCategory(pub String);

impl FromStr for AdjustmentCategory {
    type Err = UnknownCategory;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ALL_CATEGORIES
            .iter()
            .find(|c| c.as_str() == s)
            .copied()
            .ok_or_else(|| UnknownCategory(s.to_string()))
    }
}

/// How much of the request nominal hits the capital balance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapitalMagnitude {
    /// The full nominal.
    Full,
    /// The netted amount. The netting ratio defaults to 1, so this path
    /// currently computes the same value as `Full`; both paths are kept
    /// distinct and configurable.
    Partial,
}

/// Which stores a category touches, and how.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EffectProfile {
    pub affects_capital: bool,
    pub affects_profit: bool,
    pub affects_cash_ledger: bool,
    pub capital_magnitude: CapitalMagnitude,
    /// Pre-vetted categories skip manual review: the request is created
    /// directly in the approved state and posted in the same unit of work.
    pub auto_approve: bool,
}

fn default_profile(category: AdjustmentCategory) -> EffectProfile {
    match category {
        AdjustmentCategory::SalaryShortfallVsProfit
        | AdjustmentCategory::OperationalShortfallVsProfit => EffectProfile {
            affects_capital: false,
            affects_profit: true,
            affects_cash_ledger: false,
            capital_magnitude: CapitalMagnitude::Full,
            auto_approve: true,
        },
        AdjustmentCategory::CapitalShortfall => EffectProfile {
            affects_capital: true,
            affects_profit: false,
            affects_cash_ledger: true,
            capital_magnitude: CapitalMagnitude::Partial,
            auto_approve: false,
        },
        AdjustmentCategory::GlobalOperational => EffectProfile {
            affects_capital: true,
            affects_profit: false,
            affects_cash_ledger: true,
            capital_magnitude: CapitalMagnitude::Full,
            auto_approve: false,
        },
    }
}

/// Category-to-effect lookup. Deterministic, no side effects; adding or
/// re-vetting a category is a data change here, not a branch in the engine.
#[derive(Debug, Clone)]
pub struct CategoryPolicy {
    overrides: HashMap<AdjustmentCategory, EffectProfile>,
    partial_ratio: Decimal,
}

impl Default for CategoryPolicy {
    fn default() -> Self {
        Self {
            overrides: HashMap::new(),
            partial_ratio: Decimal::ONE,
        }
    }
}

impl CategoryPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_profile(mut self, category: AdjustmentCategory, profile: EffectProfile) -> Self {
        self.overrides.insert(category, profile);
        self
    }

    pub fn with_partial_ratio(mut self, ratio: Decimal) -> Self {
        self.partial_ratio = ratio;
        self
    }

    pub fn effects_for(&self, category: AdjustmentCategory) -> EffectProfile {
        self.overrides
            .get(&category)
            .copied()
            .unwrap_or_else(|| default_profile(category))
    }

    pub fn capital_delta(&self, profile: &EffectProfile, nominal: Decimal) -> Decimal {
        if !profile.affects_capital {
            return Decimal::ZERO;
        }
        match profile.capital_magnitude {
            CapitalMagnitude::Full => nominal,
            CapitalMagnitude::Partial => nominal * self.partial_ratio,
        }
    }

    pub fn profit_delta(&self, profile: &EffectProfile, nominal: Decimal) -> Decimal {
        if profile.affects_profit {
            nominal
        } else {
            Decimal::ZERO
        }
    }
}
