use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::IncomeError;
use crate::store::Store;
use crate::types::{CommissionRule, UserRole};

/// Allowed drift when checking that a rule set allocates the whole payment.
pub const PERCENT_TOLERANCE: f64 = 0.01;

/// Applies a percentage to an amount in minor units, rounding down.
///
/// The percentage is taken at basis-point precision so that the arithmetic
/// stays in integers.
pub fn percent_of(amount: i64, percent: f64) -> i64 {
    let basis_points = (percent * 100.0).round() as i128;
    ((amount as i128 * basis_points) / 10_000) as i64
}

/// The complete layer set for one `(type, total_downline)` pair.
///
/// Only constructible through validation, so any `RuleSet` in hand covers
/// layers `0..=total_downline` and sums to 100%.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RuleSet {
    referral_type: UserRole,
    total_downline: i32,
    percentages: Vec<f64>,
}

/// The request body for writing a rule set.
#[derive(Debug, Clone, Deserialize)]
pub struct RuleSetInput {
    pub referral_type: UserRole,
    pub total_downline: i32,
    /// Percentages indexed by layer.
    pub percentages: Vec<f64>,
}

impl RuleSet {
    pub fn new(
        referral_type: UserRole,
        total_downline: i32,
        percentages: Vec<f64>,
    ) -> Result<Self, IncomeError> {
        if total_downline < 0 {
            return Err(IncomeError::InvalidRuleSet(
                "total_downline must be >= 0".into(),
            ));
        }
        let expected_layers = total_downline as usize + 1;
        if percentages.len() != expected_layers {
            return Err(IncomeError::InvalidRuleSet(format!(
                "expected {expected_layers} layers for bucket {total_downline}, got {}",
                percentages.len()
            )));
        }
        if let Some((layer, pct)) = percentages
            .iter()
            .enumerate()
            .find(|(_, pct)| !pct.is_finite() || **pct < 0.0 || **pct > 100.0)
        {
            return Err(IncomeError::InvalidRuleSet(format!(
                "layer {layer} percentage {pct} is outside [0, 100]"
            )));
        }
        let total: f64 = percentages.iter().sum();
        if (total - 100.0).abs() > PERCENT_TOLERANCE {
            return Err(IncomeError::InvalidRuleSet(format!(
                "percentages sum to {total}, expected 100"
            )));
        }

        Ok(Self {
            referral_type,
            total_downline,
            percentages,
        })
    }

    /// Builds a rule set from table rows that all share one `(type, bucket)`.
    pub fn from_rules(rules: &[CommissionRule]) -> Result<Self, IncomeError> {
        let first = rules
            .first()
            .ok_or_else(|| IncomeError::InvalidRuleSet("no rules given".into()))?;
        let mut by_layer = BTreeMap::new();
        for rule in rules {
            if rule.referral_type != first.referral_type
                || rule.total_downline != first.total_downline
            {
                return Err(IncomeError::InvalidRuleSet(
                    "rules mix several (type, bucket) pairs".into(),
                ));
            }
            if by_layer.insert(rule.layer, rule.commission_percentage).is_some() {
                return Err(IncomeError::InvalidRuleSet(format!(
                    "layer {} is defined twice",
                    rule.layer
                )));
            }
        }
        if by_layer
            .keys()
            .enumerate()
            .any(|(expected, &layer)| layer != expected as i32)
        {
            return Err(IncomeError::InvalidRuleSet(
                "layers must be contiguous from 0".into(),
            ));
        }

        Self::new(
            first.referral_type,
            first.total_downline,
            by_layer.into_values().collect(),
        )
    }

    pub fn referral_type(&self) -> UserRole {
        self.referral_type
    }

    pub fn total_downline(&self) -> i32 {
        self.total_downline
    }

    /// The deepest layer this set pays.
    pub fn max_layer(&self) -> i32 {
        self.total_downline
    }

    pub fn rate(&self, layer: i32) -> Option<f64> {
        usize::try_from(layer)
            .ok()
            .and_then(|i| self.percentages.get(i).copied())
    }

    /// Flattens into table rows.
    pub fn rules(&self) -> Vec<CommissionRule> {
        self.percentages
            .iter()
            .enumerate()
            .map(|(layer, &commission_percentage)| CommissionRule {
                referral_type: self.referral_type,
                total_downline: self.total_downline,
                layer: layer as i32,
                commission_percentage,
            })
            .collect()
    }
}

impl TryFrom<RuleSetInput> for RuleSet {
    type Error = IncomeError;

    fn try_from(input: RuleSetInput) -> Result<Self, Self::Error> {
        RuleSet::new(input.referral_type, input.total_downline, input.percentages)
    }
}

/// Exact-match commission lookup.
#[derive(Debug, Clone, Default)]
pub struct CommissionTable {
    sets: HashMap<(UserRole, i32), RuleSet>,
}

impl CommissionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Groups raw rows and validates every group.
    pub fn from_rules(rules: Vec<CommissionRule>) -> Result<Self, IncomeError> {
        let mut grouped: HashMap<(UserRole, i32), Vec<CommissionRule>> = HashMap::new();
        for rule in rules {
            grouped
                .entry((rule.referral_type, rule.total_downline))
                .or_default()
                .push(rule);
        }

        let mut table = Self::new();
        for rules in grouped.into_values() {
            table.insert(RuleSet::from_rules(&rules)?);
        }
        Ok(table)
    }

    /// Replaces the rule set for its `(type, bucket)`.
    pub fn insert(&mut self, set: RuleSet) {
        self.sets
            .insert((set.referral_type, set.total_downline), set);
    }

    pub fn rule_set(&self, referral_type: UserRole, total_downline: i32) -> Option<&RuleSet> {
        self.sets.get(&(referral_type, total_downline))
    }

    pub fn get_rate(
        &self,
        referral_type: UserRole,
        total_downline: i32,
        layer: i32,
    ) -> Result<f64, IncomeError> {
        self.rule_set(referral_type, total_downline)
            .and_then(|set| set.rate(layer))
            .ok_or(IncomeError::RuleNotFound {
                referral_type,
                total_downline,
                layer,
            })
    }

    /// All rule sets, ordered by type and bucket.
    pub fn rule_sets(&self) -> Vec<&RuleSet> {
        let mut sets: Vec<_> = self.sets.values().collect();
        sets.sort_by_key(|s| (s.referral_type.as_str(), s.total_downline));
        sets
    }
}

/// Validates and stores a rule set, replacing the previous layers for its
/// `(type, bucket)`.
pub async fn put_rule_set(store: &dyn Store, input: RuleSetInput) -> Result<RuleSet, IncomeError> {
    let set = RuleSet::try_from(input)?;
    store.put_rule_set(&set).await?;
    info!(
        referral_type = %set.referral_type,
        total_downline = set.total_downline,
        layers = set.percentages.len(),
        "commission rule set replaced"
    );
    Ok(set)
}

pub async fn list_rule_sets(store: &dyn Store) -> Result<Vec<RuleSet>, IncomeError> {
    let table = store.commission_table().await?;
    Ok(table.rule_sets().into_iter().cloned().collect())
}
