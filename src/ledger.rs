use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::IncomeError;
use crate::types::{IncomeRecord, IncomeShare, UserId};

/// Checks that a distribution assigns every layer and every user at most once.
pub fn validate_shares(shares: &[IncomeShare]) -> Result<(), IncomeError> {
    let mut layers = HashSet::new();
    let mut users = HashSet::new();
    for share in shares {
        if !layers.insert(share.layer) {
            return Err(IncomeError::InvalidInput(format!(
                "layer {} assigned twice",
                share.layer
            )));
        }
        if !users.insert(share.user_id) {
            return Err(IncomeError::InvalidInput(format!(
                "user {} earns twice from one payment",
                share.user_id
            )));
        }
    }
    Ok(())
}

/// Append-only income records with the `(payment, layer)` and
/// `(user, payment)` uniqueness indexes.
#[derive(Debug, Default)]
pub struct IncomeLedger {
    records: Vec<IncomeRecord>,
    by_payment: HashMap<Uuid, Vec<usize>>,
    payment_layers: HashSet<(Uuid, i32)>,
    user_payments: HashSet<(UserId, Uuid)>,
}

impl IncomeLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Writes all shares of one payment, or none of them.
    pub fn append(
        &mut self,
        payment_id: Uuid,
        shares: &[IncomeShare],
        at: DateTime<Utc>,
    ) -> Result<Vec<IncomeRecord>, IncomeError> {
        validate_shares(shares)?;
        let conflict = shares.iter().any(|share| {
            self.payment_layers.contains(&(payment_id, share.layer))
                || self.user_payments.contains(&(share.user_id, payment_id))
        });
        if conflict {
            return Err(IncomeError::DuplicateDistribution(payment_id));
        }

        let written: Vec<IncomeRecord> = shares
            .iter()
            .map(|share| IncomeRecord::from_share(payment_id, share, at))
            .collect();
        for record in &written {
            self.payment_layers.insert((payment_id, record.layer));
            self.user_payments.insert((record.user_id, payment_id));
            self.by_payment
                .entry(payment_id)
                .or_default()
                .push(self.records.len());
            self.records.push(record.clone());
        }
        Ok(written)
    }

    /// Records of one payment, ordered by layer.
    pub fn for_payment(&self, payment_id: Uuid) -> Vec<IncomeRecord> {
        let mut records: Vec<IncomeRecord> = self
            .by_payment
            .get(&payment_id)
            .into_iter()
            .flatten()
            .map(|&i| self.records[i].clone())
            .collect();
        records.sort_by_key(|r| r.layer);
        records
    }

    pub fn for_payments(&self, payment_ids: &HashSet<Uuid>) -> Vec<IncomeRecord> {
        payment_ids
            .iter()
            .flat_map(|id| self.for_payment(*id))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
