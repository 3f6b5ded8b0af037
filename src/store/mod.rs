//! Persistence seam between the income engine and its storage.

mod memory;
mod postgres;

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use crate::commission::{CommissionTable, RuleSet};
use crate::error::IncomeError;
use crate::types::{
    IncomeRecord, IncomeShare, NewPayment, NewUser, Payment, PaymentStatus, Period, UserId,
    UserNode, UserRole,
};

#[async_trait]
pub trait Store: Send + Sync {
    async fn get_user(&self, id: UserId) -> Result<Option<UserNode>, IncomeError>;

    /// Up to `limit` ancestors of `id`, nearest first, with the same cycle and
    /// depth-bound checks as [`crate::hierarchy::Hierarchy::ancestor_chain`].
    async fn ancestor_chain(&self, id: UserId, limit: usize) -> Result<Vec<UserId>, IncomeError>;

    /// `id` and all of its descendants. Empty when `id` is unknown.
    async fn subtree(&self, id: UserId) -> Result<HashSet<UserId>, IncomeError>;

    /// Distance from `id` to its root, `None` for unknown users.
    async fn depth(&self, id: UserId) -> Result<Option<usize>, IncomeError> {
        if self.get_user(id).await?.is_none() {
            return Ok(None);
        }
        Ok(Some(self.ancestor_chain(id, usize::MAX).await?.len()))
    }

    /// Persists a user. The parent must exist.
    async fn insert_user(&self, user: NewUser) -> Result<UserNode, IncomeError>;

    /// Reads a policy value from the settings table.
    async fn setting(&self, key: &str) -> Result<Option<String>, IncomeError>;

    async fn put_setting(&self, key: &str, value: &str) -> Result<(), IncomeError>;

    async fn commission_table(&self) -> Result<CommissionTable, IncomeError>;

    /// Replaces every layer of the set's `(type, bucket)` in one step.
    async fn put_rule_set(&self, set: &RuleSet) -> Result<(), IncomeError>;

    async fn create_payment(&self, payment: NewPayment) -> Result<Payment, IncomeError>;

    async fn get_payment(&self, id: Uuid) -> Result<Option<Payment>, IncomeError>;

    async fn get_payment_by_order(&self, order_id: &str) -> Result<Option<Payment>, IncomeError>;

    /// Moves a payment to a terminal status. Repeating the current terminal
    /// status returns the payment unchanged.
    async fn finalize_payment(
        &self,
        id: Uuid,
        status: PaymentStatus,
        gateway_payment_id: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<Payment, IncomeError>;

    /// Captured payments without a written distribution.
    async fn pending_distributions(&self) -> Result<Vec<Payment>, IncomeError>;

    /// Writes all shares of a payment and marks it distributed, atomically.
    ///
    /// Fails with [`IncomeError::DuplicateDistribution`] when the payment was
    /// already distributed or a uniqueness index rejects a row.
    async fn record_distribution(
        &self,
        payment_id: Uuid,
        shares: &[IncomeShare],
    ) -> Result<Vec<IncomeRecord>, IncomeError>;

    /// Records of one payment, ordered by layer.
    async fn income_for_payment(&self, payment_id: Uuid) -> Result<Vec<IncomeRecord>, IncomeError>;

    async fn income_for_payments(
        &self,
        payment_ids: &HashSet<Uuid>,
    ) -> Result<Vec<IncomeRecord>, IncomeError>;

    /// Captured payments made by `payers` with a capture time inside `period`,
    /// newest first.
    async fn captured_payments(
        &self,
        payers: &HashSet<UserId>,
        period: Period,
    ) -> Result<Vec<Payment>, IncomeError>;
}

/// Settings key holding the commission bucket for a referral type.
pub fn total_downline_key(referral_type: UserRole) -> String {
    format!("total_downline.{referral_type}")
}

/// Settings key holding the maximum recruiting depth for a role.
pub fn max_chain_depth_key(role: UserRole) -> String {
    format!("max_chain_depth.{role}")
}
