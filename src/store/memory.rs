use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::Store;
use crate::commission::{CommissionTable, RuleSet};
use crate::error::IncomeError;
use crate::hierarchy::Hierarchy;
use crate::ledger::IncomeLedger;
use crate::types::{
    IncomeRecord, IncomeShare, NewPayment, NewUser, Payment, PaymentStatus, Period, UserId,
    UserNode,
};

/// Process-local store used by tests and single-node runs.
#[derive(Debug)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

#[derive(Debug)]
struct Inner {
    users: Hierarchy,
    settings: HashMap<String, String>,
    rules: CommissionTable,
    payments: HashMap<Uuid, Payment>,
    ledger: IncomeLedger,
}

impl MemoryStore {
    pub fn new(max_tree_depth: usize) -> Self {
        Self::with_hierarchy(Hierarchy::new(max_tree_depth))
    }

    /// Starts from an existing arena, e.g. one with deliberately broken links.
    pub fn with_hierarchy(users: Hierarchy) -> Self {
        Self {
            inner: RwLock::new(Inner {
                users,
                settings: HashMap::new(),
                rules: CommissionTable::new(),
                payments: HashMap::new(),
                ledger: IncomeLedger::new(),
            }),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::with_hierarchy(Hierarchy::default())
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get_user(&self, id: UserId) -> Result<Option<UserNode>, IncomeError> {
        Ok(self.inner.read().await.users.get(id).cloned())
    }

    async fn ancestor_chain(&self, id: UserId, limit: usize) -> Result<Vec<UserId>, IncomeError> {
        self.inner.read().await.users.ancestor_chain(id, limit)
    }

    async fn subtree(&self, id: UserId) -> Result<HashSet<UserId>, IncomeError> {
        Ok(self.inner.read().await.users.subtree(id))
    }

    async fn depth(&self, id: UserId) -> Result<Option<usize>, IncomeError> {
        self.inner.read().await.users.depth(id)
    }

    async fn insert_user(&self, user: NewUser) -> Result<UserNode, IncomeError> {
        let mut inner = self.inner.write().await;
        let node = UserNode {
            id: inner.users.next_id(),
            role: user.role,
            parent_id: user.parent_id,
            created_at: Utc::now(),
        };
        inner.users.insert(node.clone())?;
        Ok(node)
    }

    async fn setting(&self, key: &str) -> Result<Option<String>, IncomeError> {
        Ok(self.inner.read().await.settings.get(key).cloned())
    }

    async fn put_setting(&self, key: &str, value: &str) -> Result<(), IncomeError> {
        self.inner
            .write()
            .await
            .settings
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn commission_table(&self) -> Result<CommissionTable, IncomeError> {
        Ok(self.inner.read().await.rules.clone())
    }

    async fn put_rule_set(&self, set: &RuleSet) -> Result<(), IncomeError> {
        self.inner.write().await.rules.insert(set.clone());
        Ok(())
    }

    async fn create_payment(&self, payment: NewPayment) -> Result<Payment, IncomeError> {
        let mut inner = self.inner.write().await;
        if !inner.users.contains(payment.client_id) {
            return Err(IncomeError::UserNotFound(payment.client_id));
        }
        let order_id = payment
            .order_id
            .unwrap_or_else(|| format!("order_{}", Uuid::new_v4().simple()));
        if inner.payments.values().any(|p| p.order_id == order_id) {
            return Err(IncomeError::InvalidInput(format!(
                "order {order_id} already has a payment"
            )));
        }

        let created = Payment {
            id: Uuid::new_v4(),
            order_id,
            gateway_payment_id: None,
            client_id: payment.client_id,
            plan_id: payment.plan_id,
            amount: payment.amount,
            fee: payment.fee,
            currency: payment.currency,
            status: PaymentStatus::Created,
            created_at: Utc::now(),
            captured_at: None,
            distributed_at: None,
        };
        inner.payments.insert(created.id, created.clone());
        Ok(created)
    }

    async fn get_payment(&self, id: Uuid) -> Result<Option<Payment>, IncomeError> {
        Ok(self.inner.read().await.payments.get(&id).cloned())
    }

    async fn get_payment_by_order(&self, order_id: &str) -> Result<Option<Payment>, IncomeError> {
        Ok(self
            .inner
            .read()
            .await
            .payments
            .values()
            .find(|p| p.order_id == order_id)
            .cloned())
    }

    async fn finalize_payment(
        &self,
        id: Uuid,
        status: PaymentStatus,
        gateway_payment_id: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<Payment, IncomeError> {
        let mut inner = self.inner.write().await;
        let payment = inner
            .payments
            .get_mut(&id)
            .ok_or_else(|| IncomeError::PaymentNotFound(id.to_string()))?;

        if payment.status.transition(status)? {
            payment.status = status;
            if let Some(gateway_id) = gateway_payment_id {
                payment.gateway_payment_id = Some(gateway_id.to_string());
            }
            if status == PaymentStatus::Captured {
                payment.captured_at = Some(at);
            }
        }
        Ok(payment.clone())
    }

    async fn pending_distributions(&self) -> Result<Vec<Payment>, IncomeError> {
        let inner = self.inner.read().await;
        let mut pending: Vec<Payment> = inner
            .payments
            .values()
            .filter(|p| p.is_distribution_pending())
            .cloned()
            .collect();
        pending.sort_by_key(|p| p.captured_at);
        Ok(pending)
    }

    async fn record_distribution(
        &self,
        payment_id: Uuid,
        shares: &[IncomeShare],
    ) -> Result<Vec<IncomeRecord>, IncomeError> {
        let mut inner = self.inner.write().await;
        let distributed = inner
            .payments
            .get(&payment_id)
            .ok_or_else(|| IncomeError::PaymentNotFound(payment_id.to_string()))?
            .distributed_at
            .is_some();
        if distributed {
            return Err(IncomeError::DuplicateDistribution(payment_id));
        }

        let now = Utc::now();
        let records = inner.ledger.append(payment_id, shares, now)?;
        if let Some(payment) = inner.payments.get_mut(&payment_id) {
            payment.distributed_at = Some(now);
        }
        Ok(records)
    }

    async fn income_for_payment(&self, payment_id: Uuid) -> Result<Vec<IncomeRecord>, IncomeError> {
        Ok(self.inner.read().await.ledger.for_payment(payment_id))
    }

    async fn income_for_payments(
        &self,
        payment_ids: &HashSet<Uuid>,
    ) -> Result<Vec<IncomeRecord>, IncomeError> {
        Ok(self.inner.read().await.ledger.for_payments(payment_ids))
    }

    async fn captured_payments(
        &self,
        payers: &HashSet<UserId>,
        period: Period,
    ) -> Result<Vec<Payment>, IncomeError> {
        let inner = self.inner.read().await;
        let mut payments: Vec<Payment> = inner
            .payments
            .values()
            .filter(|p| p.status == PaymentStatus::Captured && payers.contains(&p.client_id))
            .filter(|p| p.captured_at.is_some_and(|at| period.contains(at)))
            .cloned()
            .collect();
        payments.sort_by(|a, b| b.captured_at.cmp(&a.captured_at).then(a.id.cmp(&b.id)));
        Ok(payments)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::UserRole;

    async fn store_with_payment() -> (MemoryStore, Payment) {
        let store = MemoryStore::default();
        let user = store
            .insert_user(NewUser {
                role: UserRole::Client,
                parent_id: None,
            })
            .await
            .unwrap();
        let payment = store
            .create_payment(NewPayment {
                order_id: Some("order_1".into()),
                client_id: user.id,
                plan_id: 1,
                amount: 1000,
                fee: 20,
                currency: "INR".into(),
            })
            .await
            .unwrap();
        (store, payment)
    }

    #[tokio::test]
    async fn finalize_is_once_only() {
        let (store, payment) = store_with_payment().await;
        let at = Utc::now();
        let captured = store
            .finalize_payment(payment.id, PaymentStatus::Captured, Some("pay_1"), at)
            .await
            .unwrap();
        assert_eq!(captured.captured_at, Some(at));

        let again = store
            .finalize_payment(payment.id, PaymentStatus::Captured, Some("pay_2"), Utc::now())
            .await
            .unwrap();
        assert_eq!(again.gateway_payment_id.as_deref(), Some("pay_1"));
        assert_eq!(again.captured_at, Some(at));

        assert!(matches!(
            store
                .finalize_payment(payment.id, PaymentStatus::Failed, None, Utc::now())
                .await,
            Err(IncomeError::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn tree_walks_read_the_arena() {
        let store = MemoryStore::default();
        let mut ids = Vec::new();
        for _ in 0..4 {
            let parent_id = ids.last().copied();
            let node = store
                .insert_user(NewUser {
                    role: UserRole::Client,
                    parent_id,
                })
                .await
                .unwrap();
            ids.push(node.id);
        }

        assert_eq!(
            store.ancestor_chain(ids[3], 2).await.unwrap(),
            vec![ids[2], ids[1]]
        );
        assert_eq!(store.depth(ids[3]).await.unwrap(), Some(3));
        assert_eq!(store.depth(999).await.unwrap(), None);
        assert_eq!(
            store.subtree(ids[1]).await.unwrap(),
            HashSet::from([ids[1], ids[2], ids[3]])
        );
        assert!(store.subtree(999).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn corrupt_links_fail_the_walk() {
        let at = Utc::now();
        let node = |id, parent_id| UserNode {
            id,
            role: UserRole::Client,
            parent_id,
            created_at: at,
        };
        let store = MemoryStore::with_hierarchy(Hierarchy::from_nodes(
            [node(1, Some(2)), node(2, Some(1)), node(3, Some(1))],
            16,
        ));
        assert!(matches!(
            store.ancestor_chain(3, 10).await,
            Err(IncomeError::CycleDetected { user_id: 3, .. })
        ));
        assert!(store.depth(3).await.is_err());
    }

    #[tokio::test]
    async fn duplicate_order_is_rejected() {
        let (store, payment) = store_with_payment().await;
        let err = store
            .create_payment(NewPayment {
                order_id: Some(payment.order_id.clone()),
                client_id: payment.client_id,
                plan_id: 1,
                amount: 1,
                fee: 0,
                currency: "INR".into(),
            })
            .await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn second_distribution_write_is_a_duplicate() {
        let (store, payment) = store_with_payment().await;
        store
            .finalize_payment(payment.id, PaymentStatus::Captured, None, Utc::now())
            .await
            .unwrap();
        store.record_distribution(payment.id, &[]).await.unwrap();
        assert!(store.pending_distributions().await.unwrap().is_empty());
        assert!(matches!(
            store.record_distribution(payment.id, &[]).await,
            Err(IncomeError::DuplicateDistribution(_))
        ));
    }
}
