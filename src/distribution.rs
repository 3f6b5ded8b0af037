//! Turns a captured payment into income records along the payer's ancestor chain.

use serde::Serialize;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::commission::{CommissionTable, percent_of};
use crate::error::IncomeError;
use crate::ledger::validate_shares;
use crate::store::{Store, total_downline_key};
use crate::types::{IncomeRecord, IncomeShare, Payment, PaymentStatus, UserId, UserRole};

/// Computes the shares of one payment.
///
/// `chain` holds the payer's ancestors, nearest first. Layers past the end of
/// the chain are not paid out; a missing rate aborts the whole plan.
pub fn plan_distribution(
    payment: &Payment,
    referral_type: UserRole,
    total_downline: i32,
    chain: &[UserId],
    table: &CommissionTable,
) -> Result<Vec<IncomeShare>, IncomeError> {
    let layers = (total_downline.max(0) as usize + 1).min(chain.len());
    let mut shares = Vec::with_capacity(layers);
    for (layer, &user_id) in chain.iter().take(layers).enumerate() {
        let layer = layer as i32;
        let rate = table.get_rate(referral_type, total_downline, layer)?;
        shares.push(IncomeShare {
            user_id,
            layer,
            amount: percent_of(payment.amount, rate),
            commission_percentage: rate,
            fee: percent_of(payment.fee, rate),
        });
    }
    validate_shares(&shares)?;
    Ok(shares)
}

/// Reads the commission bucket configured for a referral type.
pub async fn total_downline_for(
    store: &dyn Store,
    referral_type: UserRole,
) -> Result<i32, IncomeError> {
    let key = total_downline_key(referral_type);
    store
        .setting(&key)
        .await?
        .and_then(|value| value.trim().parse::<i32>().ok())
        .filter(|bucket| *bucket >= 0)
        .ok_or(IncomeError::PolicyNotConfigured(key))
}

/// Distributes one captured payment.
///
/// Idempotent: a payment that was already distributed, including one finished
/// by a concurrent caller, yields the stored records.
pub async fn distribute_commission(
    store: &dyn Store,
    payment_id: Uuid,
) -> Result<Vec<IncomeRecord>, IncomeError> {
    let payment = store
        .get_payment(payment_id)
        .await?
        .ok_or_else(|| IncomeError::PaymentNotFound(payment_id.to_string()))?;

    if payment.distributed_at.is_some() {
        info!(%payment_id, "payment already distributed, returning stored income");
        return store.income_for_payment(payment_id).await;
    }
    if payment.status != PaymentStatus::Captured {
        return Err(IncomeError::PaymentNotCaptured {
            payment_id,
            status: payment.status,
        });
    }

    let payer = store
        .get_user(payment.client_id)
        .await?
        .ok_or(IncomeError::UserNotFound(payment.client_id))?;
    let referral_type = payer.role;
    let total_downline = total_downline_for(store, referral_type).await?;
    let table = store.commission_table().await?;
    let set = table
        .rule_set(referral_type, total_downline)
        .ok_or(IncomeError::RuleNotFound {
            referral_type,
            total_downline,
            layer: 0,
        })?;

    let chain = store
        .ancestor_chain(payer.id, set.max_layer() as usize + 1)
        .await?;
    let shares = plan_distribution(&payment, referral_type, total_downline, &chain, &table)?;

    match store.record_distribution(payment_id, &shares).await {
        Ok(records) => {
            info!(
                %payment_id,
                payer = payer.id,
                %referral_type,
                total_downline,
                layers = records.len(),
                "commission distributed"
            );
            Ok(records)
        }
        Err(IncomeError::DuplicateDistribution(_)) => {
            info!(%payment_id, "distribution already written by another caller");
            store.income_for_payment(payment_id).await
        }
        Err(e) => Err(e),
    }
}

/// Outcome of a reconciliation pass over pending distributions.
#[derive(Debug, Default, Serialize)]
pub struct RetryReport {
    pub distributed: Vec<Uuid>,
    pub failed: Vec<FailedDistribution>,
}

#[derive(Debug, Serialize)]
pub struct FailedDistribution {
    pub payment_id: Uuid,
    pub error: String,
}

/// Re-runs distribution for every captured payment still pending.
pub async fn retry_pending_distributions(store: &dyn Store) -> Result<RetryReport, IncomeError> {
    let mut report = RetryReport::default();
    for payment in store.pending_distributions().await? {
        match distribute_commission(store, payment.id).await {
            Ok(_) => report.distributed.push(payment.id),
            Err(e) => {
                warn!(payment_id = %payment.id, "distribution retry failed: {}", e);
                report.failed.push(FailedDistribution {
                    payment_id: payment.id,
                    error: e.to_string(),
                });
            }
        }
    }
    if !report.failed.is_empty() {
        error!(
            failed = report.failed.len(),
            "payments still pending distribution"
        );
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use chrono::Utc;
    use tokio_test::{assert_err, assert_ok};

    use super::*;
    use crate::commission::RuleSet;
    use crate::hierarchy::Hierarchy;
    use crate::store::MemoryStore;
    use crate::types::{NewPayment, NewUser, UserNode};

    async fn user(store: &MemoryStore, parent_id: Option<UserId>) -> UserId {
        store
            .insert_user(NewUser {
                role: UserRole::Client,
                parent_id,
            })
            .await
            .unwrap()
            .id
    }

    async fn captured(store: &MemoryStore, client_id: UserId, amount: i64, fee: i64) -> Uuid {
        let payment = store
            .create_payment(NewPayment {
                order_id: None,
                client_id,
                plan_id: 1,
                amount,
                fee,
                currency: "INR".into(),
            })
            .await
            .unwrap();
        store
            .finalize_payment(payment.id, PaymentStatus::Captured, None, Utc::now())
            .await
            .unwrap();
        payment.id
    }

    async fn configure(store: &MemoryStore, percentages: Vec<f64>) {
        let bucket = percentages.len() as i32 - 1;
        store
            .put_setting(&total_downline_key(UserRole::Client), &bucket.to_string())
            .await
            .unwrap();
        store
            .put_rule_set(&RuleSet::new(UserRole::Client, bucket, percentages).unwrap())
            .await
            .unwrap();
    }

    fn by_layer(records: &[IncomeRecord]) -> Vec<(UserId, i32, i64)> {
        let mut rows: Vec<_> = records.iter().map(|r| (r.user_id, r.layer, r.amount)).collect();
        rows.sort_by_key(|r| r.1);
        rows
    }

    #[tokio::test]
    async fn pays_nearest_ancestor_first() {
        let store = MemoryStore::default();
        configure(&store, vec![70.0, 30.0]).await;
        let root = user(&store, None).await;
        let a = user(&store, Some(root)).await;
        let b = user(&store, Some(a)).await;
        let payment = captured(&store, b, 1000, 20).await;

        let records = distribute_commission(&store, payment).await.unwrap();
        assert_eq!(by_layer(&records), vec![(a, 0, 700), (root, 1, 300)]);
        assert_eq!(records.iter().map(|r| r.fee).sum::<i64>(), 20);
    }

    #[tokio::test]
    async fn chain_shorter_than_layers_leaves_remainder_undistributed() {
        let store = MemoryStore::default();
        configure(&store, vec![50.0, 30.0, 20.0]).await;
        let root = user(&store, None).await;
        let a = user(&store, Some(root)).await;
        let payment = captured(&store, a, 1000, 0).await;

        let records = distribute_commission(&store, payment).await.unwrap();
        assert_eq!(by_layer(&records), vec![(root, 0, 500)]);
    }

    #[tokio::test]
    async fn root_payer_produces_no_income() {
        let store = MemoryStore::default();
        configure(&store, vec![100.0]).await;
        let root = user(&store, None).await;
        let payment = captured(&store, root, 1000, 0).await;

        let records = assert_ok!(distribute_commission(&store, payment).await);
        assert!(records.is_empty());
        let stored = store.get_payment(payment).await.unwrap().unwrap();
        assert!(stored.distributed_at.is_some());
    }

    #[tokio::test]
    async fn long_chain_is_truncated_to_bucket() {
        let store = MemoryStore::default();
        configure(&store, vec![60.0, 40.0]).await;
        let mut parent = user(&store, None).await;
        let mut ids = vec![parent];
        for _ in 0..5 {
            parent = user(&store, Some(parent)).await;
            ids.push(parent);
        }
        let payment = captured(&store, parent, 10_000, 0).await;

        let records = distribute_commission(&store, payment).await.unwrap();
        assert_eq!(
            by_layer(&records),
            vec![(ids[4], 0, 6_000), (ids[3], 1, 4_000)]
        );
    }

    #[tokio::test]
    async fn second_call_returns_the_same_records() {
        let store = MemoryStore::default();
        configure(&store, vec![70.0, 30.0]).await;
        let root = user(&store, None).await;
        let a = user(&store, Some(root)).await;
        let payment = captured(&store, a, 999, 0).await;

        let first = distribute_commission(&store, payment).await.unwrap();
        let second = distribute_commission(&store, payment).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(store.income_for_payment(payment).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn concurrent_callbacks_write_once() {
        let store = MemoryStore::default();
        configure(&store, vec![70.0, 30.0]).await;
        let root = user(&store, None).await;
        let a = user(&store, Some(root)).await;
        let b = user(&store, Some(a)).await;
        let payment = captured(&store, b, 1000, 0).await;

        let (left, right) = tokio::join!(
            distribute_commission(&store, payment),
            distribute_commission(&store, payment)
        );
        let (left, right) = (left.unwrap(), right.unwrap());
        assert_eq!(by_layer(&left), by_layer(&right));
        assert_eq!(store.income_for_payment(payment).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn missing_rule_fails_closed_and_stays_pending() {
        let store = MemoryStore::default();
        store
            .put_setting(&total_downline_key(UserRole::Client), "2")
            .await
            .unwrap();
        store
            .put_rule_set(&RuleSet::new(UserRole::Client, 1, vec![70.0, 30.0]).unwrap())
            .await
            .unwrap();
        let root = user(&store, None).await;
        let a = user(&store, Some(root)).await;
        let payment = captured(&store, a, 1000, 0).await;

        let err = assert_err!(distribute_commission(&store, payment).await);
        assert!(matches!(err, IncomeError::RuleNotFound { total_downline: 2, .. }));
        assert!(store.income_for_payment(payment).await.unwrap().is_empty());
        assert_eq!(store.pending_distributions().await.unwrap().len(), 1);

        store
            .put_rule_set(&RuleSet::new(UserRole::Client, 2, vec![50.0, 25.0, 25.0]).unwrap())
            .await
            .unwrap();
        let report = retry_pending_distributions(&store).await.unwrap();
        assert_eq!(report.distributed, vec![payment]);
        assert!(report.failed.is_empty());
        assert_eq!(store.income_for_payment(payment).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn missing_bucket_policy_fails_closed() {
        let store = MemoryStore::default();
        let root = user(&store, None).await;
        let a = user(&store, Some(root)).await;
        let payment = captured(&store, a, 1000, 0).await;

        assert!(matches!(
            distribute_commission(&store, payment).await,
            Err(IncomeError::PolicyNotConfigured(_))
        ));
    }

    #[tokio::test]
    async fn uncaptured_payment_is_not_distributed() {
        let store = MemoryStore::default();
        configure(&store, vec![100.0]).await;
        let root = user(&store, None).await;
        let a = user(&store, Some(root)).await;
        let payment = store
            .create_payment(NewPayment {
                order_id: None,
                client_id: a,
                plan_id: 1,
                amount: 10,
                fee: 0,
                currency: "INR".into(),
            })
            .await
            .unwrap();

        assert!(matches!(
            distribute_commission(&store, payment.id).await,
            Err(IncomeError::PaymentNotCaptured { .. })
        ));
    }

    #[tokio::test]
    async fn corrupted_parent_links_abort_distribution() {
        let node = |id, parent_id| UserNode {
            id,
            role: UserRole::Client,
            parent_id: Some(parent_id),
            created_at: Utc::now(),
        };
        let store = MemoryStore::with_hierarchy(Hierarchy::from_nodes([node(1, 2), node(2, 1)], 8));
        configure(&store, vec![50.0, 30.0, 20.0]).await;
        let payment = captured(&store, 1, 1000, 0).await;

        assert!(matches!(
            distribute_commission(&store, payment).await,
            Err(IncomeError::CycleDetected { .. })
        ));
        assert!(store.income_for_payment(payment).await.unwrap().is_empty());
    }

    #[test]
    fn planned_total_matches_distributed_rates() {
        let mut table = CommissionTable::new();
        table.insert(RuleSet::new(UserRole::Client, 3, vec![40.0, 30.0, 20.0, 10.0]).unwrap());
        let payment = Payment {
            id: Uuid::new_v4(),
            order_id: "o".into(),
            gateway_payment_id: None,
            client_id: 100,
            plan_id: 1,
            amount: 12_345,
            fee: 0,
            currency: "INR".into(),
            status: PaymentStatus::Captured,
            created_at: Utc::now(),
            captured_at: Some(Utc::now()),
            distributed_at: None,
        };

        for chain_len in 0..=6 {
            let chain: Vec<UserId> = (1..=chain_len).collect();
            let shares =
                plan_distribution(&payment, UserRole::Client, 3, &chain, &table).unwrap();
            let rates: f64 = shares.iter().map(|s| s.commission_percentage).sum();
            let total: i64 = shares.iter().map(|s| s.amount).sum();

            assert_eq!(shares.len(), (chain_len as usize).min(4));
            assert!(total <= payment.amount);
            assert!((total - percent_of(payment.amount, rates)).abs() <= shares.len() as i64);
            let layers: HashSet<i32> = shares.iter().map(|s| s.layer).collect();
            assert_eq!(layers.len(), shares.len());
        }
    }
}
