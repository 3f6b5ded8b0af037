//! Read-side income rollups for dashboards.
//!
//! Readers may observe a captured payment whose income rows are not written
//! yet; such a payment counts towards the totals and contributes no income.

use std::collections::{HashMap, HashSet};

use uuid::Uuid;

use crate::error::IncomeError;
use crate::store::Store;
use crate::types::{IncomeRecord, IncomeSummary, Payment, Period, SubtreePayment, UserId};

/// Summarizes `payments` and their income rows from the point of view of `user_id`.
///
/// Every captured payment is one client enrolment, so `total_clients` adds up
/// across adjacent periods the same way the money totals do.
///
/// Downline income on a payment is the income of layers above the user's own
/// layer on that payment. Payments the user did not earn from add nothing to
/// personal or downline income.
pub fn summarize(user_id: UserId, payments: &[Payment], records: &[IncomeRecord]) -> IncomeSummary {
    let mut summary = IncomeSummary {
        total_clients: payments.len() as i64,
        ..IncomeSummary::default()
    };
    for payment in payments {
        summary.total_income += payment.amount;
        summary.total_fee += payment.fee;
    }

    let included: HashSet<Uuid> = payments.iter().map(|p| p.id).collect();
    let by_payment = group_by_payment(records, &included);
    for rows in by_payment.values() {
        let Some(mine) = rows.iter().find(|r| r.user_id == user_id) else {
            continue;
        };
        summary.personal_income += mine.amount;
        summary.downline_income += rows
            .iter()
            .filter(|r| r.layer > mine.layer)
            .map(|r| r.amount)
            .sum::<i64>();
    }
    summary
}

/// Pairs each payment with the user's own layer and income on it.
pub fn annotate_payments(
    user_id: UserId,
    payments: Vec<Payment>,
    records: &[IncomeRecord],
) -> Vec<SubtreePayment> {
    let mine: HashMap<Uuid, &IncomeRecord> = records
        .iter()
        .filter(|r| r.user_id == user_id)
        .map(|r| (r.payment_id, r))
        .collect();
    payments
        .into_iter()
        .map(|payment| {
            let record = mine.get(&payment.id);
            SubtreePayment {
                my_layer: record.map(|r| r.layer),
                my_income: record.map(|r| r.amount),
                payment,
            }
        })
        .collect()
}

fn group_by_payment<'a>(
    records: &'a [IncomeRecord],
    included: &HashSet<Uuid>,
) -> HashMap<Uuid, Vec<&'a IncomeRecord>> {
    let mut grouped: HashMap<Uuid, Vec<&IncomeRecord>> = HashMap::new();
    for record in records.iter().filter(|r| included.contains(&r.payment_id)) {
        grouped.entry(record.payment_id).or_default().push(record);
    }
    grouped
}

/// Loads the captured payments of the user's subtree inside `period`
/// together with their income rows.
async fn subtree_activity(
    store: &dyn Store,
    user_id: UserId,
    period: Period,
) -> Result<(Vec<Payment>, Vec<IncomeRecord>), IncomeError> {
    if period.end <= period.start {
        return Ok((Vec::new(), Vec::new()));
    }
    let members = store.subtree(user_id).await?;
    if members.is_empty() {
        return Ok((Vec::new(), Vec::new()));
    }

    let payments = store.captured_payments(&members, period).await?;
    let ids: HashSet<Uuid> = payments.iter().map(|p| p.id).collect();
    let records = if ids.is_empty() {
        Vec::new()
    } else {
        store.income_for_payments(&ids).await?
    };
    Ok((payments, records))
}

/// Income rollup for a user's subtree. Unknown users get an empty summary.
pub async fn get_income_summary(
    store: &dyn Store,
    user_id: UserId,
    period: Period,
) -> Result<IncomeSummary, IncomeError> {
    let (payments, records) = subtree_activity(store, user_id, period).await?;
    Ok(summarize(user_id, &payments, &records))
}

/// Captured payments of a user's subtree, newest first, each annotated with
/// the user's own share.
pub async fn get_payments_for_subtree(
    store: &dyn Store,
    user_id: UserId,
    period: Period,
) -> Result<Vec<SubtreePayment>, IncomeError> {
    let (payments, records) = subtree_activity(store, user_id, period).await?;
    Ok(annotate_payments(user_id, payments, &records))
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, Datelike, TimeZone, Utc};

    use super::*;
    use crate::commission::RuleSet;
    use crate::distribution::distribute_commission;
    use crate::store::{MemoryStore, total_downline_key};
    use crate::types::{NewPayment, NewUser, PaymentStatus, UserRole};

    fn month(year: i32, month: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0).unwrap()
    }

    fn whole_year() -> Period {
        Period::new(month(2024, 1), month(2025, 1))
    }

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

    async fn pay(store: &MemoryStore, client_id: UserId, amount: i64, at: DateTime<Utc>) -> Uuid {
        let payment = store
            .create_payment(NewPayment {
                order_id: None,
                client_id,
                plan_id: 7,
                amount,
                fee: amount / 50,
                currency: "INR".into(),
            })
            .await
            .unwrap();
        store
            .finalize_payment(payment.id, PaymentStatus::Captured, None, at)
            .await
            .unwrap();
        distribute_commission(store, payment.id).await.unwrap();
        payment.id
    }

    async fn configured(percentages: Vec<f64>) -> MemoryStore {
        let store = MemoryStore::default();
        let bucket = percentages.len() as i32 - 1;
        store
            .put_setting(&total_downline_key(UserRole::Client), &bucket.to_string())
            .await
            .unwrap();
        store
            .put_rule_set(&RuleSet::new(UserRole::Client, bucket, percentages).unwrap())
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn two_level_example() {
        let store = configured(vec![70.0, 30.0]).await;
        let r = user(&store, None).await;
        let a = user(&store, Some(r)).await;
        let b = user(&store, Some(a)).await;
        pay(&store, b, 1000, month(2024, 3)).await;

        let for_a = get_income_summary(&store, a, whole_year()).await.unwrap();
        assert_eq!(for_a.personal_income, 700);
        assert_eq!(for_a.downline_income, 300);
        assert_eq!(for_a.total_income, 1000);
        assert_eq!(for_a.total_clients, 1);

        let for_r = get_income_summary(&store, r, whole_year()).await.unwrap();
        assert_eq!(for_r.personal_income, 300);
        assert_eq!(for_r.downline_income, 0);
        assert!(for_r.personal_income + for_r.downline_income <= for_r.total_income);
    }

    #[tokio::test]
    async fn monthly_summaries_add_up_to_the_year() {
        let store = configured(vec![50.0, 30.0, 20.0]).await;
        let root = user(&store, None).await;
        let l1 = user(&store, Some(root)).await;
        let l2a = user(&store, Some(l1)).await;
        let l2b = user(&store, Some(l1)).await;
        let l3 = user(&store, Some(l2a)).await;
        let l4 = user(&store, Some(l3)).await;

        let payers = [l1, l2a, l2b, l3, l4];
        for (i, payer) in payers.iter().cycle().take(24).enumerate() {
            let m = (i % 12) as u32 + 1;
            let at = Utc.with_ymd_and_hms(2024, m, 28, 23, 59, 59).unwrap();
            pay(&store, *payer, 1_000 + i as i64 * 37, at).await;
        }
        // Boundaries: one payment exactly at the year start, one at the year end.
        pay(&store, l3, 5_000, month(2024, 1)).await;
        pay(&store, l3, 5_000, month(2025, 1)).await;

        for who in [root, l1, l2a] {
            let year = get_income_summary(&store, who, whole_year()).await.unwrap();
            let mut summed = IncomeSummary::default();
            for m in 1..=12u32 {
                let start = month(2024, m);
                let end = if m == 12 { month(2025, 1) } else { month(2024, m + 1) };
                let part = get_income_summary(&store, who, Period::new(start, end))
                    .await
                    .unwrap();
                summed.total_clients += part.total_clients;
                summed.total_income += part.total_income;
                summed.total_fee += part.total_fee;
                summed.personal_income += part.personal_income;
                summed.downline_income += part.downline_income;
            }
            assert_eq!(summed.total_clients, year.total_clients);
            assert_eq!(summed.total_income, year.total_income);
            assert_eq!(summed.total_fee, year.total_fee);
            assert_eq!(summed.personal_income, year.personal_income);
            assert_eq!(summed.downline_income, year.downline_income);
            assert!(year.personal_income + year.downline_income <= year.total_income);
        }
    }

    #[tokio::test]
    async fn repeat_payer_counts_once_per_payment() {
        let store = configured(vec![100.0]).await;
        let root = user(&store, None).await;
        let child = user(&store, Some(root)).await;
        pay(&store, child, 400, Utc.with_ymd_and_hms(2024, 1, 10, 0, 0, 0).unwrap()).await;
        pay(&store, child, 400, Utc.with_ymd_and_hms(2024, 2, 10, 0, 0, 0).unwrap()).await;

        let year = get_income_summary(&store, root, whole_year()).await.unwrap();
        let mut monthly = 0;
        for m in 1..=12u32 {
            let end = if m == 12 { month(2025, 1) } else { month(2024, m + 1) };
            monthly += get_income_summary(&store, root, Period::new(month(2024, m), end))
                .await
                .unwrap()
                .total_clients;
        }
        assert_eq!(year.total_clients, 2);
        assert_eq!(monthly, year.total_clients);
        assert_eq!(year.personal_income, 800);
    }

    #[tokio::test]
    async fn unknown_user_gets_an_empty_summary() {
        let store = configured(vec![100.0]).await;
        let summary = get_income_summary(&store, 404, whole_year()).await.unwrap();
        assert_eq!(summary, IncomeSummary::default());
        assert!(
            get_payments_for_subtree(&store, 404, whole_year())
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn subtree_payments_carry_the_callers_share() {
        let store = configured(vec![70.0, 30.0]).await;
        let r = user(&store, None).await;
        let a = user(&store, Some(r)).await;
        let b = user(&store, Some(a)).await;
        let c = user(&store, Some(b)).await;
        let from_b = pay(&store, b, 1000, month(2024, 2)).await;
        let from_c = pay(&store, c, 2000, month(2024, 5)).await;

        let rows = get_payments_for_subtree(&store, r, whole_year()).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].payment.id, from_c);
        assert_eq!(rows[0].my_layer, None);
        assert_eq!(rows[1].payment.id, from_b);
        assert_eq!(rows[1].my_layer, Some(1));
        assert_eq!(rows[1].my_income, Some(300));
        assert_eq!(rows[1].payment.captured_at.map(|at| at.month()), Some(2));
    }

    #[tokio::test]
    async fn payments_outside_the_subtree_are_ignored() {
        let store = configured(vec![100.0]).await;
        let left = user(&store, None).await;
        let right = user(&store, None).await;
        let left_child = user(&store, Some(left)).await;
        let right_child = user(&store, Some(right)).await;
        pay(&store, left_child, 100, month(2024, 4)).await;
        pay(&store, right_child, 900, month(2024, 4)).await;

        let summary = get_income_summary(&store, left, whole_year()).await.unwrap();
        assert_eq!(summary.total_income, 100);
        assert_eq!(summary.personal_income, 100);
    }

    #[test]
    fn summary_counts_one_client_per_payment() {
        let payment = |client_id, amount| Payment {
            id: Uuid::new_v4(),
            order_id: Uuid::new_v4().to_string(),
            gateway_payment_id: None,
            client_id,
            plan_id: 1,
            amount,
            fee: 1,
            currency: "INR".into(),
            status: PaymentStatus::Captured,
            created_at: Utc::now(),
            captured_at: Some(Utc::now()),
            distributed_at: None,
        };
        let payments = vec![payment(5, 10), payment(5, 20), payment(6, 30)];
        let summary = summarize(1, &payments, &[]);
        assert_eq!(summary.total_clients, 3);
        assert_eq!(summary.total_income, 60);
        assert_eq!(summary.total_fee, 3);
        assert_eq!(summary.personal_income, 0);
    }
}
