use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};
use tracing::debug;
use uuid::Uuid;

use super::Store;
use crate::commission::{CommissionTable, RuleSet};
use crate::error::IncomeError;
use crate::hierarchy::Hierarchy;
use crate::types::{
    CommissionRule, IncomeRecord, IncomeShare, NewPayment, NewUser, Payment, PaymentStatus,
    Period, UserId, UserNode,
};

// NOTE: 23505 = unique_violation, 23503 = foreign_key_violation
const PG_UNIQUE_VIOLATION: &str = "23505";
const PG_FOREIGN_KEY_VIOLATION: &str = "23503";

const USER_COLUMNS: &str = "id, role, parent_id, created_at";
const PAYMENT_COLUMNS: &str = "id, order_id, gateway_payment_id, client_id, plan_id, amount, fee, \
     currency, status, created_at, captured_at, distributed_at";
const INCOME_COLUMNS: &str =
    "id, user_id, payment_id, layer, amount, commission_percentage, fee, created_at";

/// Walks from a user towards the root for at most `$2` steps. The walk stops
/// right after the first repeated node so that the arena check reports it.
const ANCESTOR_WALK: &str = "
    WITH RECURSIVE walk AS (
        SELECT id, role, parent_id, created_at, 0 AS step, ARRAY[id] AS path, false AS repeated
        FROM users
        WHERE id = $1
      UNION ALL
        SELECT u.id, u.role, u.parent_id, u.created_at, w.step + 1, w.path || u.id, u.id = ANY(w.path)
        FROM walk w
        JOIN users u ON u.id = w.parent_id
        WHERE w.step < $2 AND NOT w.repeated
    )
    SELECT id, role, parent_id, created_at FROM walk ORDER BY step";

/// `UNION` drops rows already produced, so a corrupt loop terminates.
const SUBTREE_WALK: &str = "
    WITH RECURSIVE tree AS (
        SELECT id FROM users WHERE id = $1
      UNION
        SELECT u.id FROM tree t JOIN users u ON u.parent_id = t.id
    )
    SELECT id FROM tree";

/// Postgres-backed store.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
    max_tree_depth: usize,
}

#[derive(sqlx::FromRow)]
struct UserRow {
    id: i64,
    role: String,
    parent_id: Option<i64>,
    created_at: DateTime<Utc>,
}

impl TryFrom<UserRow> for UserNode {
    type Error = IncomeError;

    fn try_from(row: UserRow) -> Result<Self, Self::Error> {
        Ok(UserNode {
            id: row.id,
            role: row.role.parse()?,
            parent_id: row.parent_id,
            created_at: row.created_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct PaymentRow {
    id: Uuid,
    order_id: String,
    gateway_payment_id: Option<String>,
    client_id: i64,
    plan_id: i64,
    amount: i64,
    fee: i64,
    currency: String,
    status: String,
    created_at: DateTime<Utc>,
    captured_at: Option<DateTime<Utc>>,
    distributed_at: Option<DateTime<Utc>>,
}

impl TryFrom<PaymentRow> for Payment {
    type Error = IncomeError;

    fn try_from(row: PaymentRow) -> Result<Self, Self::Error> {
        Ok(Payment {
            id: row.id,
            order_id: row.order_id,
            gateway_payment_id: row.gateway_payment_id,
            client_id: row.client_id,
            plan_id: row.plan_id,
            amount: row.amount,
            fee: row.fee,
            currency: row.currency,
            status: row.status.parse()?,
            created_at: row.created_at,
            captured_at: row.captured_at,
            distributed_at: row.distributed_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct RuleRow {
    referral_type: String,
    total_downline: i32,
    layer: i32,
    commission_percentage: f64,
}

impl TryFrom<RuleRow> for CommissionRule {
    type Error = IncomeError;

    fn try_from(row: RuleRow) -> Result<Self, Self::Error> {
        Ok(CommissionRule {
            referral_type: row.referral_type.parse()?,
            total_downline: row.total_downline,
            layer: row.layer,
            commission_percentage: row.commission_percentage,
        })
    }
}

fn has_code(e: &sqlx::Error, code: &str) -> bool {
    if let sqlx::Error::Database(db_err) = e {
        return db_err.code().as_deref() == Some(code);
    }
    false
}

fn payments<I>(rows: I) -> Result<Vec<Payment>, IncomeError>
where
    I: IntoIterator<Item = PaymentRow>,
{
    rows.into_iter().map(Payment::try_from).collect()
}

impl PgStore {
    pub fn new(pool: PgPool, max_tree_depth: usize) -> Self {
        Self {
            pool,
            max_tree_depth,
        }
    }

    /// Applies the bundled schema migrations.
    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    async fn lock_payment(
        tx: &mut Transaction<'_, Postgres>,
        id: Uuid,
    ) -> Result<Payment, IncomeError> {
        let row = sqlx::query_as::<_, PaymentRow>(&format!(
            "SELECT {PAYMENT_COLUMNS} FROM payments WHERE id = $1 FOR UPDATE"
        ))
        .bind(id)
        .fetch_optional(tx.as_mut())
        .await?
        .ok_or_else(|| IncomeError::PaymentNotFound(id.to_string()))?;
        row.try_into()
    }

    async fn insert_income(
        tx: &mut Transaction<'_, Postgres>,
        record: &IncomeRecord,
    ) -> Result<(), IncomeError> {
        sqlx::query(&format!(
            "INSERT INTO incomes ({INCOME_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)"
        ))
        .bind(record.id)
        .bind(record.user_id)
        .bind(record.payment_id)
        .bind(record.layer)
        .bind(record.amount)
        .bind(record.commission_percentage)
        .bind(record.fee)
        .bind(record.created_at)
        .execute(tx.as_mut())
        .await
        .map_err(|e| {
            if has_code(&e, PG_UNIQUE_VIOLATION) {
                IncomeError::DuplicateDistribution(record.payment_id)
            } else {
                e.into()
            }
        })?;
        Ok(())
    }
}

#[async_trait]
impl Store for PgStore {
    async fn get_user(&self, id: UserId) -> Result<Option<UserNode>, IncomeError> {
        sqlx::query_as::<_, UserRow>(&format!("SELECT {USER_COLUMNS} FROM users WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(UserNode::try_from)
            .transpose()
    }

    async fn ancestor_chain(&self, id: UserId, limit: usize) -> Result<Vec<UserId>, IncomeError> {
        // One row past the depth bound is enough to tell a long chain from a corrupt one.
        let steps = i32::try_from(limit.min(self.max_tree_depth.saturating_add(1)))
            .unwrap_or(i32::MAX);
        let rows = sqlx::query_as::<_, UserRow>(ANCESTOR_WALK)
            .bind(id)
            .bind(steps)
            .fetch_all(&self.pool)
            .await?;
        let nodes = rows
            .into_iter()
            .map(UserNode::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        Hierarchy::from_nodes(nodes, self.max_tree_depth).ancestor_chain(id, limit)
    }

    async fn subtree(&self, id: UserId) -> Result<HashSet<UserId>, IncomeError> {
        let ids = sqlx::query_scalar::<_, i64>(SUBTREE_WALK)
            .bind(id)
            .fetch_all(&self.pool)
            .await?;
        Ok(ids.into_iter().collect())
    }

    async fn insert_user(&self, user: NewUser) -> Result<UserNode, IncomeError> {
        let row = sqlx::query_as::<_, UserRow>(&format!(
            "INSERT INTO users (role, parent_id) VALUES ($1, $2) RETURNING {USER_COLUMNS}"
        ))
        .bind(user.role.as_str())
        .bind(user.parent_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match user.parent_id {
            Some(parent_id) if has_code(&e, PG_FOREIGN_KEY_VIOLATION) => {
                IncomeError::UserNotFound(parent_id)
            }
            _ => e.into(),
        })?;
        row.try_into()
    }

    async fn setting(&self, key: &str) -> Result<Option<String>, IncomeError> {
        let value = sqlx::query_scalar::<_, String>("SELECT value FROM settings WHERE key = $1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(value)
    }

    async fn put_setting(&self, key: &str, value: &str) -> Result<(), IncomeError> {
        sqlx::query(
            "INSERT INTO settings (key, value) VALUES ($1, $2)
             ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn commission_table(&self) -> Result<CommissionTable, IncomeError> {
        let rows = sqlx::query_as::<_, RuleRow>(
            "SELECT referral_type, total_downline, layer, commission_percentage
             FROM commission_rules",
        )
        .fetch_all(&self.pool)
        .await?;
        let rules = rows
            .into_iter()
            .map(CommissionRule::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        CommissionTable::from_rules(rules)
    }

    async fn put_rule_set(&self, set: &RuleSet) -> Result<(), IncomeError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM commission_rules WHERE referral_type = $1 AND total_downline = $2")
            .bind(set.referral_type().as_str())
            .bind(set.total_downline())
            .execute(tx.as_mut())
            .await?;
        for rule in set.rules() {
            sqlx::query(
                "INSERT INTO commission_rules
                 (referral_type, total_downline, layer, commission_percentage)
                 VALUES ($1, $2, $3, $4)",
            )
            .bind(rule.referral_type.as_str())
            .bind(rule.total_downline)
            .bind(rule.layer)
            .bind(rule.commission_percentage)
            .execute(tx.as_mut())
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn create_payment(&self, payment: NewPayment) -> Result<Payment, IncomeError> {
        let order_id = payment
            .order_id
            .unwrap_or_else(|| format!("order_{}", Uuid::new_v4().simple()));
        let client_id = payment.client_id;
        let row = sqlx::query_as::<_, PaymentRow>(&format!(
            "INSERT INTO payments (id, order_id, client_id, plan_id, amount, fee, currency, status)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8) RETURNING {PAYMENT_COLUMNS}"
        ))
        .bind(Uuid::new_v4())
        .bind(&order_id)
        .bind(payment.client_id)
        .bind(payment.plan_id)
        .bind(payment.amount)
        .bind(payment.fee)
        .bind(&payment.currency)
        .bind(PaymentStatus::Created.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            if has_code(&e, PG_UNIQUE_VIOLATION) {
                IncomeError::InvalidInput(format!("order {order_id} already has a payment"))
            } else if has_code(&e, PG_FOREIGN_KEY_VIOLATION) {
                IncomeError::UserNotFound(client_id)
            } else {
                e.into()
            }
        })?;
        row.try_into()
    }

    async fn get_payment(&self, id: Uuid) -> Result<Option<Payment>, IncomeError> {
        sqlx::query_as::<_, PaymentRow>(&format!(
            "SELECT {PAYMENT_COLUMNS} FROM payments WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .map(Payment::try_from)
        .transpose()
    }

    async fn get_payment_by_order(&self, order_id: &str) -> Result<Option<Payment>, IncomeError> {
        sqlx::query_as::<_, PaymentRow>(&format!(
            "SELECT {PAYMENT_COLUMNS} FROM payments WHERE order_id = $1"
        ))
        .bind(order_id)
        .fetch_optional(&self.pool)
        .await?
        .map(Payment::try_from)
        .transpose()
    }

    async fn finalize_payment(
        &self,
        id: Uuid,
        status: PaymentStatus,
        gateway_payment_id: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<Payment, IncomeError> {
        let mut tx = self.pool.begin().await?;
        let current = Self::lock_payment(&mut tx, id).await?;
        if !current.status.transition(status)? {
            tx.commit().await?;
            return Ok(current);
        }

        let captured_at = (status == PaymentStatus::Captured).then_some(at);
        let row = sqlx::query_as::<_, PaymentRow>(&format!(
            "UPDATE payments
             SET status = $2,
                 gateway_payment_id = COALESCE($3, gateway_payment_id),
                 captured_at = $4
             WHERE id = $1
             RETURNING {PAYMENT_COLUMNS}"
        ))
        .bind(id)
        .bind(status.as_str())
        .bind(gateway_payment_id)
        .bind(captured_at)
        .fetch_one(tx.as_mut())
        .await?;
        tx.commit().await?;
        row.try_into()
    }

    async fn pending_distributions(&self) -> Result<Vec<Payment>, IncomeError> {
        let rows = sqlx::query_as::<_, PaymentRow>(&format!(
            "SELECT {PAYMENT_COLUMNS} FROM payments
             WHERE status = $1 AND distributed_at IS NULL
             ORDER BY captured_at"
        ))
        .bind(PaymentStatus::Captured.as_str())
        .fetch_all(&self.pool)
        .await?;
        payments(rows)
    }

    async fn record_distribution(
        &self,
        payment_id: Uuid,
        shares: &[IncomeShare],
    ) -> Result<Vec<IncomeRecord>, IncomeError> {
        let mut tx = self.pool.begin().await?;
        let payment = Self::lock_payment(&mut tx, payment_id).await?;
        if payment.distributed_at.is_some() {
            return Err(IncomeError::DuplicateDistribution(payment_id));
        }

        let now = Utc::now();
        let records: Vec<IncomeRecord> = shares
            .iter()
            .map(|share| IncomeRecord::from_share(payment_id, share, now))
            .collect();
        for record in &records {
            Self::insert_income(&mut tx, record).await?;
        }

        sqlx::query("UPDATE payments SET distributed_at = $2 WHERE id = $1")
            .bind(payment_id)
            .bind(now)
            .execute(tx.as_mut())
            .await?;
        tx.commit().await?;
        debug!(%payment_id, rows = records.len(), "income rows committed");
        Ok(records)
    }

    async fn income_for_payment(&self, payment_id: Uuid) -> Result<Vec<IncomeRecord>, IncomeError> {
        let records = sqlx::query_as::<_, IncomeRecord>(&format!(
            "SELECT {INCOME_COLUMNS} FROM incomes WHERE payment_id = $1 ORDER BY layer"
        ))
        .bind(payment_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    async fn income_for_payments(
        &self,
        payment_ids: &HashSet<Uuid>,
    ) -> Result<Vec<IncomeRecord>, IncomeError> {
        let ids: Vec<Uuid> = payment_ids.iter().copied().collect();
        let records = sqlx::query_as::<_, IncomeRecord>(&format!(
            "SELECT {INCOME_COLUMNS} FROM incomes WHERE payment_id = ANY($1)"
        ))
        .bind(ids)
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    async fn captured_payments(
        &self,
        payers: &HashSet<UserId>,
        period: Period,
    ) -> Result<Vec<Payment>, IncomeError> {
        let payer_ids: Vec<i64> = payers.iter().copied().collect();
        let rows = sqlx::query_as::<_, PaymentRow>(&format!(
            "SELECT {PAYMENT_COLUMNS} FROM payments
             WHERE status = $1
               AND client_id = ANY($2)
               AND captured_at >= $3 AND captured_at < $4
             ORDER BY captured_at DESC, id"
        ))
        .bind(PaymentStatus::Captured.as_str())
        .bind(payer_ids)
        .bind(period.start)
        .bind(period.end)
        .fetch_all(&self.pool)
        .await?;
        payments(rows)
    }
}
