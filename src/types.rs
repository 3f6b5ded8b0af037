use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::IncomeError;

/// Identifier of a user node.
pub type UserId = i64;

/// The role of a user. Also used as the referral type when looking up commission rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserRole {
    Admin,
    Dietitian,
    Client,
    CorporateClient,
}

impl UserRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserRole::Admin => "admin",
            UserRole::Dietitian => "dietitian",
            UserRole::Client => "client",
            UserRole::CorporateClient => "corporate_client",
        }
    }
}

impl fmt::Display for UserRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UserRole {
    type Err = IncomeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "admin" => Ok(UserRole::Admin),
            "dietitian" => Ok(UserRole::Dietitian),
            "client" => Ok(UserRole::Client),
            "corporate_client" => Ok(UserRole::CorporateClient),
            other => Err(IncomeError::InvalidInput(format!("unknown role `{other}`"))),
        }
    }
}

/// A user in the referral tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserNode {
    /// The ID of the user.
    pub id: UserId,
    /// The role of the user.
    pub role: UserRole,
    /// The user who recruited this user. `None` for roots.
    pub parent_id: Option<UserId>,
    /// The timestamp when the user registered.
    pub created_at: DateTime<Utc>,
}

/// The request to register a new user.
#[derive(Debug, Clone, Deserialize)]
pub struct NewUser {
    /// The role of the new user.
    pub role: UserRole,
    /// The recruiting user, if any.
    pub parent_id: Option<UserId>,
}

/// Lifecycle state of a payment. `Captured` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Created,
    Captured,
    Failed,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Created => "created",
            PaymentStatus::Captured => "captured",
            PaymentStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, PaymentStatus::Created)
    }

    /// Checks a status change. Returns `Ok(false)` when `next` equals the current
    /// terminal status (a repeated callback), `Ok(true)` when the change applies.
    pub fn transition(self, next: PaymentStatus) -> Result<bool, IncomeError> {
        match (self, next) {
            (PaymentStatus::Created, PaymentStatus::Captured | PaymentStatus::Failed) => Ok(true),
            (current, next) if current == next && current.is_terminal() => Ok(false),
            (from, to) => Err(IncomeError::InvalidTransition { from, to }),
        }
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PaymentStatus {
    type Err = IncomeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(PaymentStatus::Created),
            "captured" => Ok(PaymentStatus::Captured),
            "failed" => Ok(PaymentStatus::Failed),
            other => Err(IncomeError::InvalidInput(format!(
                "unknown payment status `{other}`"
            ))),
        }
    }
}

/// A payment made by a client for a plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payment {
    /// The ID of the payment.
    pub id: Uuid,
    /// The gateway order this payment was created for.
    pub order_id: String,
    /// The gateway's payment reference, known once the callback arrives.
    pub gateway_payment_id: Option<String>,
    /// The paying user.
    pub client_id: UserId,
    /// The purchased plan.
    pub plan_id: i64,
    /// The amount in minor currency units.
    pub amount: i64,
    /// The gateway fee in minor currency units.
    pub fee: i64,
    /// ISO currency code.
    pub currency: String,
    /// The payment status.
    pub status: PaymentStatus,
    /// The timestamp when the checkout was initiated.
    pub created_at: DateTime<Utc>,
    /// The timestamp when the payment was captured.
    pub captured_at: Option<DateTime<Utc>>,
    /// Set once the commission distribution for this payment was written.
    pub distributed_at: Option<DateTime<Utc>>,
}

impl Payment {
    /// A captured payment whose distribution has not been written yet.
    pub fn is_distribution_pending(&self) -> bool {
        self.status == PaymentStatus::Captured && self.distributed_at.is_none()
    }
}

/// The request to create a payment at checkout initiation.
#[derive(Debug, Clone, Deserialize)]
pub struct NewPayment {
    /// The gateway order. Generated when absent.
    pub order_id: Option<String>,
    /// The paying user.
    pub client_id: UserId,
    /// The purchased plan.
    pub plan_id: i64,
    /// The amount in minor currency units.
    pub amount: i64,
    /// The gateway fee in minor currency units.
    #[serde(default)]
    pub fee: i64,
    /// ISO currency code.
    pub currency: String,
}

impl NewPayment {
    pub fn validate(&self) -> Result<(), IncomeError> {
        if self.amount < 0 {
            return Err(IncomeError::InvalidInput("amount must be >= 0".into()));
        }
        if self.fee < 0 || self.fee > self.amount {
            return Err(IncomeError::InvalidInput(
                "fee must be between 0 and amount".into(),
            ));
        }
        if self.currency.trim().is_empty() {
            return Err(IncomeError::InvalidInput("currency is required".into()));
        }
        Ok(())
    }
}

/// One row of the commission table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommissionRule {
    /// The referral type the rule applies to.
    pub referral_type: UserRole,
    /// The configured recruiting depth selecting this row set.
    pub total_downline: i32,
    /// Distance from the payer: 0 is the direct recruiter.
    pub layer: i32,
    /// Share of the payment, in percent.
    pub commission_percentage: f64,
}

/// A computed share of a payment, before it is persisted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IncomeShare {
    /// The earning ancestor.
    pub user_id: UserId,
    /// The ancestor's layer on this payment.
    pub layer: i32,
    /// The earned amount in minor units.
    pub amount: i64,
    /// The rate applied.
    pub commission_percentage: f64,
    /// The share of the payment fee allocated to this layer.
    pub fee: i64,
}

/// A persisted income ledger entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct IncomeRecord {
    /// The ID of the record.
    pub id: Uuid,
    /// The earning user.
    pub user_id: UserId,
    /// The payment this income comes from.
    pub payment_id: Uuid,
    /// The user's layer on the payment.
    pub layer: i32,
    /// The earned amount in minor units.
    pub amount: i64,
    /// The rate applied.
    pub commission_percentage: f64,
    /// The allocated fee in minor units.
    pub fee: i64,
    /// The timestamp when the record was written.
    pub created_at: DateTime<Utc>,
}

impl IncomeRecord {
    pub fn from_share(payment_id: Uuid, share: &IncomeShare, created_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id: share.user_id,
            payment_id,
            layer: share.layer,
            amount: share.amount,
            commission_percentage: share.commission_percentage,
            fee: share.fee,
            created_at,
        }
    }
}

/// Dashboard rollup for one user and period.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncomeSummary {
    pub total_clients: i64,
    pub total_income: i64,
    pub total_fee: i64,
    pub personal_income: i64,
    pub downline_income: i64,
}

/// A payment in a user's subtree, annotated with that user's own share.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubtreePayment {
    #[serde(flatten)]
    pub payment: Payment,
    /// The requesting user's layer on this payment, if they earned from it.
    pub my_layer: Option<i32>,
    /// The requesting user's income from this payment, if any.
    pub my_income: Option<i64>,
}

/// Half-open time window `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct Period {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl Period {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.start <= at && at < self.end
    }
}
