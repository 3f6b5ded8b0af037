//! Checkout initiation and the payment gateway callback.

use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::{info, warn};

use crate::distribution::distribute_commission;
use crate::error::IncomeError;
use crate::store::Store;
use crate::types::{IncomeRecord, NewPayment, Payment, PaymentStatus};

type HmacSha256 = Hmac<Sha256>;

/// The gateway's confirmation of a payment attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentConfirmation {
    /// The order the checkout was created with.
    pub order_id: String,
    /// The gateway's payment reference.
    pub payment_id: String,
    /// The amount the gateway charged, in minor units.
    pub amount: i64,
    /// Hex HMAC-SHA256 of `order_id|payment_id`.
    pub signature: String,
    /// The final status reported by the gateway.
    pub status: PaymentStatus,
}

/// What a confirmation did.
#[derive(Debug, Serialize)]
pub struct ConfirmationOutcome {
    pub payment: Payment,
    pub income: Vec<IncomeRecord>,
}

fn signing_mac(secret: &str, order_id: &str, payment_id: &str) -> Result<HmacSha256, IncomeError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| IncomeError::InvalidSignature)?;
    mac.update(format!("{order_id}|{payment_id}").as_bytes());
    Ok(mac)
}

/// Signs `order_id|payment_id` with the shared gateway secret, hex encoded.
pub fn sign(secret: &str, order_id: &str, payment_id: &str) -> Result<String, IncomeError> {
    let mac = signing_mac(secret, order_id, payment_id)?;
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Checks the confirmation's signature in constant time.
pub fn verify_signature(secret: &str, confirmation: &PaymentConfirmation) -> Result<(), IncomeError> {
    let expected = hex::decode(confirmation.signature.trim())
        .map_err(|_| IncomeError::InvalidSignature)?;
    signing_mac(secret, &confirmation.order_id, &confirmation.payment_id)?
        .verify_slice(&expected)
        .map_err(|_| IncomeError::InvalidSignature)
}

/// Records a checkout in `created` state.
pub async fn create_payment(store: &dyn Store, payment: NewPayment) -> Result<Payment, IncomeError> {
    payment.validate()?;
    if store.get_user(payment.client_id).await?.is_none() {
        return Err(IncomeError::UserNotFound(payment.client_id));
    }
    let created = store.create_payment(payment).await?;
    info!(payment_id = %created.id, order_id = %created.order_id, amount = created.amount, "payment created");
    Ok(created)
}

/// Applies a verified gateway confirmation and distributes captured payments.
///
/// Redelivery of the same confirmation is safe: finalization is a no-op and
/// distribution returns the records already written.
pub async fn handle_payment_confirmation(
    store: &dyn Store,
    secret: &str,
    confirmation: PaymentConfirmation,
) -> Result<ConfirmationOutcome, IncomeError> {
    if let Err(e) = verify_signature(secret, &confirmation) {
        warn!(order_id = %confirmation.order_id, "rejected payment confirmation with bad signature");
        return Err(e);
    }

    let payment = store
        .get_payment_by_order(&confirmation.order_id)
        .await?
        .ok_or_else(|| IncomeError::PaymentNotFound(confirmation.order_id.clone()))?;
    if confirmation.amount != payment.amount {
        return Err(IncomeError::AmountMismatch {
            expected: payment.amount,
            actual: confirmation.amount,
        });
    }

    let payment = store
        .finalize_payment(
            payment.id,
            confirmation.status,
            Some(&confirmation.payment_id),
            Utc::now(),
        )
        .await?;
    info!(payment_id = %payment.id, status = %payment.status, "payment finalized");

    let income = match payment.status {
        PaymentStatus::Captured => distribute_commission(store, payment.id).await?,
        _ => Vec::new(),
    };
    Ok(ConfirmationOutcome { payment, income })
}
