//! Invoice creation for plan purchases.

use super::subscriptions::{preview_plan_change, PlanChange, SubscriptionError};
use crate::config::find_plan;
use crate::payments::{Invoice, PaymentError, PaymentProvider};
use crate::storage::{NewPayment, Payment, StorageError, StorageProvider};
use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::info;

/// Errors of the purchase flow
#[derive(Debug, Error)]
pub enum PurchaseError {
    /// Plan code missing from the catalog
    #[error("Unknown plan: {0}")]
    UnknownPlan(String),
    /// Gateway refused or failed to create the invoice
    #[error(transparent)]
    Gateway(#[from] PaymentError),
    /// Underlying storage failure
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl From<SubscriptionError> for PurchaseError {
    fn from(err: SubscriptionError) -> Self {
        match err {
            SubscriptionError::UnknownPlan(code) => Self::UnknownPlan(code),
            SubscriptionError::Storage(e) => Self::Storage(e),
        }
    }
}

/// Invoice registered for a user, with what it will give once paid
#[derive(Debug, Clone, PartialEq)]
pub struct Purchase {
    pub invoice: Invoice,
    pub payment: Payment,
    /// Proration preview computed at invoice time
    pub change: PlanChange,
}

/// Creates an invoice and records it as a pending payment.
///
/// Nothing is stored if the gateway fails.
///
/// # Errors
///
/// Returns `UnknownPlan` for codes outside the catalog, `Gateway` when the
/// provider fails and `Storage` on database failures.
pub async fn create_purchase(
    store: &dyn StorageProvider,
    provider: &dyn PaymentProvider,
    user_id: i64,
    plan_code: &str,
    now: DateTime<Utc>,
) -> Result<Purchase, PurchaseError> {
    let plan =
        find_plan(plan_code).ok_or_else(|| PurchaseError::UnknownPlan(plan_code.to_string()))?;
    let change = preview_plan_change(store, user_id, plan.code, now).await?;

    let description = format!("Оплата плана {}", plan.title);
    let invoice = provider
        .create_invoice(user_id, plan.code, plan.price_rub, &description)
        .await?;

    let payment = store
        .insert_payment(NewPayment {
            user_id,
            provider: provider.name().to_string(),
            provider_payment_id: invoice.payment_id.clone(),
            plan_code: plan.code.to_string(),
            amount_rub: plan.price_rub,
        })
        .await?;

    info!(
        user_id,
        plan = plan.code,
        payment_id = payment.id,
        provider = provider.name(),
        "Invoice created"
    );
    Ok(Purchase {
        invoice,
        payment,
        change,
    })
}
