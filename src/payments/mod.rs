//! Payment gateways and the background status monitor.

mod mock;
mod monitor;
mod yookassa;

pub use mock::MockPaymentProvider;
pub use monitor::{CheckReport, PaymentMonitor};
pub use yookassa::YooKassaProvider;

use crate::config::{PaymentProviderKind, Settings};
use crate::domain::PaymentStatus;
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

/// Errors of payment gateways
#[derive(Debug, Error)]
pub enum PaymentError {
    /// Gateway rejected the request
    #[error("Payment API error: {0}")]
    Api(String),
    /// Gateway unreachable
    #[error("Network error: {0}")]
    Network(String),
    /// Unexpected response shape
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
    /// Missing credentials
    #[error("Missing configuration: {0}")]
    MissingConfig(String),
}

/// Invoice created at the gateway
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invoice {
    /// Page where the user pays
    pub confirmation_url: String,
    /// Gateway payment ID used for status checks
    pub payment_id: String,
}

/// Interface for payment gateways
#[async_trait]
pub trait PaymentProvider: Send + Sync {
    /// Registers an invoice and returns the payment link
    async fn create_invoice(
        &self,
        user_id: i64,
        plan_code: &str,
        amount_rub: u32,
        description: &str,
    ) -> Result<Invoice, PaymentError>;

    /// Current status of a payment
    async fn check_status(&self, payment_id: &str) -> Result<PaymentStatus, PaymentError>;

    /// Name stored with each payment row
    fn name(&self) -> &'static str;
}

/// Builds the configured payment provider.
///
/// # Errors
///
/// Returns `PaymentError::MissingConfig` if YooKassa credentials are absent.
pub fn build_provider(settings: &Settings) -> Result<Arc<dyn PaymentProvider>, PaymentError> {
    match settings.payment_provider {
        PaymentProviderKind::Yookassa => {
            let shop_id = settings
                .yookassa_shop_id
                .clone()
                .ok_or_else(|| PaymentError::MissingConfig("YOOKASSA_SHOP_ID".to_string()))?;
            let secret = settings
                .yookassa_secret_key
                .clone()
                .ok_or_else(|| PaymentError::MissingConfig("YOOKASSA_SECRET_KEY".to_string()))?;
            Ok(Arc::new(YooKassaProvider::new(
                shop_id,
                secret,
                settings.yookassa_invoice_email.clone(),
                settings.yookassa_return_url.clone(),
            )))
        }
        PaymentProviderKind::Mock => Ok(Arc::new(MockPaymentProvider::new())),
    }
}
