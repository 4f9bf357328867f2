use super::{Invoice, PaymentError, PaymentProvider};
use crate::domain::PaymentStatus;
use async_trait::async_trait;
use uuid::Uuid;

/// Development gateway: links point nowhere and every payment succeeds on
/// the first status check
#[derive(Debug, Default, Clone, Copy)]
pub struct MockPaymentProvider;

impl MockPaymentProvider {
    /// Create a new mock provider
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

#[async_trait]
impl PaymentProvider for MockPaymentProvider {
    async fn create_invoice(
        &self,
        user_id: i64,
        plan_code: &str,
        amount_rub: u32,
        _description: &str,
    ) -> Result<Invoice, PaymentError> {
        Ok(Invoice {
            confirmation_url: format!(
                "https://example.com/pay?user={user_id}&plan={plan_code}&sum={amount_rub}"
            ),
            payment_id: format!("mock-{}", Uuid::new_v4()),
        })
    }

    async fn check_status(&self, _payment_id: &str) -> Result<PaymentStatus, PaymentError> {
        Ok(PaymentStatus::Succeeded)
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_invoice_link() {
        let provider = MockPaymentProvider::new();
        let invoice = provider
            .create_invoice(7, "pro_plus", 1290, "Оплата плана Pro Plus")
            .await
            .expect("invoice");
        assert_eq!(
            invoice.confirmation_url,
            "https://example.com/pay?user=7&plan=pro_plus&sum=1290"
        );
        assert!(invoice.payment_id.starts_with("mock-"));

        let other = provider
            .create_invoice(7, "pro_plus", 1290, "")
            .await
            .expect("invoice");
        assert_ne!(invoice.payment_id, other.payment_id);
        assert_eq!(
            provider.check_status(&invoice.payment_id).await.ok(),
            Some(PaymentStatus::Succeeded)
        );
    }
}
