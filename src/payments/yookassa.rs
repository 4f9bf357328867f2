//! YooKassa REST API v3 client with manual status polling (no webhooks).

use super::{Invoice, PaymentError, PaymentProvider};
use crate::domain::PaymentStatus;
use crate::llm::http_utils::{create_http_client, summarize_error_body};
use async_trait::async_trait;
use reqwest::{Client as HttpClient, RequestBuilder};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{error, info};
use uuid::Uuid;

const API_BASE: &str = "https://api.yookassa.ru/v3";
const HTTP_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Deserialize)]
struct Confirmation {
    confirmation_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PaymentResponse {
    id: String,
    status: String,
    confirmation: Option<Confirmation>,
}

/// YooKassa gateway authenticated with `shop_id:secret_key`
pub struct YooKassaProvider {
    http_client: HttpClient,
    api_base: String,
    shop_id: String,
    secret_key: String,
    receipt_email: Option<String>,
    return_url: String,
}

impl YooKassaProvider {
    /// Create a new provider
    #[must_use]
    pub fn new(
        shop_id: String,
        secret_key: String,
        receipt_email: Option<String>,
        return_url: String,
    ) -> Self {
        Self {
            http_client: create_http_client(HTTP_TIMEOUT_SECS),
            api_base: API_BASE.to_string(),
            shop_id,
            secret_key,
            receipt_email,
            return_url,
        }
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        request.basic_auth(&self.shop_id, Some(&self.secret_key))
    }

    async fn send(request: RequestBuilder) -> Result<PaymentResponse, PaymentError> {
        let response = request
            .send()
            .await
            .map_err(|e| PaymentError::Network(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let summary = summarize_error_body(status, &body);
            error!(%status, "YooKassa request failed: {summary}");
            return Err(PaymentError::Api(summary));
        }
        response
            .json()
            .await
            .map_err(|e| PaymentError::InvalidResponse(e.to_string()))
    }
}

/// Request body for `POST /payments`
fn invoice_body(
    user_id: i64,
    plan_code: &str,
    amount_rub: u32,
    description: &str,
    receipt_email: Option<&str>,
    return_url: &str,
) -> Value {
    let amount = json!({"value": format!("{amount_rub}.00"), "currency": "RUB"});
    let description = if description.is_empty() {
        format!("План {plan_code}")
    } else {
        description.to_string()
    };

    let mut body = json!({
        "amount": amount,
        "confirmation": {"type": "redirect", "return_url": return_url},
        "capture": true,
        "description": description,
        "metadata": {"user_id": user_id.to_string(), "plan_code": plan_code}
    });

    if let Some(email) = receipt_email {
        body["receipt"] = json!({
            "customer": {"email": email},
            "items": [{
                "description": description,
                "quantity": "1.00",
                "amount": amount,
                "vat_code": "1",
                "payment_mode": "full_payment",
                "payment_subject": "commodity"
            }]
        });
    }
    body
}

#[async_trait]
impl PaymentProvider for YooKassaProvider {
    async fn create_invoice(
        &self,
        user_id: i64,
        plan_code: &str,
        amount_rub: u32,
        description: &str,
    ) -> Result<Invoice, PaymentError> {
        let body = invoice_body(
            user_id,
            plan_code,
            amount_rub,
            description,
            self.receipt_email.as_deref(),
            &self.return_url,
        );
        let request = self
            .authorized(self.http_client.post(format!("{}/payments", self.api_base)))
            .header("Idempotence-Key", Uuid::new_v4().to_string())
            .json(&body);

        let payment = Self::send(request).await?;
        let confirmation_url = payment
            .confirmation
            .and_then(|c| c.confirmation_url)
            .ok_or_else(|| PaymentError::InvalidResponse("missing confirmation_url".to_string()))?;

        info!(user_id, plan_code, payment_id = %payment.id, "YooKassa invoice created");
        Ok(Invoice {
            confirmation_url,
            payment_id: payment.id,
        })
    }

    async fn check_status(&self, payment_id: &str) -> Result<PaymentStatus, PaymentError> {
        let request = self.authorized(
            self.http_client
                .get(format!("{}/payments/{payment_id}", self.api_base)),
        );
        let payment = Self::send(request).await?;
        payment
            .status
            .parse()
            .map_err(|e: crate::domain::ParseError| PaymentError::InvalidResponse(e.to_string()))
    }

    fn name(&self) -> &'static str {
        "yookassa"
    }
}
