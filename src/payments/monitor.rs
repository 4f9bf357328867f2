//! Background polling of pending payments.
//!
//! Every pass asks the gateway for the status of each pending payment and
//! settles final ones. Settling is a compare-and-set on the payment row
//! committed together with the plan write, so a plan is activated at most
//! once even when the periodic pass and an admin-triggered pass overlap.

use super::PaymentProvider;
use crate::config::{find_plan, Settings};
use crate::domain::PaymentStatus;
use crate::services::{apply_referral_bonus, paid_subscription, Notifier};
use crate::storage::{Payment, StorageError, StorageProvider};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Outcome of one monitoring pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CheckReport {
    /// Payments queried at the gateway
    pub checked: usize,
    /// Plans activated in this pass
    pub activated: usize,
    /// Payments moved to canceled or expired
    pub failed: usize,
    /// Gateway or settlement errors
    pub errors: usize,
}

/// Polls the gateway and activates paid plans
pub struct PaymentMonitor {
    store: Arc<dyn StorageProvider>,
    provider: Arc<dyn PaymentProvider>,
    notifier: Arc<dyn Notifier>,
    settings: Arc<Settings>,
}

fn failure_reason(status: PaymentStatus) -> &'static str {
    match status {
        PaymentStatus::Expired => "истёк срок оплаты",
        _ => "платёж отменён",
    }
}

impl PaymentMonitor {
    /// Create a new monitor
    #[must_use]
    pub fn new(
        store: Arc<dyn StorageProvider>,
        provider: Arc<dyn PaymentProvider>,
        notifier: Arc<dyn Notifier>,
        settings: Arc<Settings>,
    ) -> Self {
        Self {
            store,
            provider,
            notifier,
            settings,
        }
    }

    /// Runs a pass every `payment_check_interval_min` minutes until cancelled.
    ///
    /// The first pass starts immediately.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let period = Duration::from_secs_f64(self.settings.payment_check_interval_min * 60.0);
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(
            interval_min = self.settings.payment_check_interval_min,
            provider = self.provider.name(),
            "Payment monitor started"
        );

        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    info!("Payment monitor stopped");
                    break;
                }
                _ = ticker.tick() => {
                    match self.check_pending().await {
                        Ok(report) if report.checked > 0 => info!(?report, "Payment check finished"),
                        Ok(_) => debug!("No pending payments"),
                        Err(e) => error!("Payment check failed: {e}"),
                    }
                }
            }
        }
    }

    /// Checks every pending payment once.
    ///
    /// # Errors
    ///
    /// Returns a `StorageError` if pending payments cannot be loaded.
    /// Per-payment failures are counted in the report instead.
    pub async fn check_pending(&self) -> Result<CheckReport, StorageError> {
        let mut report = CheckReport::default();

        for payment in self.store.pending_payments().await? {
            if payment.provider != self.provider.name() {
                debug!(
                    payment_id = payment.id,
                    provider = %payment.provider,
                    "Skipping payment of another provider"
                );
                continue;
            }

            report.checked += 1;
            let status = match self.provider.check_status(&payment.provider_payment_id).await {
                Ok(status) => status,
                Err(e) => {
                    warn!(payment_id = payment.id, "Status request failed: {e}");
                    report.errors += 1;
                    continue;
                }
            };

            match status {
                PaymentStatus::Succeeded => match self.settle_success(&payment).await {
                    Ok(true) => report.activated += 1,
                    Ok(false) => {}
                    Err(e) => {
                        error!(payment_id = payment.id, "Failed to settle payment: {e}");
                        report.errors += 1;
                    }
                },
                PaymentStatus::Canceled | PaymentStatus::Expired => {
                    match self.settle_failure(&payment, status).await {
                        Ok(true) => report.failed += 1,
                        Ok(false) => {}
                        Err(e) => {
                            error!(payment_id = payment.id, "Failed to close payment: {e}");
                            report.errors += 1;
                        }
                    }
                }
                PaymentStatus::Pending | PaymentStatus::WaitingForCapture => {}
            }
        }

        Ok(report)
    }

    /// Returns false if another pass already settled the payment.
    ///
    /// The status change and the plan write commit together, so a failed
    /// activation leaves the payment pending for the next pass.
    async fn settle_success(&self, payment: &Payment) -> anyhow::Result<bool> {
        let now = Utc::now();
        let subscription =
            paid_subscription(self.store.as_ref(), payment.user_id, &payment.plan_code, now)
                .await?;
        if !self
            .store
            .settle_payment(payment.id, subscription.clone())
            .await?
        {
            return Ok(false);
        }

        info!(
            payment_id = payment.id,
            user_id = payment.user_id,
            plan = %payment.plan_code,
            expires_at = ?subscription.expires_at,
            "Payment confirmed, plan activated"
        );

        if let Err(e) = self.reward_referrer(payment.user_id, now).await {
            error!(payment_id = payment.id, "Referral bonus failed: {e}");
        }

        let title = find_plan(&payment.plan_code).map_or(payment.plan_code.as_str(), |p| p.title);
        if let Some(expires_at) = subscription.expires_at {
            self.notifier
                .subscription_activated(payment.user_id, title, expires_at)
                .await;
        }
        Ok(true)
    }

    async fn reward_referrer(&self, user_id: i64, now: DateTime<Utc>) -> anyhow::Result<()> {
        let referrer = self
            .store
            .get_user(user_id)
            .await?
            .and_then(|u| u.referred_by);
        if let Some(referrer) = referrer {
            apply_referral_bonus(self.store.as_ref(), &self.settings, referrer, now).await?;
        }
        Ok(())
    }

    async fn settle_failure(
        &self,
        payment: &Payment,
        status: PaymentStatus,
    ) -> Result<bool, StorageError> {
        let won = self
            .store
            .transition_payment(payment.id, PaymentStatus::Pending, status)
            .await?;
        if won {
            info!(payment_id = payment.id, %status, "Payment closed");
            self.notifier
                .payment_failed(payment.user_id, failure_reason(status))
                .await;
        }
        Ok(won)
    }
}
