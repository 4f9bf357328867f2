//! Business rules on top of [`crate::storage`].

pub mod conversation;
pub mod notifications;
pub mod purchases;
pub mod referrals;
pub mod safety;
pub mod subscriptions;
pub mod usage;

pub use conversation::{
    active_session, current_mode, open_turn, record_answer, Conversation, NEW_CHAT_TITLE,
};
pub use notifications::Notifier;
pub use purchases::{create_purchase, Purchase, PurchaseError};
pub use referrals::apply_referral_bonus;
pub use safety::{SafetyDecision, SafetyGuard};
pub use subscriptions::{
    activate_paid_plan, compute_plan_change, ensure_user, is_active, limits_for,
    paid_subscription, preview_plan_change, PlanChange, SubscriptionError,
};
pub use usage::{can_spend_image, can_spend_request, Quota, Reservation};
