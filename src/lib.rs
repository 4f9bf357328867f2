//! Neurochat bot library.
//!
//! Subscription-gated AI assistant for Telegram: chat, image generation and
//! photo editing, paid plans with proration and a referral program.

/// Telegram transport: handlers, panels and notices.
pub mod bot;
/// Configuration management and the plan catalog.
pub mod config;
/// Chat modes, limits and payment statuses.
pub mod domain;
/// Chat and image model providers.
pub mod llm;
/// Payment gateways and the status monitor.
pub mod payments;
/// Worker pools for long-running jobs.
pub mod queue;
/// Subscriptions, usage, referrals and conversations.
pub mod services;
/// Storage layer (MySQL or in-memory).
pub mod storage;
/// Utility functions.
pub mod utils;
