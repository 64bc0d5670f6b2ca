//! Autoflow: keyword and trigger automations for a messaging CRM.

pub mod auth;
pub mod automation;
pub mod config;
pub mod error;
pub mod gateway;
pub mod sequences;
pub mod store;
pub mod types;
pub mod webhooks;
