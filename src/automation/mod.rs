//! Rule matching and execution: keyword and trigger automations.

pub mod condition;
pub mod delivery;
pub mod engine;
pub mod executor;
pub mod keyword;
pub mod path;
pub mod relay;
pub mod rule;
pub mod trigger;

pub use delivery::{DeliveryWorker, spawn_delivery_worker};
pub use engine::{AutomationEngine, ProcessOutcome, SkipReason};
pub use executor::{ActionExecutor, ExecutionResult, SourceEvent};
pub use relay::{RelayWorker, spawn_relay_worker};
pub use rule::Rule;
pub use trigger::{TriggerEvent, TriggerType};
