//! Clipsmith Gateway: uniform access to model providers with retries,
//! structured-output validation, and per-stage cost accounting.

pub mod budget;
pub mod error;
pub mod gateway;
pub mod http;
pub mod pricing;
pub mod provider;
pub mod schema;
pub mod scripted;

pub use budget::{BudgetReport, BudgetTracker, CallRecord, LedgerSummary};
pub use error::CallError;
pub use gateway::{GatewaySettings, ModelGateway, Payload, Usage};
pub use http::HttpProvider;
pub use pricing::{estimate_cost, pricing_for, ModelPricing};
pub use provider::{estimate_tokens, ModelProvider, ModelReply, ModelRequest};
pub use schema::{extract_json, ResponseSchema};
pub use scripted::ScriptedProvider;
