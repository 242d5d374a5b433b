// Test code patterns:
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::unwrap_used))]

//! LedgerLink API Library
//!
//! HTTP surface of the reconciliation engine: the QuickBooks webhook
//! receiver, the OAuth connect flow and a health check.

pub mod auth;
pub mod config;
pub mod error;
pub mod routes;
pub mod state;

#[cfg(test)]
mod edge_case_tests;

pub use config::Config;
pub use error::{ApiError, ApiResult};
pub use routes::create_router;
pub use state::AppState;
