//! HTTP front end for x402 pay-then-mint.
//!
//! `POST /mint` takes an `X-PAYMENT` header carrying a signed EIP-3009
//! authorization, settles the payment through the relayer, and mints the
//! collectible once the payment has confirmed. The settlement engine lives in
//! [`x402_mint`]; this crate maps it onto HTTP.
//!
//! # Modules
//!
//! - [`routes`]: `/mint`, claim status, operator resume, health, metrics
//! - [`gate`]: the 402 challenge
//! - [`error`]: [`ApiError`](error::ApiError), settlement outcomes as HTTP statuses
//! - [`bootstrap`]: builds [`AppState`](state::AppState) from [`ServerConfig`](config::ServerConfig)
//! - [`telemetry`]: signed settlement notifications
//! - [`metrics`]: Prometheus metrics

pub mod bootstrap;
pub mod config;
pub mod error;
pub mod gate;
pub mod metered;
pub mod metrics;
pub mod routes;
pub mod state;
pub mod telemetry;
