//! # Revloop Gateway
//! HTTP surface: trigger ingestion, manual enrollment, directory CRUD,
//! provider webhooks, and the cron executor endpoint.

pub mod routes;
pub mod server;
pub mod webhooks;

pub use server::{AppState, build_router, start};
