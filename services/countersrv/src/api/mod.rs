//! HTTP surface: status snapshots and operational actions only; no
//! business logic beyond formatting.

pub mod auth;
pub mod dto;
pub mod handlers;
pub mod routes;

pub use routes::{create_router, AppState};
