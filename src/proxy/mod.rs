//! The proxy surface: axum server, request handlers, and the
//! cache-check → select → fetch → retry pipeline.

pub mod handler;
pub mod pipeline;
pub mod server;

pub use server::{AppState, ProxyServer};
