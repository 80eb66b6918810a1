//! HTTP, WebSocket and SSE interface

pub mod handlers;
pub mod server;
pub mod sse;
pub mod ws;

pub use server::{create_router, run, AppContext};
