//! Proxy + capture + query core for the MCP observability gateway (§1–§2).
//!
//! This crate owns the nine components from the spec: the registry (C9),
//! session-state store (C2), capture recorder (C3), SSE frame stream (C4),
//! proxy router (C5), OAuth pass-through (C6), health checker (C7), storage
//! backend (C1), and query API (C8). Everything outside of this crate —
//! CLI parsing, the web/terminal UI, registry persistence format, and the
//! gateway-management MCP server — is an external collaborator.

pub mod api;
pub mod capture;
pub mod client;
pub mod error;
pub mod health;
pub mod oauth;
pub mod proxy;
pub mod registry;
pub mod session;
pub mod sse;
pub mod store;
pub mod types;

pub use error::{ApiError, ProxyError};
