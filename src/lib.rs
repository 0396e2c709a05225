//! Media Range Proxy - HTTP byte-range proxy for upstream audio streams
//!
//! This library provides the core functionality for the proxy server: range
//! parsing, the range-proxying engine with its resource size cache, external
//! ID lookup, format validation, the upstream HTTP client and the HTTP surface.

pub mod config;
pub mod error;
pub mod format_validator;
pub mod health;
pub mod http_server;
pub mod id_cache;
pub mod logging;
pub mod lookup_service;
pub mod media_resolver;
pub mod proxy_engine;
pub mod range_body;
pub mod range_handler;
pub mod shutdown;
pub mod size_cache;
pub mod upstream_client;
pub mod upstream_connector;

pub use error::{ProxyError, Result};
