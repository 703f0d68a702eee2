//! `clickhouse-http` is an async HTTP transport for ClickHouse.
//!
//! The crate turns a logical query (SQL text plus per-request options) into
//! an HTTP POST against a selected endpoint, supervises the response, and
//! returns either a streaming [`ResponseHandle`] or a typed failure:
//! - [`ClickHouseClient::execute`] runs one statement
//! - [`ClickHouseClient::execute_at`] targets an explicit endpoint, for
//!   callers iterating a failover list
//!
//! Connections are pooled with explicit lease/release semantics: a bounded
//! pool with per-connection TTL, idle keep-alive and a FIFO/LIFO reuse
//! policy. A saturated pool fails the request with a distinct
//! connection-request timeout instead of queueing forever.
//!
//! Two response classes resolve successfully: 2xx hands the live body to
//! the caller, 5xx closes the body and hands back the raw status for
//! higher-level retry decisions. A 4xx is extracted eagerly into
//! [`ClickHouseError::Server`]. Unreachable endpoints (unknown host,
//! connection refused, no route) resolve to `None` so failover can iterate
//! endpoints without exception-driven control flow.

mod client;
mod endpoint;
mod error;
mod options;
mod pool;
mod request;
mod response;
mod settings;

pub use client::ClickHouseClient;
pub use endpoint::{Endpoint, Scheme};
pub use error::{ClickHouseError, ClientFault, ConnectionFault};
pub use options::{OptionKey, Placement, QueryOptions};
pub use request::RequestTimeouts;
pub use response::{ResponseHandle, ResponseSummary};
pub use settings::{ClientSettings, ReuseStrategy};

pub type Result<T> = std::result::Result<T, ClickHouseError>;
