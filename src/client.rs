use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use http::header::{HeaderMap, HeaderValue};

use crate::endpoint::{Endpoint, Scheme};
use crate::error::{ClickHouseError, ClientFault};
use crate::options::{merge_options, QueryOptions};
use crate::pool::{ConnectionPool, PoolConfig};
use crate::request::{build_request, RequestTimeouts};
use crate::response::{classify, ResponseHandle};
use crate::settings::ClientSettings;
use crate::Result;

const USER_HEADER: &str = "x-clickhouse-user";
const KEY_HEADER: &str = "x-clickhouse-key";

/// HTTP transport client for a ClickHouse endpoint.
///
/// Holds the endpoint, the client-wide settings and the connection pool.
/// Cloning is cheap; clones share the pool.
#[derive(Clone)]
pub struct ClickHouseClient {
    endpoint: Endpoint,
    settings: ClientSettings,
    auth_headers: HeaderMap,
    pool: Arc<ConnectionPool>,
}

impl fmt::Debug for ClickHouseClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClickHouseClient")
            .field("endpoint", &self.endpoint)
            .field("credentials", &"<redacted>")
            .finish_non_exhaustive()
    }
}

impl ClickHouseClient {
    /// Creates a client with default settings.
    pub fn new(endpoint: Endpoint) -> Result<Self> {
        Self::with_settings(endpoint, ClientSettings::new())
    }

    /// Creates a client with explicit settings.
    ///
    /// Settings are validated once here; they are read-only afterwards.
    pub fn with_settings(endpoint: Endpoint, settings: ClientSettings) -> Result<Self> {
        settings.validate()?;
        if endpoint.scheme() == Scheme::Https {
            #[cfg(not(feature = "tls"))]
            return Err(ClientFault::Config(
                "https endpoints require the 'tls' feature".to_owned(),
            )
            .into());
            #[cfg(feature = "tls")]
            if settings.proxy().is_some() {
                return Err(ClientFault::Config(
                    "https endpoints cannot be reached through the plain HTTP proxy".to_owned(),
                )
                .into());
            }
        }
        let auth_headers = credential_headers(&settings)?;
        let pool = Arc::new(ConnectionPool::new(PoolConfig::from_settings(&settings)));
        Ok(Self {
            endpoint,
            settings,
            auth_headers,
            pool,
        })
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn settings(&self) -> &ClientSettings {
        &self.settings
    }

    /// Executes a SQL statement against the client's endpoint.
    ///
    /// The future resolves with `Some(handle)` for 2xx and 5xx responses,
    /// with `None` when the endpoint is unreachable (unknown host,
    /// connection refused, no route to host), and fails with a typed error
    /// for everything else: a 4xx becomes [`ClickHouseError::Server`], pool
    /// saturation becomes [`ClickHouseError::ConnectionInitiation`], local
    /// failures become [`ClickHouseError::Client`].
    pub async fn execute(
        &self,
        sql: impl Into<String>,
        options: QueryOptions,
    ) -> Result<Option<ResponseHandle>> {
        self.execute_at(self.endpoint.clone(), Bytes::from(sql.into()), options)
            .await
    }

    /// Runs the same pipeline against an explicit endpoint, for callers
    /// iterating a failover list. The body entity is attached as-is.
    pub async fn execute_at(
        &self,
        endpoint: Endpoint,
        body: Bytes,
        options: QueryOptions,
    ) -> Result<Option<ResponseHandle>> {
        let context = PipelineContext {
            pool: Arc::clone(&self.pool),
            settings: self.settings.clone(),
            auth_headers: self.auth_headers.clone(),
            endpoint,
            body,
            options,
        };
        if self.settings.async_enabled() {
            // Detached worker: dropping the caller's future abandons the
            // wait but does not interrupt the in-flight request.
            match tokio::spawn(run_pipeline(context)).await {
                Ok(outcome) => outcome,
                Err(join_error) => Err(ClientFault::Worker(join_error.to_string()).into()),
            }
        } else {
            run_pipeline(context).await
        }
    }
}

struct PipelineContext {
    pool: Arc<ConnectionPool>,
    settings: ClientSettings,
    auth_headers: HeaderMap,
    endpoint: Endpoint,
    body: Bytes,
    options: QueryOptions,
}

/// The synchronous request pipeline: assemble, lease, send, classify.
///
/// Every terminal path releases the lease, either here, in the classifier,
/// or through the returned handle.
async fn run_pipeline(context: PipelineContext) -> Result<Option<ResponseHandle>> {
    let PipelineContext {
        pool,
        settings,
        auth_headers,
        endpoint,
        body,
        options,
    } = context;
    tracing::debug!(endpoint = %endpoint, "request submitted");

    let timeouts = RequestTimeouts::resolve(&settings, &options)?;
    let merged = merge_options(&settings, &options);
    let request = build_request(&endpoint, &merged, &auth_headers, body, pool.via_proxy())?;
    tracing::debug!(uri = %request.uri(), "request assembled");

    let mut lease = match pool.lease(&endpoint, &timeouts).await {
        Ok(lease) => lease,
        Err(fault) if fault.is_soft() => {
            tracing::warn!(endpoint = %endpoint, error = %fault, "endpoint unreachable");
            return Ok(None);
        }
        Err(fault) => return Err(ClickHouseError::ConnectionInitiation(fault)),
    };
    tracing::debug!(endpoint = %endpoint, "sending request");

    let sent = tokio::time::timeout(timeouts.socket_read, lease.send(request)).await;
    let response = match sent {
        Err(_) => {
            // The connection is mid-request; dropping the lease destroys it.
            drop(lease);
            return Err(ClientFault::SocketTimeout(timeouts.socket_read).into());
        }
        Ok(Err(error)) => {
            drop(lease);
            return Err(ClientFault::Http(error).into());
        }
        Ok(Ok(response)) => response,
    };
    tracing::debug!(status = %response.status(), "response headers received");

    classify(response, lease, timeouts.socket_read).await.map(Some)
}

fn credential_headers(settings: &ClientSettings) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    if let Some(user) = settings.user() {
        headers.insert(
            USER_HEADER,
            HeaderValue::from_str(user).map_err(|_| {
                ClientFault::Config("user contains characters not allowed in a header".to_owned())
            })?,
        );
    }
    if let Some(password) = settings.password() {
        headers.insert(
            KEY_HEADER,
            HeaderValue::from_str(password).map_err(|_| {
                ClientFault::Config(
                    "password contains characters not allowed in a header".to_owned(),
                )
            })?,
        );
    }
    Ok(headers)
}

#[cfg(test)]
mod tests {
    use super::{credential_headers, ClickHouseClient};
    use crate::endpoint::Endpoint;
    use crate::settings::ClientSettings;

    fn endpoint() -> Endpoint {
        Endpoint::http("localhost", 8123).expect("endpoint")
    }

    #[test]
    fn debug_redacts_credentials() {
        let client = ClickHouseClient::with_settings(
            endpoint(),
            ClientSettings::new()
                .set("user", "reader")
                .set("password", "hunter2"),
        )
        .expect("client must build");
        let debug = format!("{client:?}");
        assert!(debug.contains("<redacted>"));
        assert!(!debug.contains("hunter2"));
    }

    #[test]
    fn invalid_settings_are_rejected_at_construction() {
        let result = ClickHouseClient::with_settings(
            endpoint(),
            ClientSettings::new().set("socket_timeout", "later"),
        );
        assert!(result.is_err());
    }

    #[test]
    fn credential_headers_use_clickhouse_auth_headers() {
        let headers = credential_headers(
            &ClientSettings::new()
                .set("user", "reader")
                .set("password", "hunter2"),
        )
        .expect("headers must build");
        assert_eq!(headers["x-clickhouse-user"], "reader");
        assert_eq!(headers["x-clickhouse-key"], "hunter2");
    }

    #[cfg(not(feature = "tls"))]
    #[test]
    fn https_requires_the_tls_feature() {
        let result = ClickHouseClient::new(Endpoint::https("ch.example.com", 8443).expect("endpoint"));
        assert!(result.is_err());
    }
}
