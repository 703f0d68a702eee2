use std::time::Duration;

/// Error type returned by this crate.
///
/// 5xx responses are never surfaced through this type; they resolve as live
/// [`crate::ResponseHandle`]s so higher layers can decide whether to retry.
#[derive(Debug, thiserror::Error)]
pub enum ClickHouseError {
    /// Server-reported failure, parsed from a 4xx response body and the
    /// `X-ClickHouse-Exception-Code` header.
    #[error("server error {code}: {message}")]
    Server {
        /// Numeric ClickHouse exception code, `0` when the header is absent.
        code: i32,
        /// UTF-8 decoded response body.
        message: String,
    },
    /// Failed to obtain a usable connection to the endpoint.
    #[error("connection initiation failed")]
    ConnectionInitiation(#[source] ConnectionFault),
    /// Unexpected local failure: body-read I/O error, malformed request,
    /// configuration inconsistency.
    #[error("client error")]
    Client(#[source] ClientFault),
}

impl ClickHouseError {
    /// Returns the server exception code for [`ClickHouseError::Server`].
    pub fn server_code(&self) -> Option<i32> {
        match self {
            Self::Server { code, .. } => Some(*code),
            _ => None,
        }
    }
}

impl From<ClientFault> for ClickHouseError {
    fn from(fault: ClientFault) -> Self {
        Self::Client(fault)
    }
}

/// Why a connection could not be obtained.
///
/// The unknown-host, connection-refused and no-route causes form the soft
/// transient class: the dispatcher renders them as an empty result instead
/// of an error so callers can iterate endpoints without unwinding.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionFault {
    /// The pool stayed saturated for the whole connection-request timeout.
    #[error("timed out waiting for a pool connection")]
    RequestTimeout,
    /// DNS resolution produced no usable address.
    #[error("host '{host}' could not be resolved")]
    UnknownHost { host: String },
    /// The remote side refused the TCP connection.
    #[error("connection refused by {addr}")]
    ConnectionRefused { addr: String },
    /// No network route to the remote side.
    #[error("no route to host {addr}")]
    NoRouteToHost { addr: String },
    /// The TCP connect did not complete within the connect timeout.
    #[error("connect to {addr} timed out")]
    ConnectTimeout { addr: String },
    /// The TLS handshake with the endpoint failed.
    #[error("TLS handshake with '{host}' failed")]
    TlsHandshake {
        host: String,
        #[source]
        source: std::io::Error,
    },
    /// The HTTP/1.1 handshake on a fresh connection failed.
    #[error("HTTP handshake failed")]
    Handshake(#[source] hyper::Error),
    /// Any other I/O failure while establishing the connection.
    #[error("i/o error while connecting")]
    Io(#[from] std::io::Error),
}

impl ConnectionFault {
    /// Whether this fault belongs to the known-transient network class that
    /// is reported as an empty result rather than an error.
    pub fn is_soft(&self) -> bool {
        matches!(
            self,
            Self::UnknownHost { .. } | Self::ConnectionRefused { .. } | Self::NoRouteToHost { .. }
        )
    }
}

/// Local failure outside the server's control.
#[derive(Debug, thiserror::Error)]
pub enum ClientFault {
    /// Reading a 4xx response body failed; the server error is lost.
    #[error("failed to read response body")]
    BodyRead(#[source] hyper::Error),
    /// Writing the request or reading the response headers failed.
    #[error("failed to execute request")]
    Http(#[source] hyper::Error),
    /// Redirects are not followed for POSTed queries.
    #[error("redirect responses are not followed for queries (status {status})")]
    Redirect { status: u16 },
    /// A final status outside the classifiable 2xx..5xx range.
    #[error("unexpected response status {status}")]
    UnexpectedStatus { status: u16 },
    /// No response bytes arrived within the socket timeout.
    #[error("no response within {0:?}")]
    SocketTimeout(Duration),
    /// The endpoint base URI or an option value produced an invalid URI.
    #[error("invalid request URI")]
    InvalidUri(#[from] url::ParseError),
    /// An option value could not be encoded into the request.
    #[error("invalid request component")]
    InvalidRequest(#[from] http::Error),
    /// The client configuration is inconsistent.
    #[error("configuration error: {0}")]
    Config(String),
    /// The worker task running the request pipeline died.
    #[error("worker task failed: {0}")]
    Worker(String),
}
