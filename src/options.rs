use std::collections::BTreeMap;
use std::time::Duration;

use crate::settings::ClientSettings;

/// Where a recognized option lands in the outgoing request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Placement {
    /// Appended to the request URI as a query parameter.
    UriParam,
    /// Sent as the named request header.
    Header(&'static str),
    /// Client-level knob, never placed into the request.
    Ignored,
}

/// Closed catalog of option keys this client recognizes.
///
/// The catalog is the single source of truth for what may leak into an
/// outgoing request: anything not listed here is carried through the merged
/// option map untouched but never placed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OptionKey {
    /// Ask the server to finish the whole query before responding.
    WaitEndOfQuery,
    /// Caller-supplied request identifier.
    QueryId,
    /// Default database for the statement.
    Database,
    /// Response serialization format.
    Format,
    /// Maximum number of pooled connections.
    MaxConnections,
    /// Wall-clock lifetime of a connection from creation, in milliseconds.
    ConnectionTtl,
    /// Maximum idle time of a pooled connection, in milliseconds.
    KeepAliveTimeout,
    /// Idle-connection selection order, `FIFO` or `LIFO`.
    ConnectionReuseStrategy,
    /// Run the request pipeline on a detached worker task.
    Async,
    /// Maximum wait for response bytes, in milliseconds.
    SocketTimeout,
    /// Maximum time for the TCP (and TLS) handshake, in milliseconds.
    ConnectTimeout,
    /// Maximum wait for a pool slot, in milliseconds.
    ConnectionRequestTimeout,
    ProxyHost,
    ProxyPort,
    User,
    Password,
}

impl OptionKey {
    pub const ALL: &'static [OptionKey] = &[
        OptionKey::WaitEndOfQuery,
        OptionKey::QueryId,
        OptionKey::Database,
        OptionKey::Format,
        OptionKey::MaxConnections,
        OptionKey::ConnectionTtl,
        OptionKey::KeepAliveTimeout,
        OptionKey::ConnectionReuseStrategy,
        OptionKey::Async,
        OptionKey::SocketTimeout,
        OptionKey::ConnectTimeout,
        OptionKey::ConnectionRequestTimeout,
        OptionKey::ProxyHost,
        OptionKey::ProxyPort,
        OptionKey::User,
        OptionKey::Password,
    ];

    /// String form of the key, as used in configuration maps.
    pub fn key(self) -> &'static str {
        match self {
            Self::WaitEndOfQuery => "wait_end_of_query",
            Self::QueryId => "query_id",
            Self::Database => "database",
            Self::Format => "format",
            Self::MaxConnections => "max_connections",
            Self::ConnectionTtl => "connection_ttl",
            Self::KeepAliveTimeout => "keep_alive_timeout",
            Self::ConnectionReuseStrategy => "connection_reuse_strategy",
            Self::Async => "async",
            Self::SocketTimeout => "socket_timeout",
            Self::ConnectTimeout => "connect_timeout",
            Self::ConnectionRequestTimeout => "connection_request_timeout",
            Self::ProxyHost => "proxy_host",
            Self::ProxyPort => "proxy_port",
            Self::User => "user",
            Self::Password => "password",
        }
    }

    /// Looks a key up in the catalog.
    pub fn from_key(key: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|option| option.key() == key)
    }

    /// Declarative placement of this option in an outgoing request.
    pub fn placement(self) -> Placement {
        match self {
            Self::WaitEndOfQuery | Self::QueryId | Self::Database => Placement::UriParam,
            Self::Format => Placement::Header("x-clickhouse-format"),
            _ => Placement::Ignored,
        }
    }
}

/// Per-request options, overlaid on the client-wide settings.
///
/// Consumed once per call; a value set here strictly overrides the
/// client-wide value for the same key.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct QueryOptions {
    values: BTreeMap<String, String>,
}

impl QueryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Response serialization format, e.g. `JSON` or `TabSeparated`.
    pub fn format(self, format: impl Into<String>) -> Self {
        self.option(OptionKey::Format.key(), format)
    }

    /// Caller-supplied request identifier.
    pub fn query_id(self, query_id: impl Into<String>) -> Self {
        self.option(OptionKey::QueryId.key(), query_id)
    }

    /// Ask the server to run the query to completion before responding.
    pub fn wait_end_of_query(self, wait: bool) -> Self {
        self.option(OptionKey::WaitEndOfQuery.key(), if wait { "1" } else { "0" })
    }

    /// Default database for this statement.
    pub fn database(self, database: impl Into<String>) -> Self {
        self.option(OptionKey::Database.key(), database)
    }

    /// Per-request socket timeout override.
    pub fn socket_timeout(self, timeout: Duration) -> Self {
        self.option(
            OptionKey::SocketTimeout.key(),
            timeout.as_millis().to_string(),
        )
    }

    /// Per-request connect timeout override.
    pub fn connect_timeout(self, timeout: Duration) -> Self {
        self.option(
            OptionKey::ConnectTimeout.key(),
            timeout.as_millis().to_string(),
        )
    }

    /// Per-request connection-request timeout override. Independent of the
    /// client-wide value; it may raise it as well as lower it.
    pub fn connection_request_timeout(self, timeout: Duration) -> Self {
        self.option(
            OptionKey::ConnectionRequestTimeout.key(),
            timeout.as_millis().to_string(),
        )
    }

    /// Sets an arbitrary option. Keys outside the catalog are preserved in
    /// the merged map but never placed into the request.
    pub fn option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values
            .iter()
            .map(|(key, value)| (key.as_str(), value.as_str()))
    }
}

/// Overlays per-request options on the client-wide settings.
///
/// Pure function of its inputs: request value > client value. The result is
/// ordered, so assembling the same request twice yields identical output.
pub(crate) fn merge_options(
    settings: &ClientSettings,
    options: &QueryOptions,
) -> BTreeMap<String, String> {
    let mut merged: BTreeMap<String, String> = settings
        .iter()
        .map(|(key, value)| (key.to_owned(), value.to_owned()))
        .collect();
    for (key, value) in options.iter() {
        merged.insert(key.to_owned(), value.to_owned());
    }
    merged
}
