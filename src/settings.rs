use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ClientFault;
use crate::options::OptionKey;

/// Ordering policy for selecting among idle pool connections.
///
/// LIFO prefers the most-recently released connection (likely still warm on
/// the server); FIFO rotates through connections to bound their age evenly.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ReuseStrategy {
    Fifo,
    #[default]
    Lifo,
}

impl ReuseStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Fifo => "FIFO",
            Self::Lifo => "LIFO",
        }
    }
}

impl FromStr for ReuseStrategy {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_uppercase().as_str() {
            "FIFO" => Ok(Self::Fifo),
            "LIFO" => Ok(Self::Lifo),
            other => Err(format!("unknown reuse strategy '{other}'")),
        }
    }
}

/// Client-wide configuration: a mapping of well-known option keys to string
/// values, seeded at construction and read-only afterwards.
///
/// Unknown keys are preserved so they survive the per-request merge, but
/// they never influence request assembly. Typed accessors fall back to the
/// documented defaults; [`ClientSettings::validate`] rejects values that do
/// not parse.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ClientSettings {
    values: BTreeMap<String, String>,
}

pub(crate) const DEFAULT_MAX_CONNECTIONS: usize = 10;
pub(crate) const DEFAULT_SOCKET_TIMEOUT: Duration = Duration::from_secs(30);
pub(crate) const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub(crate) const DEFAULT_CONNECTION_REQUEST_TIMEOUT: Duration = Duration::from_millis(1000);

impl ClientSettings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets an option value. Chainable.
    pub fn set(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values
            .iter()
            .map(|(key, value)| (key.as_str(), value.as_str()))
    }

    /// Maximum number of pooled connections, idle and leased combined.
    pub fn max_connections(&self) -> usize {
        self.parsed(OptionKey::MaxConnections)
            .unwrap_or(DEFAULT_MAX_CONNECTIONS)
    }

    /// Wall-clock lifetime of a connection from creation. `None` means
    /// unbounded.
    pub fn connection_ttl(&self) -> Option<Duration> {
        self.millis(OptionKey::ConnectionTtl)
    }

    /// Maximum idle time of a pooled connection. `None` means unbounded.
    pub fn keep_alive_timeout(&self) -> Option<Duration> {
        self.millis(OptionKey::KeepAliveTimeout)
    }

    pub fn reuse_strategy(&self) -> ReuseStrategy {
        self.get(OptionKey::ConnectionReuseStrategy.key())
            .and_then(|value| value.parse().ok())
            .unwrap_or_default()
    }

    /// Whether the request pipeline runs on a detached worker task.
    pub fn async_enabled(&self) -> bool {
        self.get(OptionKey::Async.key())
            .map(|value| value.eq_ignore_ascii_case("true") || value == "1")
            .unwrap_or(true)
    }

    pub fn socket_timeout(&self) -> Duration {
        self.millis(OptionKey::SocketTimeout)
            .unwrap_or(DEFAULT_SOCKET_TIMEOUT)
    }

    pub fn connect_timeout(&self) -> Duration {
        self.millis(OptionKey::ConnectTimeout)
            .unwrap_or(DEFAULT_CONNECT_TIMEOUT)
    }

    /// Base connection-request timeout; per-request options may override it
    /// in either direction.
    pub fn connection_request_timeout(&self) -> Duration {
        self.millis(OptionKey::ConnectionRequestTimeout)
            .unwrap_or(DEFAULT_CONNECTION_REQUEST_TIMEOUT)
    }

    /// HTTP proxy, when both host and port are configured.
    pub fn proxy(&self) -> Option<(String, u16)> {
        let host = self.get(OptionKey::ProxyHost.key())?;
        let port = self
            .get(OptionKey::ProxyPort.key())
            .and_then(|value| value.parse().ok())?;
        Some((host.to_owned(), port))
    }

    /// Credentials are opaque to the transport; the client injects them as
    /// `X-ClickHouse-User` / `X-ClickHouse-Key` headers.
    pub fn user(&self) -> Option<&str> {
        self.get(OptionKey::User.key())
    }

    pub fn password(&self) -> Option<&str> {
        self.get(OptionKey::Password.key())
    }

    pub fn database(&self) -> Option<&str> {
        self.get(OptionKey::Database.key())
    }

    /// Checks every recognized value parses. Called once at client
    /// construction so later accessors cannot silently fall back on a typo.
    pub fn validate(&self) -> Result<(), ClientFault> {
        for option in [
            OptionKey::ConnectionTtl,
            OptionKey::KeepAliveTimeout,
            OptionKey::SocketTimeout,
            OptionKey::ConnectTimeout,
            OptionKey::ConnectionRequestTimeout,
        ] {
            if let Some(value) = self.get(option.key()) {
                value.parse::<u64>().map_err(|_| {
                    ClientFault::Config(format!(
                        "option '{}' must be a duration in milliseconds, got '{value}'",
                        option.key()
                    ))
                })?;
            }
        }
        if let Some(value) = self.get(OptionKey::MaxConnections.key()) {
            let parsed: usize = value.parse().map_err(|_| {
                ClientFault::Config(format!("option 'max_connections' must be an integer, got '{value}'"))
            })?;
            if parsed == 0 {
                return Err(ClientFault::Config(
                    "option 'max_connections' must be at least 1".to_owned(),
                ));
            }
        }
        if let Some(value) = self.get(OptionKey::ConnectionReuseStrategy.key()) {
            value
                .parse::<ReuseStrategy>()
                .map_err(ClientFault::Config)?;
        }
        if let Some(value) = self.get(OptionKey::ProxyPort.key()) {
            value.parse::<u16>().map_err(|_| {
                ClientFault::Config(format!("option 'proxy_port' must be a port number, got '{value}'"))
            })?;
        }
        if self.get(OptionKey::ProxyHost.key()).is_some()
            != self.get(OptionKey::ProxyPort.key()).is_some()
        {
            return Err(ClientFault::Config(
                "proxy_host and proxy_port must be set together".to_owned(),
            ));
        }
        Ok(())
    }

    fn parsed<T: FromStr>(&self, option: OptionKey) -> Option<T> {
        self.get(option.key()).and_then(|value| value.parse().ok())
    }

    fn millis(&self, option: OptionKey) -> Option<Duration> {
        self.parsed::<u64>(option).map(Duration::from_millis)
    }
}
