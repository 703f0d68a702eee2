use std::fmt;

use url::Url;

use crate::error::ClientFault;

/// URL scheme of an endpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Https => "https",
        }
    }

    /// Default ClickHouse HTTP interface port for the scheme.
    pub fn default_port(self) -> u16 {
        match self {
            Self::Http => 8123,
            Self::Https => 8443,
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A network-addressable ClickHouse HTTP listener.
///
/// Immutable after construction; the base URL is validated once and reused
/// for every request assembled against this endpoint.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Endpoint {
    scheme: Scheme,
    host: String,
    port: u16,
    path: String,
    base_url: Url,
}

impl Endpoint {
    /// Creates an endpoint from its parts. The port must be non-zero and the
    /// resulting base URI must be a valid URL.
    pub fn new(
        scheme: Scheme,
        host: impl Into<String>,
        port: u16,
    ) -> Result<Self, ClientFault> {
        Self::with_path(scheme, host, port, "/")
    }

    /// Creates an endpoint with an explicit base path.
    pub fn with_path(
        scheme: Scheme,
        host: impl Into<String>,
        port: u16,
        path: impl Into<String>,
    ) -> Result<Self, ClientFault> {
        let host = host.into();
        let mut path = path.into();
        if port == 0 {
            return Err(ClientFault::Config("endpoint port must be non-zero".to_owned()));
        }
        if host.trim().is_empty() {
            return Err(ClientFault::Config("endpoint host must not be empty".to_owned()));
        }
        if !path.starts_with('/') {
            path.insert(0, '/');
        }
        let base_url = Url::parse(&format!("{scheme}://{host}:{port}{path}"))?;
        Ok(Self {
            scheme,
            host,
            port,
            path,
            base_url,
        })
    }

    /// Plain-HTTP endpoint on the given host and port.
    pub fn http(host: impl Into<String>, port: u16) -> Result<Self, ClientFault> {
        Self::new(Scheme::Http, host, port)
    }

    /// HTTPS endpoint on the given host and port.
    pub fn https(host: impl Into<String>, port: u16) -> Result<Self, ClientFault> {
        Self::new(Scheme::Https, host, port)
    }

    /// Parses an endpoint from a URL string such as
    /// `http://localhost:8123/`. When the URL carries no explicit port, the
    /// scheme's ClickHouse default (8123 or 8443) is used.
    pub fn parse(input: &str) -> Result<Self, ClientFault> {
        let url = Url::parse(input)?;
        let scheme = match url.scheme() {
            "http" => Scheme::Http,
            "https" => Scheme::Https,
            other => {
                return Err(ClientFault::Config(format!(
                    "unsupported endpoint scheme '{other}'"
                )))
            }
        };
        let host = url
            .host_str()
            .ok_or_else(|| ClientFault::Config("endpoint URL has no host".to_owned()))?
            .to_owned();
        let port = url.port().unwrap_or_else(|| scheme.default_port());
        Self::with_path(scheme, host, port, url.path())
    }

    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// The validated base URI for this endpoint.
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// `host:port`, as sent in the `Host` header.
    pub(crate) fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Identity used to match idle pool connections to this endpoint.
    pub(crate) fn pool_key(&self) -> String {
        format!("{}://{}:{}", self.scheme, self.host, self.port)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.base_url.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::{Endpoint, Scheme};

    #[test]
    fn parse_uses_scheme_default_port() {
        let endpoint = Endpoint::parse("http://localhost").expect("must parse");
        assert_eq!(endpoint.port(), 8123);
        let endpoint = Endpoint::parse("https://ch.example.com").expect("must parse");
        assert_eq!(endpoint.port(), 8443);
    }

    #[test]
    fn parse_keeps_explicit_port_and_path() {
        let endpoint = Endpoint::parse("http://127.0.0.1:9000/proxy").expect("must parse");
        assert_eq!(endpoint.scheme(), Scheme::Http);
        assert_eq!(endpoint.port(), 9000);
        assert_eq!(endpoint.path(), "/proxy");
        assert_eq!(endpoint.base_url().as_str(), "http://127.0.0.1:9000/proxy");
    }

    #[test]
    fn zero_port_is_rejected() {
        assert!(Endpoint::http("localhost", 0).is_err());
    }

    #[test]
    fn pool_key_ignores_path() {
        let a = Endpoint::with_path(Scheme::Http, "localhost", 8123, "/a").expect("endpoint");
        let b = Endpoint::with_path(Scheme::Http, "localhost", 8123, "/b").expect("endpoint");
        assert_eq!(a.pool_key(), b.pool_key());
    }
}
