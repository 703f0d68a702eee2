use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use http::Request;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::client::conn::http1::{self, SendRequest};
use hyper_util::rt::TokioIo;
use tokio::net::TcpStream;
use tokio::sync::Notify;

use crate::endpoint::{Endpoint, Scheme};
use crate::error::ConnectionFault;
use crate::request::RequestTimeouts;
use crate::settings::{ClientSettings, ReuseStrategy};

/// Pool-level knobs, frozen at client construction.
#[derive(Clone, Debug)]
pub(crate) struct PoolConfig {
    pub(crate) max_connections: usize,
    pub(crate) connection_ttl: Option<Duration>,
    pub(crate) keep_alive: Option<Duration>,
    pub(crate) reuse_strategy: ReuseStrategy,
    pub(crate) proxy: Option<(String, u16)>,
}

impl PoolConfig {
    pub(crate) fn from_settings(settings: &ClientSettings) -> Self {
        Self {
            max_connections: settings.max_connections(),
            connection_ttl: settings.connection_ttl(),
            keep_alive: settings.keep_alive_timeout(),
            reuse_strategy: settings.reuse_strategy(),
            proxy: settings.proxy(),
        }
    }
}

/// One live HTTP/1.1 connection: the hyper request sender plus the
/// timestamps the eviction invariants are checked against.
struct PooledConnection {
    sender: SendRequest<Full<Bytes>>,
    key: String,
    created_at: Instant,
    last_used: Instant,
}

impl PooledConnection {
    /// Reuse eligibility: `(now - created) < ttl` and
    /// `(now - last_used) < keep_alive`.
    fn expired(&self, now: Instant, config: &PoolConfig) -> bool {
        if let Some(ttl) = config.connection_ttl {
            if now.duration_since(self.created_at) >= ttl {
                return true;
            }
        }
        if let Some(keep_alive) = config.keep_alive {
            if now.duration_since(self.last_used) >= keep_alive {
                return true;
            }
        }
        false
    }
}

struct PoolInner {
    idle: VecDeque<PooledConnection>,
    /// Idle plus leased; never exceeds `max_connections`.
    total: usize,
}

impl PoolInner {
    fn evict_expired(&mut self, config: &PoolConfig, now: Instant) {
        let before = self.idle.len();
        self.idle
            .retain(|conn| !conn.expired(now, config) && !conn.sender.is_closed());
        self.total -= before - self.idle.len();
    }

    /// Idle connections are pushed at the back on release, so LIFO takes
    /// from the back (most-recently released) and FIFO from the front.
    fn claim_idle(&mut self, key: &str, strategy: ReuseStrategy) -> Option<PooledConnection> {
        let position = match strategy {
            ReuseStrategy::Lifo => self.idle.iter().rposition(|conn| conn.key == key),
            ReuseStrategy::Fifo => self.idle.iter().position(|conn| conn.key == key),
        }?;
        self.idle.remove(position)
    }
}

enum Claim {
    Warm(PooledConnection),
    Dial,
    Wait,
}

/// Bounded pool of live HTTP connections.
///
/// The pool is the only shared mutable structure in the crate; its state is
/// serialized under a single mutex, with a [`Notify`] as the release signal
/// saturated leases wait on.
pub(crate) struct ConnectionPool {
    config: PoolConfig,
    inner: Mutex<PoolInner>,
    released: Notify,
}

impl ConnectionPool {
    pub(crate) fn new(config: PoolConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(PoolInner {
                idle: VecDeque::new(),
                total: 0,
            }),
            released: Notify::new(),
        }
    }

    pub(crate) fn via_proxy(&self) -> bool {
        self.config.proxy.is_some()
    }

    /// Leases a connection for one request/response cycle.
    ///
    /// Blocks at most `timeouts.connection_request`; a saturated pool that
    /// does not release a connection in time fails with
    /// [`ConnectionFault::RequestTimeout`].
    pub(crate) async fn lease(
        self: &Arc<Self>,
        endpoint: &Endpoint,
        timeouts: &RequestTimeouts,
    ) -> Result<Lease, ConnectionFault> {
        let deadline = Instant::now() + timeouts.connection_request;
        let key = endpoint.pool_key();
        loop {
            let claim = {
                let mut inner = self.inner.lock().expect("pool lock poisoned");
                inner.evict_expired(&self.config, Instant::now());
                if let Some(conn) = inner.claim_idle(&key, self.config.reuse_strategy) {
                    Claim::Warm(conn)
                } else if inner.total < self.config.max_connections {
                    // Reserve the slot before dialing so concurrent leases
                    // cannot overshoot the maximum.
                    inner.total += 1;
                    Claim::Dial
                } else {
                    Claim::Wait
                }
            };

            match claim {
                Claim::Warm(conn) => {
                    tracing::debug!(key = %conn.key, "reusing pooled connection");
                    return Ok(Lease::new(Arc::clone(self), conn));
                }
                Claim::Dial => match self.dial(endpoint, timeouts.connect).await {
                    Ok(conn) => return Ok(Lease::new(Arc::clone(self), conn)),
                    Err(fault) => {
                        self.forget_slot();
                        return Err(fault);
                    }
                },
                Claim::Wait => {
                    let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                        return Err(ConnectionFault::RequestTimeout);
                    };
                    if tokio::time::timeout(remaining, self.released.notified())
                        .await
                        .is_err()
                    {
                        return Err(ConnectionFault::RequestTimeout);
                    }
                }
            }
        }
    }

    /// Returns a connection. Reusable, healthy, unexpired ones go back to
    /// the idle set; everything else is destroyed.
    fn release(&self, mut conn: PooledConnection, reusable: bool) {
        let now = Instant::now();
        let keep = reusable && !conn.sender.is_closed() && !conn.expired(now, &self.config);
        {
            let mut inner = self.inner.lock().expect("pool lock poisoned");
            if keep {
                conn.last_used = now;
                inner.idle.push_back(conn);
            } else {
                inner.total -= 1;
            }
        }
        self.released.notify_one();
    }

    fn forget_slot(&self) {
        {
            let mut inner = self.inner.lock().expect("pool lock poisoned");
            inner.total -= 1;
        }
        self.released.notify_one();
    }

    async fn dial(
        &self,
        endpoint: &Endpoint,
        connect_timeout: Duration,
    ) -> Result<PooledConnection, ConnectionFault> {
        let (dial_host, dial_port) = match &self.config.proxy {
            Some((host, port)) => (host.clone(), *port),
            None => (endpoint.host().to_owned(), endpoint.port()),
        };
        let addr = resolve(&dial_host, dial_port).await?;

        let stream = match tokio::time::timeout(connect_timeout, TcpStream::connect(addr)).await {
            Err(_) => {
                return Err(ConnectionFault::ConnectTimeout {
                    addr: addr.to_string(),
                })
            }
            Ok(Err(error)) => return Err(classify_connect_error(error, addr)),
            Ok(Ok(stream)) => stream,
        };
        stream.set_nodelay(true)?;
        tracing::debug!(%addr, "opened connection");

        let sender = match endpoint.scheme() {
            Scheme::Http => handshake(stream).await?,
            #[cfg(feature = "tls")]
            Scheme::Https => handshake(tls_connect(stream, endpoint.host()).await?).await?,
            #[cfg(not(feature = "tls"))]
            Scheme::Https => {
                return Err(ConnectionFault::Io(io::Error::new(
                    io::ErrorKind::Unsupported,
                    "https endpoints require the 'tls' feature",
                )))
            }
        };

        let now = Instant::now();
        Ok(PooledConnection {
            sender,
            key: endpoint.pool_key(),
            created_at: now,
            last_used: now,
        })
    }

    #[cfg(test)]
    fn adopt(&self, sender: SendRequest<Full<Bytes>>, key: &str, created_at: Instant) {
        let mut inner = self.inner.lock().expect("pool lock poisoned");
        inner.idle.push_back(PooledConnection {
            sender,
            key: key.to_owned(),
            created_at,
            last_used: created_at,
        });
        inner.total += 1;
    }

    #[cfg(test)]
    fn counts(&self) -> (usize, usize) {
        let inner = self.inner.lock().expect("pool lock poisoned");
        (inner.idle.len(), inner.total)
    }
}

async fn resolve(host: &str, port: u16) -> Result<SocketAddr, ConnectionFault> {
    let mut addrs = tokio::net::lookup_host((host, port))
        .await
        .map_err(|_| ConnectionFault::UnknownHost {
            host: host.to_owned(),
        })?;
    addrs.next().ok_or_else(|| ConnectionFault::UnknownHost {
        host: host.to_owned(),
    })
}

fn classify_connect_error(error: io::Error, addr: SocketAddr) -> ConnectionFault {
    match error.kind() {
        io::ErrorKind::ConnectionRefused => ConnectionFault::ConnectionRefused {
            addr: addr.to_string(),
        },
        io::ErrorKind::HostUnreachable | io::ErrorKind::NetworkUnreachable => {
            ConnectionFault::NoRouteToHost {
                addr: addr.to_string(),
            }
        }
        io::ErrorKind::TimedOut => ConnectionFault::ConnectTimeout {
            addr: addr.to_string(),
        },
        _ => ConnectionFault::Io(error),
    }
}

async fn handshake<S>(stream: S) -> Result<SendRequest<Full<Bytes>>, ConnectionFault>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let (sender, connection) = http1::handshake(TokioIo::new(stream))
        .await
        .map_err(ConnectionFault::Handshake)?;
    // The driver task owns the protocol state machine; the sender makes no
    // progress unless it is polled, including keep-alive between requests.
    tokio::spawn(async move {
        if let Err(error) = connection.await {
            tracing::debug!(%error, "connection driver finished with error");
        }
    });
    Ok(sender)
}

#[cfg(feature = "tls")]
async fn tls_connect(
    stream: TcpStream,
    host: &str,
) -> Result<tokio_rustls::client::TlsStream<TcpStream>, ConnectionFault> {
    use std::sync::OnceLock;

    use tokio_rustls::rustls::pki_types::ServerName;
    use tokio_rustls::rustls::{ClientConfig, RootCertStore};
    use tokio_rustls::TlsConnector;

    static TLS_CONFIG: OnceLock<Arc<ClientConfig>> = OnceLock::new();
    let config = TLS_CONFIG.get_or_init(|| {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        Arc::new(
            ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth(),
        )
    });

    let server_name = ServerName::try_from(host.to_owned()).map_err(|error| {
        ConnectionFault::TlsHandshake {
            host: host.to_owned(),
            source: io::Error::new(io::ErrorKind::InvalidInput, error),
        }
    })?;
    TlsConnector::from(Arc::clone(config))
        .connect(server_name, stream)
        .await
        .map_err(|source| ConnectionFault::TlsHandshake {
            host: host.to_owned(),
            source,
        })
}

/// A temporary exclusive borrow of a pool connection for one
/// request/response cycle.
///
/// Dropping a lease without an explicit release destroys the connection:
/// an abandoned request leaves the protocol state unknown.
pub(crate) struct Lease {
    pool: Arc<ConnectionPool>,
    conn: Option<PooledConnection>,
}

impl Lease {
    fn new(pool: Arc<ConnectionPool>, conn: PooledConnection) -> Self {
        Self {
            pool,
            conn: Some(conn),
        }
    }

    pub(crate) async fn send(
        &mut self,
        request: Request<Full<Bytes>>,
    ) -> Result<hyper::Response<Incoming>, hyper::Error> {
        let conn = self.conn.as_mut().expect("lease already released");
        conn.sender.send_request(request).await
    }

    /// Returns the connection to the pool; non-reusable ones are destroyed.
    pub(crate) fn release(mut self, reusable: bool) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(conn, reusable);
        }
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(conn, false);
        }
    }
}
