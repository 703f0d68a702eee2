use std::fmt;
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use http::header::HeaderMap;
use http::StatusCode;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use serde::{Deserialize, Deserializer};

use crate::error::{ClickHouseError, ClientFault};
use crate::pool::Lease;

pub(crate) const EXCEPTION_CODE_HEADER: &str = "x-clickhouse-exception-code";
const SUMMARY_HEADER: &str = "x-clickhouse-summary";
const QUERY_ID_HEADER: &str = "x-clickhouse-query-id";
const SERVER_DISPLAY_NAME_HEADER: &str = "x-clickhouse-server-display-name";
const TIMEZONE_HEADER: &str = "x-clickhouse-timezone";

/// Initial buffer for error-body extraction; grows up to the size of the
/// server response.
const ERROR_BODY_BUFFER: usize = 8 * 1024;

/// A live response whose body has not been consumed yet.
///
/// The handle borrows the pool connection for the lifetime of the body
/// stream; closing (or dropping) it releases the connection. A fully
/// drained body lets the connection go back to the pool, anything else
/// destroys it.
pub struct ResponseHandle {
    status: StatusCode,
    headers: HeaderMap,
    body: Option<Incoming>,
    lease: Option<Lease>,
    socket_timeout: Duration,
    drained: bool,
}

impl ResponseHandle {
    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Value of `X-ClickHouse-Exception-Code`, `0` when absent.
    pub fn exception_code(&self) -> i32 {
        exception_code(&self.headers)
    }

    /// Server-assigned (or caller-supplied) query identifier.
    pub fn query_id(&self) -> Option<&str> {
        self.header_str(QUERY_ID_HEADER)
    }

    pub fn server_display_name(&self) -> Option<&str> {
        self.header_str(SERVER_DISPLAY_NAME_HEADER)
    }

    pub fn timezone(&self) -> Option<&str> {
        self.header_str(TIMEZONE_HEADER)
    }

    /// Progress counters from `X-ClickHouse-Summary`, when the server sent
    /// them and they parse.
    pub fn summary(&self) -> Option<ResponseSummary> {
        let raw = self.headers.get(SUMMARY_HEADER)?.to_str().ok()?;
        match serde_json::from_str(raw) {
            Ok(summary) => Some(summary),
            Err(error) => {
                tracing::debug!(%error, "unparsable summary header");
                None
            }
        }
    }

    /// Next chunk of the lazy body, `None` once the stream ends. Each read
    /// is bounded by the socket timeout.
    pub async fn next_chunk(&mut self) -> crate::Result<Option<Bytes>> {
        loop {
            let Some(body) = self.body.as_mut() else {
                return Ok(None);
            };
            let step = tokio::time::timeout(self.socket_timeout, body.frame()).await;
            match step {
                Err(_) => {
                    self.body = None;
                    return Err(ClientFault::SocketTimeout(self.socket_timeout).into());
                }
                Ok(None) => {
                    self.drained = true;
                    self.body = None;
                }
                Ok(Some(Err(error))) => {
                    self.body = None;
                    return Err(ClientFault::BodyRead(error).into());
                }
                Ok(Some(Ok(frame))) => {
                    // Trailer frames carry no data and are skipped.
                    if let Ok(chunk) = frame.into_data() {
                        return Ok(Some(chunk));
                    }
                }
            }
        }
    }

    /// Collects the remaining body into memory.
    pub async fn bytes(&mut self) -> crate::Result<Bytes> {
        let mut buffer = BytesMut::with_capacity(ERROR_BODY_BUFFER);
        while let Some(chunk) = self.next_chunk().await? {
            buffer.put_slice(&chunk);
        }
        Ok(buffer.freeze())
    }

    /// Releases the underlying connection back to the pool.
    pub fn close(mut self) {
        self.release_lease();
    }

    fn header_str(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }

    fn release_lease(&mut self) {
        if let Some(lease) = self.lease.take() {
            lease.release(self.drained && self.body.is_none());
        }
    }
}

impl Drop for ResponseHandle {
    fn drop(&mut self) {
        self.release_lease();
    }
}

impl fmt::Debug for ResponseHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseHandle")
            .field("status", &self.status)
            .field("drained", &self.drained)
            .finish_non_exhaustive()
    }
}

/// Decides the outcome class of a received response.
///
/// 2xx hands the live body to the caller untouched. 4xx is deterministically
/// the client's fault: the body is extracted eagerly into a typed server
/// error. 5xx may carry a very large streaming payload and is a candidate
/// for higher-level retry, so the body is closed without extraction and the
/// raw status travels back on a successful handle. Redirects are not
/// followed for POSTed queries.
pub(crate) async fn classify(
    response: hyper::Response<Incoming>,
    lease: Lease,
    socket_timeout: Duration,
) -> Result<ResponseHandle, ClickHouseError> {
    let (parts, body) = response.into_parts();
    let status = parts.status;
    match status.as_u16() {
        200..=299 => Ok(ResponseHandle {
            status,
            headers: parts.headers,
            body: Some(body),
            lease: Some(lease),
            socket_timeout,
            drained: false,
        }),
        300..=399 => {
            lease.release(false);
            Err(ClientFault::Redirect {
                status: status.as_u16(),
            }
            .into())
        }
        400..=499 => match read_error(&parts.headers, body, socket_timeout).await {
            Ok(server_error) => {
                // The error body was drained in full, so the connection is
                // clean and can serve another request.
                lease.release(true);
                Err(server_error)
            }
            Err(fault) => {
                lease.release(false);
                Err(fault.into())
            }
        },
        500..=599 => {
            drop(body);
            lease.release(false);
            Ok(ResponseHandle {
                status,
                headers: parts.headers,
                body: None,
                lease: None,
                socket_timeout,
                drained: false,
            })
        }
        _ => {
            lease.release(false);
            Err(ClientFault::UnexpectedStatus {
                status: status.as_u16(),
            }
            .into())
        }
    }
}

/// Reads a 4xx body and synthesizes the typed server error. A failed body
/// read surfaces as a client I/O fault instead; the server code is lost in
/// that case.
async fn read_error(
    headers: &HeaderMap,
    body: Incoming,
    socket_timeout: Duration,
) -> Result<ClickHouseError, ClientFault> {
    let bytes = collect_body(body, socket_timeout).await?;
    let code = exception_code(headers);
    let message = String::from_utf8_lossy(&bytes).into_owned();
    Ok(ClickHouseError::Server { code, message })
}

async fn collect_body(mut body: Incoming, socket_timeout: Duration) -> Result<Bytes, ClientFault> {
    let mut buffer = BytesMut::with_capacity(ERROR_BODY_BUFFER);
    loop {
        match tokio::time::timeout(socket_timeout, body.frame()).await {
            Err(_) => return Err(ClientFault::SocketTimeout(socket_timeout)),
            Ok(None) => break,
            Ok(Some(Err(error))) => return Err(ClientFault::BodyRead(error)),
            Ok(Some(Ok(frame))) => {
                if let Some(chunk) = frame.data_ref() {
                    buffer.put_slice(chunk);
                }
            }
        }
    }
    Ok(buffer.freeze())
}

pub(crate) fn exception_code(headers: &HeaderMap) -> i32 {
    headers
        .get(EXCEPTION_CODE_HEADER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse().ok())
        .unwrap_or(0)
}

/// Progress counters the server reports in `X-ClickHouse-Summary`.
///
/// The header is a JSON object whose numbers arrive as decimal strings.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
pub struct ResponseSummary {
    #[serde(default, deserialize_with = "flexible_u64")]
    pub read_rows: u64,
    #[serde(default, deserialize_with = "flexible_u64")]
    pub read_bytes: u64,
    #[serde(default, deserialize_with = "flexible_u64")]
    pub written_rows: u64,
    #[serde(default, deserialize_with = "flexible_u64")]
    pub written_bytes: u64,
    #[serde(default, deserialize_with = "flexible_u64")]
    pub total_rows_to_read: u64,
    #[serde(default, deserialize_with = "flexible_u64")]
    pub result_rows: u64,
    #[serde(default, deserialize_with = "flexible_u64")]
    pub result_bytes: u64,
    #[serde(default, deserialize_with = "flexible_u64")]
    pub elapsed_ns: u64,
}

fn flexible_u64<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    struct Flexible;

    impl<'de> serde::de::Visitor<'de> for Flexible {
        type Value = u64;

        fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
            formatter.write_str("a non-negative integer or a decimal string")
        }

        fn visit_u64<E>(self, value: u64) -> Result<u64, E> {
            Ok(value)
        }

        fn visit_str<E>(self, value: &str) -> Result<u64, E>
        where
            E: serde::de::Error,
        {
            value.trim().parse().map_err(serde::de::Error::custom)
        }
    }

    deserializer.deserialize_any(Flexible)
}
