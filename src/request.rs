use std::collections::BTreeMap;
use std::time::Duration;

use bytes::Bytes;
use http::header::{self, HeaderMap};
use http::{Method, Request, Uri};
use http_body_util::Full;

use crate::endpoint::Endpoint;
use crate::error::ClientFault;
use crate::options::{OptionKey, Placement, QueryOptions};
use crate::settings::ClientSettings;

const TEXT_PLAIN: &str = "text/plain";

/// Per-request timeout block, composed from client defaults and per-request
/// overrides. Each knob is independent; a per-request value may raise the
/// client-wide one as well as lower it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RequestTimeouts {
    /// Maximum time for the TCP (and TLS) handshake.
    pub connect: Duration,
    /// Maximum wait for response bytes.
    pub socket_read: Duration,
    /// Maximum wait for a pool slot.
    pub connection_request: Duration,
}

impl RequestTimeouts {
    /// Pure merge: per-request option > client configuration > default.
    pub(crate) fn resolve(
        settings: &ClientSettings,
        options: &QueryOptions,
    ) -> Result<Self, ClientFault> {
        Ok(Self {
            connect: override_millis(options, OptionKey::ConnectTimeout)?
                .unwrap_or_else(|| settings.connect_timeout()),
            socket_read: override_millis(options, OptionKey::SocketTimeout)?
                .unwrap_or_else(|| settings.socket_timeout()),
            connection_request: override_millis(options, OptionKey::ConnectionRequestTimeout)?
                .unwrap_or_else(|| settings.connection_request_timeout()),
        })
    }
}

fn override_millis(
    options: &QueryOptions,
    option: OptionKey,
) -> Result<Option<Duration>, ClientFault> {
    match options.get(option.key()) {
        None => Ok(None),
        Some(value) => value
            .parse::<u64>()
            .map(|millis| Some(Duration::from_millis(millis)))
            .map_err(|_| {
                ClientFault::Config(format!(
                    "option '{}' must be a duration in milliseconds, got '{value}'",
                    option.key()
                ))
            }),
    }
}

/// Assembles the concrete HTTP POST for one query.
///
/// The URI starts from the endpoint base and gains a query parameter for
/// every recognized URI-placed option present in the merged map; merged maps
/// are ordered, so equal inputs produce byte-identical requests. Headers not
/// owned by the assembler (authentication) are passed through untouched.
pub(crate) fn build_request(
    endpoint: &Endpoint,
    merged: &BTreeMap<String, String>,
    extra_headers: &HeaderMap,
    body: Bytes,
    absolute_form: bool,
) -> Result<Request<Full<Bytes>>, ClientFault> {
    let uri = build_uri(endpoint, merged, absolute_form)?;

    let mut builder = Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header(header::HOST, endpoint.authority())
        .header(header::CONTENT_TYPE, TEXT_PLAIN)
        .header(header::ACCEPT, TEXT_PLAIN);

    for (key, value) in merged {
        if let Some(Placement::Header(name)) = OptionKey::from_key(key).map(OptionKey::placement) {
            builder = builder.header(name, value);
        }
    }

    // The entity is attached as-is; Full wraps the caller's Bytes without
    // copying.
    let mut request = builder.body(Full::new(body))?;
    for (name, value) in extra_headers {
        request.headers_mut().insert(name, value.clone());
    }
    Ok(request)
}

fn build_uri(
    endpoint: &Endpoint,
    merged: &BTreeMap<String, String>,
    absolute_form: bool,
) -> Result<Uri, ClientFault> {
    let mut url = endpoint.base_url().clone();
    let params: Vec<(&str, &str)> = merged
        .iter()
        .filter(|(key, _)| {
            matches!(
                OptionKey::from_key(key).map(OptionKey::placement),
                Some(Placement::UriParam)
            )
        })
        .map(|(key, value)| (key.as_str(), value.as_str()))
        .collect();
    // query_pairs_mut leaves a dangling '?' behind when nothing is appended,
    // so it is only entered for a non-empty parameter set.
    if !params.is_empty() {
        let mut pairs = url.query_pairs_mut();
        for (key, value) in params {
            pairs.append_pair(key, value);
        }
    }

    // Proxied requests use absolute-form, direct ones origin-form; the conn
    // API does not rewrite the URI for us either way.
    let uri = if absolute_form {
        url.as_str().to_owned()
    } else {
        match url.query() {
            Some(query) => format!("{}?{query}", url.path()),
            None => url.path().to_owned(),
        }
    };
    uri.parse::<Uri>()
        .map_err(http::Error::from)
        .map_err(ClientFault::InvalidRequest)
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use http::header::HeaderMap;

    use super::{build_request, RequestTimeouts};
    use crate::endpoint::Endpoint;
    use crate::options::{merge_options, QueryOptions};
    use crate::settings::ClientSettings;
    use std::time::Duration;

    fn endpoint() -> Endpoint {
        Endpoint::http("localhost", 8123).expect("endpoint")
    }

    fn assemble(options: QueryOptions) -> http::Request<http_body_util::Full<Bytes>> {
        let settings = ClientSettings::new();
        let merged = merge_options(&settings, &options);
        build_request(
            &endpoint(),
            &merged,
            &HeaderMap::new(),
            Bytes::from_static(b"SELECT 1"),
            false,
        )
        .expect("request must assemble")
    }

    #[test]
    fn content_type_and_accept_are_always_text_plain() {
        let request = assemble(QueryOptions::new());
        assert_eq!(request.method(), http::Method::POST);
        assert_eq!(request.headers()["content-type"], "text/plain");
        assert_eq!(request.headers()["accept"], "text/plain");
        assert_eq!(request.headers()["host"], "localhost:8123");
    }

    #[test]
    fn recognized_options_become_query_params() {
        let request = assemble(
            QueryOptions::new()
                .query_id("q-42")
                .wait_end_of_query(true),
        );
        let query = request.uri().query().expect("must have query");
        assert!(query.contains("query_id=q-42"));
        assert!(query.contains("wait_end_of_query=1"));
    }

    #[test]
    fn unknown_options_never_reach_uri_or_headers() {
        let request = assemble(QueryOptions::new().option("mystery", "1"));
        assert_eq!(request.uri().query(), None);
        assert!(!request.headers().contains_key("mystery"));
    }

    #[test]
    fn format_option_becomes_header_not_query_param() {
        let request = assemble(QueryOptions::new().format("JSON"));
        assert_eq!(request.headers()["x-clickhouse-format"], "JSON");
        assert_eq!(request.uri().query(), None);
    }

    #[test]
    fn client_level_options_never_leak() {
        let settings = ClientSettings::new()
            .set("password", "secret")
            .set("max_connections", "5");
        let merged = merge_options(&settings, &QueryOptions::new());
        let request = build_request(
            &endpoint(),
            &merged,
            &HeaderMap::new(),
            Bytes::new(),
            false,
        )
        .expect("request must assemble");
        assert_eq!(request.uri().query(), None);
        assert!(!request.headers().contains_key("password"));
        assert!(!request.headers().contains_key("max_connections"));
    }

    #[test]
    fn assembly_is_idempotent() {
        let options = QueryOptions::new()
            .query_id("stable")
            .wait_end_of_query(true)
            .format("JSONEachRow");
        let first = assemble(options.clone());
        let second = assemble(options);
        assert_eq!(first.uri(), second.uri());
        assert_eq!(first.headers(), second.headers());
    }

    #[test]
    fn absolute_form_keeps_full_url() {
        let merged = merge_options(&ClientSettings::new(), &QueryOptions::new());
        let request = build_request(
            &endpoint(),
            &merged,
            &HeaderMap::new(),
            Bytes::new(),
            true,
        )
        .expect("request must assemble");
        assert_eq!(request.uri().to_string(), "http://localhost:8123/");
    }

    #[test]
    fn extra_headers_pass_through_untouched() {
        let mut extra = HeaderMap::new();
        extra.insert("x-clickhouse-user", "reader".parse().expect("value"));
        let merged = merge_options(&ClientSettings::new(), &QueryOptions::new());
        let request = build_request(&endpoint(), &merged, &extra, Bytes::new(), false)
            .expect("request must assemble");
        assert_eq!(request.headers()["x-clickhouse-user"], "reader");
    }

    #[test]
    fn per_request_timeouts_override_client_defaults() {
        let settings = ClientSettings::new().set("socket_timeout", "30000");
        let options = QueryOptions::new()
            .socket_timeout(Duration::from_millis(150))
            .connection_request_timeout(Duration::from_millis(5));
        let timeouts = RequestTimeouts::resolve(&settings, &options).expect("must resolve");
        assert_eq!(timeouts.socket_read, Duration::from_millis(150));
        assert_eq!(timeouts.connection_request, Duration::from_millis(5));
        assert_eq!(timeouts.connect, Duration::from_secs(10));
    }

    #[test]
    fn unparsable_per_request_timeout_is_a_config_error() {
        let options = QueryOptions::new().option("socket_timeout", "soon");
        assert!(RequestTimeouts::resolve(&ClientSettings::new(), &options).is_err());
    }
}
