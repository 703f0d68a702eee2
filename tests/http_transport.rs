use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use axum::{
    body::Body,
    extract::{Request, State},
    response::Response,
    routing::post,
    Router,
};
use clickhouse_http::{
    ClickHouseClient, ClickHouseError, ClientFault, ClientSettings, Endpoint, QueryOptions,
};

#[derive(Clone)]
struct MockResponse {
    status: u16,
    headers: Vec<(&'static str, String)>,
    body: String,
    delay: Duration,
}

impl MockResponse {
    fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: body.into(),
            delay: Duration::from_millis(0),
        }
    }

    fn with_header(mut self, name: &'static str, value: impl Into<String>) -> Self {
        self.headers.push((name, value.into()));
        self
    }

    fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[derive(Clone, Debug)]
struct CapturedRequest {
    query: Option<String>,
    headers: axum::http::HeaderMap,
    body: String,
}

#[derive(Clone)]
struct MockState {
    responses: Arc<Mutex<VecDeque<MockResponse>>>,
    captured: Arc<Mutex<Vec<CapturedRequest>>>,
    hits: Arc<AtomicUsize>,
}

async fn query_handler(State(state): State<MockState>, request: Request) -> Response {
    state.hits.fetch_add(1, Ordering::SeqCst);

    let query = request.uri().query().map(str::to_owned);
    let headers = request.headers().clone();
    let body_bytes = axum::body::to_bytes(request.into_body(), usize::MAX)
        .await
        .unwrap_or_default();
    state
        .captured
        .lock()
        .expect("capture mutex must not be poisoned")
        .push(CapturedRequest {
            query,
            headers,
            body: String::from_utf8_lossy(&body_bytes).into_owned(),
        });

    let mock = {
        let mut queue = state
            .responses
            .lock()
            .expect("response queue mutex must not be poisoned");
        queue
            .pop_front()
            .unwrap_or_else(|| MockResponse::new(500, "no mock response available"))
    };

    if !mock.delay.is_zero() {
        tokio::time::sleep(mock.delay).await;
    }

    let mut builder = Response::builder().status(mock.status);
    for (name, value) in mock.headers {
        builder = builder.header(name, value);
    }
    builder
        .body(Body::from(mock.body))
        .expect("mock response must build")
}

struct TestServer {
    port: u16,
    captured: Arc<Mutex<Vec<CapturedRequest>>>,
    hits: Arc<AtomicUsize>,
    task: tokio::task::JoinHandle<()>,
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl TestServer {
    fn endpoint(&self) -> Endpoint {
        Endpoint::http("127.0.0.1", self.port).expect("endpoint must build")
    }

    fn last_request(&self) -> CapturedRequest {
        self.captured
            .lock()
            .expect("capture mutex must not be poisoned")
            .last()
            .cloned()
            .expect("a request must have been captured")
    }
}

async fn spawn_server(responses: Vec<MockResponse>) -> TestServer {
    let state = MockState {
        responses: Arc::new(Mutex::new(responses.into())),
        captured: Arc::new(Mutex::new(Vec::new())),
        hits: Arc::new(AtomicUsize::new(0)),
    };

    let app = Router::new()
        .route("/", post(query_handler))
        .with_state(state.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("must bind test listener");
    let port = listener.local_addr().expect("must have local addr").port();
    let task = tokio::spawn(async move {
        axum::serve(listener, app).await.expect("mock server must run");
    });

    TestServer {
        port,
        captured: state.captured,
        hits: state.hits,
        task,
    }
}

fn client(server: &TestServer) -> ClickHouseClient {
    ClickHouseClient::new(server.endpoint()).expect("client must build")
}

fn client_with(server: &TestServer, settings: ClientSettings) -> ClickHouseClient {
    ClickHouseClient::with_settings(server.endpoint(), settings).expect("client must build")
}

#[tokio::test]
async fn success_returns_handle_with_lazy_body() {
    let server = spawn_server(vec![MockResponse::new(200, "1\n")]).await;
    let db = client(&server);

    let mut handle = db
        .execute("SELECT 1", QueryOptions::new())
        .await
        .expect("execute must succeed")
        .expect("server must be reachable");

    assert_eq!(handle.status().as_u16(), 200);
    let body = handle.bytes().await.expect("body must read");
    assert_eq!(body.as_ref(), b"1\n");
    assert_eq!(server.hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn bad_request_becomes_typed_server_error() {
    let server = spawn_server(vec![MockResponse::new(400, "Syntax error")
        .with_header("x-clickhouse-exception-code", "62")])
    .await;
    let db = client(&server);

    let err = db
        .execute("BAD SQL", QueryOptions::new())
        .await
        .expect_err("a 4xx must fail the future");

    match err {
        ClickHouseError::Server { code, message } => {
            assert_eq!(code, 62);
            assert_eq!(message, "Syntax error");
        }
        other => panic!("expected server error, got {other:?}"),
    }
}

#[tokio::test]
async fn bad_request_without_code_header_defaults_to_zero() {
    let server = spawn_server(vec![MockResponse::new(404, "there is no such table")]).await;
    let db = client(&server);

    let err = db
        .execute("SELECT * FROM missing", QueryOptions::new())
        .await
        .expect_err("a 4xx must fail the future");

    assert_eq!(err.server_code(), Some(0));
}

#[tokio::test]
async fn internal_error_resolves_with_closed_handle() {
    let server = spawn_server(vec![MockResponse::new(500, "Code: 999. DB::Exception")]).await;
    let db = client(&server);

    let mut handle = db
        .execute("SELECT 1", QueryOptions::new())
        .await
        .expect("a 5xx must resolve successfully")
        .expect("server must be reachable");

    assert_eq!(handle.status().as_u16(), 500);
    // The 5xx body was closed without extraction at the transport layer.
    let body = handle.bytes().await.expect("reading a closed body is empty");
    assert!(body.is_empty());
}

#[tokio::test]
async fn format_option_travels_as_header() {
    let server = spawn_server(vec![MockResponse::new(200, "{}\n")]).await;
    let db = client(&server);

    db.execute("SELECT 1", QueryOptions::new().format("JSON"))
        .await
        .expect("execute must succeed")
        .expect("server must be reachable");

    let request = server.last_request();
    assert_eq!(request.headers["x-clickhouse-format"], "JSON");
    assert_eq!(request.headers["content-type"], "text/plain");
    assert_eq!(request.headers["accept"], "text/plain");
    assert_eq!(request.body, "SELECT 1");
}

#[tokio::test]
async fn recognized_options_become_query_params_on_the_wire() {
    let server = spawn_server(vec![MockResponse::new(200, "1\n")]).await;
    let db = client(&server);

    db.execute(
        "SELECT 1",
        QueryOptions::new()
            .query_id("q-42")
            .wait_end_of_query(true)
            .option("mystery_knob", "7"),
    )
    .await
    .expect("execute must succeed")
    .expect("server must be reachable");

    let request = server.last_request();
    let query = request.query.expect("must have query params");
    assert!(query.contains("query_id=q-42"));
    assert!(query.contains("wait_end_of_query=1"));
    assert!(!query.contains("mystery_knob"));
}

#[tokio::test]
async fn per_request_option_overrides_client_setting() {
    let server = spawn_server(vec![MockResponse::new(200, "1\n")]).await;
    let db = client_with(
        &server,
        ClientSettings::new().set("format", "TabSeparated"),
    );

    db.execute("SELECT 1", QueryOptions::new().format("JSONEachRow"))
        .await
        .expect("execute must succeed")
        .expect("server must be reachable");

    assert_eq!(
        server.last_request().headers["x-clickhouse-format"],
        "JSONEachRow"
    );
}

#[tokio::test]
async fn credentials_travel_as_clickhouse_headers() {
    let server = spawn_server(vec![MockResponse::new(200, "1\n")]).await;
    let db = client_with(
        &server,
        ClientSettings::new()
            .set("user", "reader")
            .set("password", "hunter2"),
    );

    db.execute("SELECT 1", QueryOptions::new())
        .await
        .expect("execute must succeed")
        .expect("server must be reachable");

    let request = server.last_request();
    assert_eq!(request.headers["x-clickhouse-user"], "reader");
    assert_eq!(request.headers["x-clickhouse-key"], "hunter2");
}

#[tokio::test]
async fn summary_header_is_exposed_on_the_handle() {
    let summary =
        r#"{"read_rows":"10","read_bytes":"780","written_rows":"0","written_bytes":"0","total_rows_to_read":"10","result_rows":"10","result_bytes":"320","elapsed_ns":"1452980"}"#;
    let server = spawn_server(vec![MockResponse::new(200, "rows\n")
        .with_header("x-clickhouse-summary", summary)
        .with_header("x-clickhouse-query-id", "q-7")
        .with_header("x-clickhouse-timezone", "UTC")])
    .await;
    let db = client(&server);

    let handle = db
        .execute("SELECT 1", QueryOptions::new())
        .await
        .expect("execute must succeed")
        .expect("server must be reachable");

    let summary = handle.summary().expect("summary must parse");
    assert_eq!(summary.read_rows, 10);
    assert_eq!(summary.result_bytes, 320);
    assert_eq!(handle.query_id(), Some("q-7"));
    assert_eq!(handle.timezone(), Some("UTC"));
}

#[tokio::test]
async fn unknown_host_resolves_to_empty_sentinel() {
    let endpoint =
        Endpoint::parse("http://no-such-clickhouse-host.invalid:8123").expect("endpoint");
    let db = ClickHouseClient::new(endpoint).expect("client must build");

    let outcome = db
        .execute("SELECT 1", QueryOptions::new())
        .await
        .expect("a soft transport fault must not fail the future");
    assert!(outcome.is_none());
}

#[tokio::test]
async fn connection_refused_resolves_to_empty_sentinel() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("must bind");
    let port = listener.local_addr().expect("local addr").port();
    drop(listener);
    let db = ClickHouseClient::new(Endpoint::http("127.0.0.1", port).expect("endpoint"))
        .expect("client must build");

    let outcome = db
        .execute("SELECT 1", QueryOptions::new())
        .await
        .expect("a refused connection must not fail the future");
    assert!(outcome.is_none());
}

#[tokio::test]
async fn redirect_is_a_client_error() {
    let server = spawn_server(vec![
        MockResponse::new(302, "").with_header("location", "http://elsewhere.invalid/")
    ])
    .await;
    let db = client(&server);

    let err = db
        .execute("SELECT 1", QueryOptions::new())
        .await
        .expect_err("redirects are not followed");

    assert!(matches!(
        err,
        ClickHouseError::Client(ClientFault::Redirect { status: 302 })
    ));
}

#[tokio::test]
async fn slow_response_surfaces_socket_timeout() {
    let server = spawn_server(vec![
        MockResponse::new(200, "1\n").with_delay(Duration::from_millis(500))
    ])
    .await;
    let db = client(&server);

    let err = db
        .execute(
            "SELECT sleep(3)",
            QueryOptions::new().socket_timeout(Duration::from_millis(50)),
        )
        .await
        .expect_err("the response must time out");

    assert!(matches!(
        err,
        ClickHouseError::Client(ClientFault::SocketTimeout(_))
    ));
}

#[tokio::test]
async fn synchronous_dispatch_behaves_identically() {
    let server = spawn_server(vec![MockResponse::new(200, "1\n")]).await;
    let db = client_with(&server, ClientSettings::new().set("async", "false"));

    let mut handle = db
        .execute("SELECT 1", QueryOptions::new())
        .await
        .expect("execute must succeed")
        .expect("server must be reachable");

    assert_eq!(handle.status().as_u16(), 200);
    assert_eq!(handle.bytes().await.expect("body").as_ref(), b"1\n");
}
