use axum::Router;
use axum::extract::State;
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use bytes::Bytes;
use livepaste_client_core::buffer::Buffer;
use livepaste_client_core::config::ClientConfig;
use livepaste_client_core::notify::ChannelSink;
use livepaste_client_core::session::upload::UploadTarget;
use livepaste_client_core::session::{
    ApiFlavor, Negotiator, SessionController, SessionCredentials, SessionStatus,
};
use livepaste_client_core::transport::{Outcome, ReqwestTransport, Transport, TransportRequest};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone)]
struct Hit {
    method: Method,
    path: String,
    query: HashMap<String, String>,
    content_type: Option<String>,
    body: Bytes,
}

#[derive(Clone, Default)]
struct Recorder {
    hits: Arc<Mutex<Vec<Hit>>>,
    replies: Arc<Mutex<HashMap<String, (StatusCode, String)>>>,
}

impl Recorder {
    fn reply(&self, path: &str, status: StatusCode, body: &str) {
        self.replies
            .lock()
            .insert(path.to_string(), (status, body.to_string()));
    }

    fn hits(&self, path: &str) -> Vec<Hit> {
        self.hits
            .lock()
            .iter()
            .filter(|hit| hit.path == path)
            .cloned()
            .collect()
    }

    async fn wait_for(&self, path: &str, count: usize) -> Vec<Hit> {
        loop {
            let hits = self.hits(path);
            if hits.len() >= count {
                return hits;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

async fn record(
    State(recorder): State<Recorder>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, String) {
    let path = uri.path().to_string();
    let query = url::form_urlencoded::parse(uri.query().unwrap_or_default().as_bytes())
        .into_owned()
        .collect();
    let content_type = headers
        .get(axum::http::header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    recorder.hits.lock().push(Hit {
        method,
        path: path.clone(),
        query,
        content_type,
        body,
    });

    if path.ends_with("/slow") {
        tokio::time::sleep(Duration::from_secs(2)).await;
    }
    let reply = recorder.replies.lock().get(&path).cloned();
    reply.unwrap_or((StatusCode::OK, String::new()))
}

async fn serve() -> (SocketAddr, Recorder) {
    let recorder = Recorder::default();
    let app = Router::new()
        .fallback(record)
        .with_state(recorder.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, recorder)
}

fn client(addr: SocketAddr) -> (ClientConfig, ReqwestTransport) {
    let config = ClientConfig::new(format!("http://{addr}"), "1")
        .unwrap()
        .with_request_timeout(Some(Duration::from_secs(5)));
    let transport = ReqwestTransport::new(&config).unwrap();
    (config, transport)
}

fn negotiator(config: &ClientConfig, transport: &ReqwestTransport) -> Negotiator {
    Negotiator::new(
        Arc::new(transport.clone()),
        config.flavor.endpoints(),
        config.request_timeout,
    )
}

#[test_timeout::tokio_timeout_test(20)]
async fn session_request_declares_utf8_length() {
    let (addr, recorder) = serve().await;
    recorder.reply("/1/id/request", StatusCode::OK, "Ab3xYz,S3cr3t");
    let (config, transport) = client(addr);

    let credentials = negotiator(&config, &transport)
        .request_session(Buffer::capture("😀").byte_len())
        .await
        .unwrap();

    assert_eq!(credentials.id(), "Ab3xYz");
    assert_eq!(credentials.secret(), "S3cr3t");
    let hits = recorder.hits("/1/id/request");
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].method, Method::POST);
    assert_eq!(hits[0].query.get("length").map(String::as_str), Some("4"));
    assert!(hits[0].body.is_empty());
}

#[test_timeout::tokio_timeout_test(20)]
async fn upload_carries_plain_text_body_and_credentials() {
    let (addr, recorder) = serve().await;
    recorder.reply("/1/file/upload", StatusCode::OK, "Sent!");
    let (_config, transport) = client(addr);
    let target = UploadTarget {
        credentials: SessionCredentials::new("id1", "sec1"),
        buffer: Buffer::capture("héllo"),
        path: ApiFlavor::V1.endpoints().upload,
        timeout: None,
    };

    let outcome = transport.execute(target.request()).await;

    assert_eq!(outcome, Outcome::Success("Sent!".into()));
    let hit = &recorder.hits("/1/file/upload")[0];
    assert_eq!(hit.method, Method::POST);
    assert_eq!(hit.content_type.as_deref(), Some("text/plain; charset=utf-8"));
    assert_eq!(&hit.body[..], "héllo".as_bytes());
    assert_eq!(hit.query.get("id").map(String::as_str), Some("id1"));
    assert_eq!(hit.query.get("secret").map(String::as_str), Some("sec1"));
}

#[test_timeout::tokio_timeout_test(20)]
async fn non_success_status_is_an_http_error() {
    let (addr, recorder) = serve().await;
    recorder.reply("/1/file/upload", StatusCode::INTERNAL_SERVER_ERROR, "boom");
    let (_config, transport) = client(addr);

    let outcome = transport
        .execute(TransportRequest::post("file/upload"))
        .await;

    assert_eq!(
        outcome,
        Outcome::HttpError {
            status: 500,
            body: "boom".into()
        }
    );
}

#[test_timeout::tokio_timeout_test(20)]
async fn slow_response_maps_to_timeout() {
    let (addr, _recorder) = serve().await;
    let (_config, transport) = client(addr);

    let outcome = transport
        .execute(TransportRequest::post("slow").timeout(Some(Duration::from_millis(200))))
        .await;

    assert_eq!(outcome, Outcome::Timeout);
}

#[test_timeout::tokio_timeout_test(20)]
async fn refused_connection_is_a_network_error() {
    let addr = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap()
    };
    let (_config, transport) = client(addr);

    let outcome = transport
        .execute(TransportRequest::post("id/request"))
        .await;

    assert!(matches!(outcome, Outcome::NetworkError(_)), "{outcome:?}");
}

#[test_timeout::tokio_timeout_test(20)]
async fn secrets_are_percent_encoded_on_the_wire() {
    let (addr, recorder) = serve().await;
    let (config, transport) = client(addr);
    let credentials = SessionCredentials::new("id 1", "a+b&c=d");

    let outcome = negotiator(&config, &transport).retire(&credentials).await;

    assert!(outcome.is_success());
    let hit = &recorder.hits("/1/id/retire")[0];
    assert_eq!(hit.query.get("id").map(String::as_str), Some("id 1"));
    assert_eq!(hit.query.get("secret").map(String::as_str), Some("a+b&c=d"));
}

#[test_timeout::tokio_timeout_test(20)]
async fn blocking_retirement_reaches_server() {
    let (addr, recorder) = serve().await;
    let (config, transport) = client(addr);
    let negotiator = negotiator(&config, &transport);

    let outcome = tokio::task::spawn_blocking(move || {
        negotiator.retire_blocking(&SessionCredentials::new("id1", "sec1"))
    })
    .await
    .unwrap();

    assert!(outcome.is_success());
    let hits = recorder.hits("/1/id/retire");
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].query.get("secret").map(String::as_str), Some("sec1"));
}

#[test_timeout::tokio_timeout_test(20)]
async fn beacons_are_flushed_before_exit() {
    let (addr, recorder) = serve().await;
    let (_config, transport) = client(addr);
    let request = TransportRequest::post("id/retire")
        .query("id", "id1")
        .query("secret", "sec1");

    assert!(transport.beacon(request));
    let pending = transport.flush_beacons(Duration::from_secs(5)).await;

    assert_eq!(pending, 0);
    assert_eq!(recorder.hits("/1/id/retire").len(), 1);
}

#[test_timeout::tokio_timeout_test(20)]
async fn disabled_beacon_is_declined() {
    let (addr, recorder) = serve().await;
    let config = ClientConfig::new(format!("http://{addr}"), "1")
        .unwrap()
        .with_beacon(false);
    let transport = ReqwestTransport::new(&config).unwrap();

    assert!(!transport.beacon(TransportRequest::post("id/retire")));
    assert_eq!(transport.flush_beacons(Duration::from_millis(50)).await, 0);
    assert!(recorder.hits("/1/id/retire").is_empty());
}

#[test_timeout::tokio_timeout_test(20)]
async fn controller_round_trip_over_http() {
    let (addr, recorder) = serve().await;
    recorder.reply("/1/id/request", StatusCode::OK, "Ab3xYz,S3cr3t\n");
    recorder.reply("/1/file/upload", StatusCode::OK, "Sent!");
    let (config, transport) = client(addr);
    let (sink, _events) = ChannelSink::new();
    let controller = SessionController::new(config, Arc::new(transport.clone()), Arc::new(sink));

    let info = controller.start(Buffer::capture("live text")).await.unwrap();
    assert_eq!(
        info.link.as_str(),
        format!("http://{addr}/1/file/download?id=Ab3xYz")
    );

    let uploads = recorder.wait_for("/1/file/upload", 3).await;
    assert!(uploads.iter().all(|hit| &hit.body[..] == b"live text"));
    controller.cancel().await.unwrap();

    assert_eq!(controller.status().status, SessionStatus::Retired);
    let retired = recorder.hits("/1/id/retire");
    assert_eq!(retired.len(), 1);
    assert_eq!(retired[0].query.get("id").map(String::as_str), Some("Ab3xYz"));
}
