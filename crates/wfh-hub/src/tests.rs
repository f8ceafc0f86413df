use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Form, Path, Query, State};
use axum::http::{HeaderMap, StatusCode, Uri, header::AUTHORIZATION};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};

use bytes::BytesMut;

use rumqttc::v5::mqttbytes::v5::{
    ConnAck, ConnectReturnCode, Packet, PingResp, Publish, SubAck, SubscribeReasonCode,
};
use rumqttc::v5::mqttbytes::{Error as MqttError, QoS};

use serde::Deserialize;
use serde_json::{Value, json};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use tokio_util::sync::CancellationToken;

use crate::config::ServerConfig;

pub(crate) const USER: &str = "user@wastefree.home";
pub(crate) const PASSWORD: &str = "password";

// How long a request for a hanging device lasts.
const HANG_TIME: Duration = Duration::from_secs(60);

#[derive(Default)]
struct MockState {
    auth_calls: AtomicUsize,
    issued_tokens: AtomicUsize,
    records_attempts: AtomicUsize,
    toggle_attempts: AtomicUsize,
    reject_all_tokens: AtomicBool,
    records_status: AtomicU16,
    current_token: Mutex<String>,
    hanging_device: Mutex<Option<String>>,
    records: Mutex<Vec<(String, Value)>>,
    toggles: Mutex<Vec<(String, bool)>>,
    uris: Mutex<Vec<String>>,
}

impl MockState {
    fn authorized(&self, headers: &HeaderMap) -> bool {
        if self.reject_all_tokens.load(Ordering::SeqCst) {
            return false;
        }
        let current = self.current_token.lock().unwrap().clone();
        !current.is_empty()
            && headers
                .get(AUTHORIZATION)
                .and_then(|value| value.to_str().ok())
                == Some(format!("Bearer {current}").as_str())
    }

    async fn hang_if_requested(&self, device_id: &str) {
        let hanging = self.hanging_device.lock().unwrap().clone();
        if hanging.as_deref() == Some(device_id) {
            tokio::time::sleep(HANG_TIME).await;
        }
    }
}

#[derive(Deserialize)]
struct AuthForm {
    username: String,
    password: String,
}

#[derive(Deserialize)]
struct ToggleQuery {
    is_online: bool,
}

async fn auth(State(state): State<Arc<MockState>>, Form(form): Form<AuthForm>) -> Response {
    let _ = state.auth_calls.fetch_add(1, Ordering::SeqCst);

    if form.username != USER || form.password != PASSWORD {
        return StatusCode::UNAUTHORIZED.into_response();
    }

    let issued = state.issued_tokens.fetch_add(1, Ordering::SeqCst) + 1;
    let token = format!("token-{issued}");
    state.current_token.lock().unwrap().clone_from(&token);

    Json(json!({ "access_token": token, "token_type": "bearer" })).into_response()
}

async fn record(
    State(state): State<Arc<MockState>>,
    Path(device_id): Path<String>,
    uri: Uri,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    let _ = state.records_attempts.fetch_add(1, Ordering::SeqCst);

    if !state.authorized(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }

    let status = state.records_status.load(Ordering::SeqCst);
    if status != 0 {
        return StatusCode::from_u16(status)
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
            .into_response();
    }

    state.hang_if_requested(&device_id).await;

    state.uris.lock().unwrap().push(uri.to_string());
    state.records.lock().unwrap().push((device_id, body));

    (StatusCode::CREATED, Json(json!({ "status": "created" }))).into_response()
}

async fn toggle(
    State(state): State<Arc<MockState>>,
    Path(device_id): Path<String>,
    Query(query): Query<ToggleQuery>,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    let _ = state.toggle_attempts.fetch_add(1, Ordering::SeqCst);

    if !state.authorized(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }

    state.hang_if_requested(&device_id).await;

    state.uris.lock().unwrap().push(uri.to_string());
    state
        .toggles
        .lock()
        .unwrap()
        .push((device_id, query.is_online));

    Json(json!({ "status": "ok" })).into_response()
}

/// A stand-in for the server auth, records and toggle endpoints.
pub(crate) struct MockServer {
    address: SocketAddr,
    state: Arc<MockState>,
    cancellation_token: CancellationToken,
    handle: JoinHandle<()>,
}

impl MockServer {
    pub(crate) async fn start() -> Self {
        let state = Arc::new(MockState::default());

        let router = Router::new()
            .route("/API/auth", post(auth))
            .route("/records/{device_id}", post(record))
            .route("/devices/{device_id}/toggle", post(toggle))
            .with_state(Arc::clone(&state));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();

        let cancellation_token = CancellationToken::new();
        let shutdown = cancellation_token.clone();
        let handle = tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await
                .unwrap();
        });

        Self {
            address,
            state,
            cancellation_token,
            handle,
        }
    }

    pub(crate) fn config(&self) -> ServerConfig {
        let mut config = ServerConfig::new(self.address.ip().to_string(), self.address.port())
            .timeout(Duration::from_secs(120));
        config.records_endpoint = "records".into();
        config.devices_endpoint = "devices".into();
        config
    }

    pub(crate) fn reject_all_tokens(&self) {
        self.state.reject_all_tokens.store(true, Ordering::SeqCst);
    }

    pub(crate) fn fail_records_with(&self, status: u16) {
        self.state.records_status.store(status, Ordering::SeqCst);
    }

    pub(crate) fn hang_device(&self, device_id: &str) {
        *self.state.hanging_device.lock().unwrap() = Some(device_id.to_string());
    }

    pub(crate) fn auth_calls(&self) -> usize {
        self.state.auth_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn records_attempts(&self) -> usize {
        self.state.records_attempts.load(Ordering::SeqCst)
    }

    pub(crate) fn toggle_attempts(&self) -> usize {
        self.state.toggle_attempts.load(Ordering::SeqCst)
    }

    pub(crate) fn records(&self) -> Vec<(String, Value)> {
        self.state.records.lock().unwrap().clone()
    }

    pub(crate) fn toggles(&self) -> Vec<(String, bool)> {
        self.state.toggles.lock().unwrap().clone()
    }

    pub(crate) fn uris(&self) -> Vec<String> {
        self.state.uris.lock().unwrap().clone()
    }

    pub(crate) async fn shutdown(self) {
        self.cancellation_token.cancel();
        self.handle.await.unwrap();
    }
}

async fn read_packet(stream: &mut TcpStream, buffer: &mut BytesMut) -> Option<Packet> {
    loop {
        match Packet::read(buffer, None) {
            Ok(packet) => return Some(packet),
            Err(MqttError::InsufficientBytes(_)) => {}
            Err(_) => return None,
        }
        match stream.read_buf(buffer).await {
            Ok(0) | Err(_) => return None,
            Ok(_) => {}
        }
    }
}

async fn write_packet(stream: &mut TcpStream, packet: &Packet) -> bool {
    let mut buffer = BytesMut::new();
    packet.write(&mut buffer, None).is_ok() && stream.write_all(&buffer).await.is_ok()
}

// Serves a single broker session, returns when the session ends.
async fn serve_session(
    mut stream: TcpStream,
    first: bool,
    filters: usize,
    publish: &Publish,
    subscriptions: &Mutex<Vec<Vec<String>>>,
) {
    let mut buffer = BytesMut::new();
    let Some(Packet::Connect(..)) = read_packet(&mut stream, &mut buffer).await else {
        return;
    };

    subscriptions.lock().unwrap().push(Vec::new());

    let connack = Packet::ConnAck(ConnAck {
        session_present: false,
        code: ConnectReturnCode::Success,
        properties: None,
    });
    if !write_packet(&mut stream, &connack).await {
        return;
    }

    while let Some(packet) = read_packet(&mut stream, &mut buffer).await {
        match packet {
            Packet::Subscribe(subscribe) => {
                let subscribed = {
                    let mut subscriptions = subscriptions.lock().unwrap();
                    let session = subscriptions.last_mut().unwrap();
                    session.extend(subscribe.filters.iter().map(|filter| filter.path.clone()));
                    session.len()
                };

                let suback = Packet::SubAck(SubAck {
                    pkid: subscribe.pkid,
                    return_codes: vec![
                        SubscribeReasonCode::Success(QoS::AtMostOnce);
                        subscribe.filters.len()
                    ],
                    properties: None,
                });
                if !write_packet(&mut stream, &suback).await {
                    return;
                }

                // The first session publishes once and is then dropped.
                if first && subscribed == filters {
                    let _ = write_packet(&mut stream, &Packet::Publish(publish.clone())).await;
                    return;
                }
            }
            Packet::PingReq(_) => {
                if !write_packet(&mut stream, &Packet::PingResp(PingResp)).await {
                    return;
                }
            }
            _ => {}
        }
    }
}

/// A minimal `MQTT` v5 broker.
///
/// Its first session publishes a single message as soon as `filters` topic
/// filters are subscribed, then the connection is dropped. Later sessions
/// stay open and only acknowledge subscriptions.
pub(crate) struct MockBroker {
    address: SocketAddr,
    subscriptions: Arc<Mutex<Vec<Vec<String>>>>,
    handle: JoinHandle<()>,
}

impl MockBroker {
    pub(crate) async fn start(filters: usize, topic: &str, payload: &'static [u8]) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();

        let publish = Publish::new(topic, QoS::AtMostOnce, payload, None);
        let subscriptions = Arc::new(Mutex::new(Vec::new()));
        let sessions = Arc::clone(&subscriptions);

        // Sessions are served one at a time.
        let handle = tokio::spawn(async move {
            let mut first = true;
            while let Ok((stream, _)) = listener.accept().await {
                serve_session(stream, first, filters, &publish, &sessions).await;
                first = false;
            }
        });

        Self {
            address,
            subscriptions,
            handle,
        }
    }

    pub(crate) const fn address(&self) -> SocketAddr {
        self.address
    }

    /// Topic filters subscribed in each session, in connection order.
    pub(crate) fn subscriptions(&self) -> Vec<Vec<String>> {
        self.subscriptions.lock().unwrap().clone()
    }
}

impl Drop for MockBroker {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

// Polls a condition until it holds or the timeout expires.
pub(crate) async fn wait_until<F: Fn() -> bool>(timeout: Duration, condition: F) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
