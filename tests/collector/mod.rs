//! In-process mock collector for upload tests
//!
//! Answers each request with the next scripted status (or the default),
//! optionally after a delay, and records what it accepted.

use axum::{
    body::Bytes,
    extract::State,
    http::{header, HeaderMap, StatusCode},
    routing::post,
    Router,
};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Default)]
struct CollectorState {
    scripted: Mutex<VecDeque<u16>>,
    default_status: AtomicU16,
    delay: Mutex<Duration>,
    accepted: Mutex<Vec<Bytes>>,
    authorization: Mutex<Option<String>>,
    content_type: Mutex<Option<String>>,
    requests: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

pub struct MockCollector {
    addr: SocketAddr,
    state: Arc<CollectorState>,
}

#[allow(dead_code)]
impl MockCollector {
    pub async fn start() -> Self {
        let state = Arc::new(CollectorState::default());
        state.default_status.store(200, Ordering::SeqCst);

        let app = Router::new()
            .route("/v1/events", post(collect))
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { addr, state }
    }

    pub fn endpoint(&self) -> String {
        format!("http://{}/v1/events", self.addr)
    }

    /// Answer the next requests with these statuses, in order
    pub fn script(&self, statuses: &[u16]) {
        self.state.scripted.lock().extend(statuses.iter().copied());
    }

    pub fn set_default_status(&self, status: u16) {
        self.state.default_status.store(status, Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.state.delay.lock() = delay;
    }

    pub fn requests(&self) -> usize {
        self.state.requests.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.state.max_in_flight.load(Ordering::SeqCst)
    }

    /// Bodies answered with 2xx
    pub fn accepted(&self) -> Vec<Bytes> {
        self.state.accepted.lock().clone()
    }

    pub fn last_authorization(&self) -> Option<String> {
        self.state.authorization.lock().clone()
    }

    pub fn last_content_type(&self) -> Option<String> {
        self.state.content_type.lock().clone()
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

async fn collect(
    State(state): State<Arc<CollectorState>>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    state.requests.fetch_add(1, Ordering::SeqCst);
    let now = state.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
    state.max_in_flight.fetch_max(now, Ordering::SeqCst);
    let _guard = InFlight(&state.in_flight);

    let header_value = |name: header::HeaderName| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };
    *state.authorization.lock() = header_value(header::AUTHORIZATION);
    *state.content_type.lock() = header_value(header::CONTENT_TYPE);

    let delay = *state.delay.lock();
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }

    let status = state
        .scripted
        .lock()
        .pop_front()
        .unwrap_or_else(|| state.default_status.load(Ordering::SeqCst));
    if (200..300).contains(&status) {
        state.accepted.lock().push(body);
    }

    StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
}
