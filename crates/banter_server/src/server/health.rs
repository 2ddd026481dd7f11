#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tracing::warn;

use crate::server::registry::RoomRegistry;

/// Readiness flag plus a live view of the fan-out core, served over
/// plain HTTP for probes and operators.
#[derive(Clone)]
pub struct HealthState {
	ready: Arc<AtomicBool>,
	registry: Arc<RoomRegistry>,
}

impl HealthState {
	pub fn new(registry: Arc<RoomRegistry>) -> Self {
		Self {
			ready: Arc::new(AtomicBool::new(false)),
			registry,
		}
	}

	/// Flip once the hub and listener are up.
	pub fn mark_ready(&self) {
		self.ready.store(true, Ordering::Relaxed);
	}

	pub fn is_ready(&self) -> bool {
		self.ready.load(Ordering::Relaxed)
	}

	fn status_body(&self) -> String {
		serde_json::json!({
			"ready": self.is_ready(),
			"rooms": self.registry.room_count(),
			"clients": self.registry.connected_clients(),
		})
		.to_string()
	}
}

pub fn spawn_health_server(bind: SocketAddr, state: HealthState) {
	tokio::spawn(async move {
		if let Err(err) = serve_health(bind, state).await {
			warn!(error = %err, "health server stopped");
		}
	});
}

async fn serve_health(bind: SocketAddr, state: HealthState) -> anyhow::Result<()> {
	let listener = TcpListener::bind(bind).await?;
	loop {
		let (stream, _addr) = listener.accept().await?;
		let state = state.clone();
		tokio::spawn(async move {
			let service = service_fn(move |req| route(req, state.clone()));
			if let Err(err) = http1::Builder::new().serve_connection(TokioIo::new(stream), service).await {
				warn!(error = %err, "health connection error");
			}
		});
	}
}

async fn route(req: Request<Incoming>, state: HealthState) -> Result<Response<Full<Bytes>>, hyper::Error> {
	let (status, body) = if req.method() != Method::GET {
		(StatusCode::METHOD_NOT_ALLOWED, Bytes::new())
	} else {
		match req.uri().path() {
			"/healthz" => (StatusCode::OK, Bytes::from_static(b"ok")),
			"/readyz" if state.is_ready() => (StatusCode::OK, Bytes::from_static(b"ready")),
			"/readyz" => (StatusCode::SERVICE_UNAVAILABLE, Bytes::from_static(b"not-ready")),
			"/statusz" => (StatusCode::OK, Bytes::from(state.status_body())),
			_ => (StatusCode::NOT_FOUND, Bytes::new()),
		}
	};

	let mut resp = Response::new(Full::new(body));
	*resp.status_mut() = status;
	Ok(resp)
}
