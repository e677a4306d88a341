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
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::server::registry::PresenceRegistry;

#[derive(Clone)]
pub struct HealthState {
	ready: Arc<AtomicBool>,
	registry: PresenceRegistry,
}

impl HealthState {
	pub fn new(registry: PresenceRegistry) -> Self {
		Self {
			ready: Arc::new(AtomicBool::new(false)),
			registry,
		}
	}

	pub fn mark_ready(&self) {
		self.ready.store(true, Ordering::Relaxed);
	}

	pub fn mark_not_ready(&self) {
		self.ready.store(false, Ordering::Relaxed);
	}

	pub fn is_ready(&self) -> bool {
		self.ready.load(Ordering::Relaxed)
	}
}

pub fn spawn_health_server(bind: SocketAddr, state: HealthState, cancel: CancellationToken) {
	tokio::spawn(async move {
		if let Err(err) = run_health_server(bind, state, cancel).await {
			warn!(error = %err, "health server stopped");
		}
	});
}

async fn run_health_server(bind: SocketAddr, state: HealthState, cancel: CancellationToken) -> anyhow::Result<()> {
	let listener = TcpListener::bind(bind).await?;
	loop {
		let (stream, _addr) = tokio::select! {
			_ = cancel.cancelled() => return Ok(()),
			accepted = listener.accept() => accepted?,
		};
		let io = TokioIo::new(stream);
		let state = state.clone();
		tokio::spawn(async move {
			let service = service_fn(move |req| handle_health(req, state.clone()));
			if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
				warn!(error = %err, "health connection error");
			}
		});
	}
}

fn respond(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
	let mut resp = Response::new(Full::new(body.into()));
	*resp.status_mut() = status;
	resp
}

async fn handle_health(req: Request<Incoming>, state: HealthState) -> Result<Response<Full<Bytes>>, hyper::Error> {
	Ok(route_health(req.method(), req.uri().path(), &state).await)
}

async fn route_health(method: &Method, path: &str, state: &HealthState) -> Response<Full<Bytes>> {
	if method != Method::GET {
		return respond(StatusCode::METHOD_NOT_ALLOWED, Bytes::new());
	}

	match path {
		"/healthz" => respond(StatusCode::OK, Bytes::from_static(b"ok")),
		"/readyz" => {
			if state.is_ready() {
				respond(StatusCode::OK, Bytes::from_static(b"ready"))
			} else {
				respond(StatusCode::SERVICE_UNAVAILABLE, Bytes::from_static(b"not-ready"))
			}
		}
		"/presencez" => {
			let body = serde_json::json!({ "present": state.registry.len().await }).to_string();
			respond(StatusCode::OK, body)
		}
		_ => respond(StatusCode::NOT_FOUND, Bytes::new()),
	}
}

#[cfg(test)]
mod tests {
	use std::time::Duration;

	use courier_domain::Identity;

	use super::*;
	use crate::server::connection::{ConnHandle, ConnId};

	async fn body_of(resp: Response<Full<Bytes>>) -> (StatusCode, String) {
		use http_body_util::BodyExt as _;
		let status = resp.status();
		let bytes = resp.into_body().collect().await.expect("body").to_bytes();
		(status, String::from_utf8_lossy(&bytes).into_owned())
	}

	#[tokio::test]
	async fn readiness_follows_state() {
		let state = HealthState::new(PresenceRegistry::new());
		let (status, _) = body_of(route_health(&Method::GET, "/readyz", &state).await).await;
		assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

		state.mark_ready();
		let (status, body) = body_of(route_health(&Method::GET, "/readyz", &state).await).await;
		assert_eq!((status, body.as_str()), (StatusCode::OK, "ready"));

		state.mark_not_ready();
		assert!(!state.is_ready());
	}

	#[tokio::test]
	async fn presence_reports_registry_size() {
		let registry = PresenceRegistry::new();
		let (_client, server) = tokio::io::duplex(64);
		registry
			.register(
				Identity::new("bob").expect("identity"),
				ConnHandle::new(ConnId(1), server, Duration::from_secs(1), 1024),
			)
			.await;

		let state = HealthState::new(registry);
		let (status, body) = body_of(route_health(&Method::GET, "/presencez", &state).await).await;
		assert_eq!(status, StatusCode::OK);
		assert_eq!(body, r#"{"present":1}"#);
	}

	#[tokio::test]
	async fn other_routes_and_methods() {
		let state = HealthState::new(PresenceRegistry::new());
		let (status, _) = body_of(route_health(&Method::POST, "/healthz", &state).await).await;
		assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
		let (status, _) = body_of(route_health(&Method::GET, "/nope", &state).await).await;
		assert_eq!(status, StatusCode::NOT_FOUND);
	}
}
