#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::header::{CONTENT_TYPE, HeaderValue};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::warn;

use crate::server::hub::Hub;
use crate::util::net::accept_retrying;

/// Readiness handle shared between bootstrap and the health listener.
///
/// The node is ready once bootstrap hands over the hub; `/readyz` then
/// reports live registry counts.
#[derive(Clone, Default)]
pub struct HealthState {
	hub: Arc<OnceLock<Hub>>,
}

impl HealthState {
	pub fn new() -> Self {
		Self::default()
	}

	/// Flip to ready. Later calls are ignored.
	pub fn mark_ready(&self, hub: Hub) {
		let _ = self.hub.set(hub);
	}

	pub fn is_ready(&self) -> bool {
		self.hub.get().is_some()
	}

	fn readiness(&self) -> (StatusCode, String) {
		let Some(hub) = self.hub.get() else {
			return (StatusCode::SERVICE_UNAVAILABLE, json!({ "status": "starting" }).to_string());
		};
		let body = json!({
			"status": "ready",
			"connections": hub.registry().connection_count(),
			"users": hub.registry().user_count(),
			"node": hub.cluster().map(|c| c.node_name()),
		});
		(StatusCode::OK, body.to_string())
	}
}

/// Bind `bind` and answer `/healthz` and `/readyz` in the background.
pub fn spawn_health_server(bind: SocketAddr, state: HealthState) {
	tokio::spawn(async move {
		match TcpListener::bind(bind).await {
			Ok(listener) => serve_health(listener, state).await,
			Err(e) => warn!(error = %e, %bind, "health listener bind failed"),
		}
	});
}

async fn serve_health(listener: TcpListener, state: HealthState) {
	let listener = &listener;
	loop {
		let (stream, _addr) = accept_retrying("health", move || listener.accept()).await;
		let state = state.clone();
		tokio::spawn(async move {
			let service = service_fn(move |req: Request<Incoming>| {
				let (status, body) = route(req.method(), req.uri().path(), &state);
				async move { Ok::<_, hyper::Error>(text_response(status, body)) }
			});
			if let Err(err) = http1::Builder::new().serve_connection(TokioIo::new(stream), service).await {
				warn!(error = %err, "health connection error");
			}
		});
	}
}

fn route(method: &Method, path: &str, state: &HealthState) -> (StatusCode, String) {
	if method != Method::GET {
		return (StatusCode::METHOD_NOT_ALLOWED, String::new());
	}
	match path {
		"/healthz" => (StatusCode::OK, "ok".to_string()),
		"/readyz" => state.readiness(),
		_ => (StatusCode::NOT_FOUND, String::new()),
	}
}

fn text_response(status: StatusCode, body: String) -> Response<Full<Bytes>> {
	let json = body.starts_with('{');
	let mut resp = Response::new(Full::new(Bytes::from(body)));
	*resp.status_mut() = status;
	if json {
		resp.headers_mut()
			.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
	}
	resp
}

#[cfg(test)]
mod tests {
	use serde_json::Value;

	use super::*;
	use crate::server::test_support::{handle, hub_with_store};

	#[test]
	fn liveness_and_unknown_paths() {
		let state = HealthState::new();
		assert_eq!(route(&Method::GET, "/healthz", &state).0, StatusCode::OK);
		assert_eq!(route(&Method::GET, "/metrics", &state).0, StatusCode::NOT_FOUND);
		assert_eq!(route(&Method::POST, "/healthz", &state).0, StatusCode::METHOD_NOT_ALLOWED);
	}

	#[tokio::test]
	async fn readiness_reports_registry_counts_once_ready() {
		let state = HealthState::new();
		let (status, body) = route(&Method::GET, "/readyz", &state);
		assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
		assert!(body.contains("starting"));

		let (hub, _store) = hub_with_store();
		let (phone, _rx1) = handle(1, "alice", "phone");
		let (laptop, _rx2) = handle(2, "alice", "laptop");
		hub.register(phone).await;
		hub.register(laptop).await;
		state.mark_ready(hub);
		assert!(state.is_ready());

		let (status, body) = route(&Method::GET, "/readyz", &state);
		assert_eq!(status, StatusCode::OK);
		let v: Value = serde_json::from_str(&body).unwrap();
		assert_eq!(v["status"], "ready");
		assert_eq!(v["connections"], 2);
		assert_eq!(v["users"], 1);
		assert!(v["node"].is_null());
	}
}
