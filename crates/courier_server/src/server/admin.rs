#![forbid(unsafe_code)]

use std::sync::Arc;

use bytes::Bytes;
use courier_domain::MessageId;
use courier_protocol::{AdminResponse, PublishBody, status};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::{CONTENT_TYPE, HeaderValue};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode, Uri};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::server::auth::Authenticator;
use crate::server::fanout::PublishOrigin;
use crate::server::hub::Hub;
use crate::util::net::accept_retrying;

/// Serve signed admin publish requests for the life of the process.
pub async fn serve_admin(listener: TcpListener, hub: Hub, auth: Arc<Authenticator>) {
	let listener = &listener;
	loop {
		let (stream, _addr) = accept_retrying("admin", move || listener.accept()).await;
		let io = TokioIo::new(stream);
		let hub = hub.clone();
		let auth = Arc::clone(&auth);
		tokio::spawn(async move {
			let service = service_fn(move |req| handle_admin(req, hub.clone(), Arc::clone(&auth)));
			if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
				warn!(error = %err, "admin connection error");
			}
		});
	}
}

async fn handle_admin(
	req: Request<Incoming>,
	hub: Hub,
	auth: Arc<Authenticator>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
	if req.uri().path() != "/" {
		let mut resp = Response::new(Full::new(Bytes::new()));
		*resp.status_mut() = StatusCode::NOT_FOUND;
		return Ok(resp);
	}

	let uri = req.uri().clone();
	let body = match req.into_body().collect().await {
		Ok(collected) => collected.to_bytes(),
		Err(e) => {
			warn!(error = %e, "admin: read body failed");
			return Ok(json_response(AdminResponse::new(status::FAIL, "body")));
		}
	};

	Ok(json_response(ingest(&hub, &auth, &uri, &body).await))
}

/// Validate a signed publish request and hand it to the hub.
pub(crate) async fn ingest(hub: &Hub, auth: &Authenticator, uri: &Uri, body: &[u8]) -> AdminResponse {
	let Some(sign) = query_param(uri, "sign").filter(|s| !s.is_empty()) else {
		return AdminResponse::new(status::FAIL, "sign");
	};
	let Some(ts) = query_param(uri, "ts").filter(|s| !s.is_empty()) else {
		return AdminResponse::new(status::FAIL, "ts");
	};

	if !auth.verify_admin(body, ts, sign) {
		warn!("admin: signature rejected");
		return AdminResponse::new(status::AUTH, "sign");
	}

	let publish: PublishBody = match serde_json::from_slice(body) {
		Ok(p) => p,
		Err(e) => {
			warn!(error = %e, "admin: invalid body");
			return AdminResponse::new(status::FAIL, "data format");
		}
	};

	let msg = publish.into_outgoing(MessageId::generate());
	info!(message_id = %msg.id, users = msg.users.len(), tags = msg.tags.len(), "admin: publish");

	let report = hub.publish(msg, PublishOrigin::Local).await;
	AdminResponse::new(status::OK, report.message_id.into_string())
}

fn query_param<'a>(uri: &'a Uri, name: &str) -> Option<&'a str> {
	uri.query()?
		.split('&')
		.filter_map(|pair| pair.split_once('=').or(Some((pair, ""))))
		.find(|(k, _)| *k == name)
		.map(|(_, v)| v)
}

fn json_response(body: AdminResponse) -> Response<Full<Bytes>> {
	let payload = serde_json::to_vec(&body).unwrap_or_default();
	let mut resp = Response::new(Full::new(Bytes::from(payload)));
	resp.headers_mut()
		.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
	resp
}
