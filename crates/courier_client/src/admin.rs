#![forbid(unsafe_code)]

use anyhow::Context as _;
use courier_domain::unix_secs_now;
use courier_protocol::{AdminResponse, DigestAlgorithm, PublishBody, sign_digest};
use courier_util::endpoint::Endpoint;
use tracing::debug;

/// Signs and sends publish requests to a node's admin endpoint.
#[derive(Debug, Clone)]
pub struct AdminClient {
	http: reqwest::Client,
	endpoint: Endpoint,
	secret: String,
	digest: DigestAlgorithm,
}

impl AdminClient {
	pub fn new(endpoint: &str, secret: &str) -> anyhow::Result<Self> {
		let endpoint = Endpoint::parse_http(endpoint).map_err(anyhow::Error::msg)?;
		Ok(Self {
			http: reqwest::Client::new(),
			endpoint,
			secret: secret.to_string(),
			digest: DigestAlgorithm::default(),
		})
	}

	pub fn with_digest(mut self, digest: DigestAlgorithm) -> Self {
		self.digest = digest;
		self
	}

	/// `url?sign=..&ts=..` for `body` signed at `ts`.
	pub fn signed_url(&self, body: &[u8], ts: &str) -> String {
		let sign = sign_digest(self.digest, &self.secret, body, ts);
		format!("{}?sign={sign}&ts={ts}", self.endpoint.url())
	}

	/// Publish `data` to `users` plus every user tagged with one of `tags`.
	pub async fn publish(&self, users: &[String], tags: &[String], data: &str) -> anyhow::Result<AdminResponse> {
		let body = PublishBody {
			message_id: String::new(),
			users: users.to_vec(),
			tags: tags.to_vec(),
			data: data.to_string(),
		};
		self.publish_raw(serde_json::to_vec(&body).context("encode publish body")?)
			.await
	}

	/// Send an already encoded body.
	pub async fn publish_raw(&self, body: Vec<u8>) -> anyhow::Result<AdminResponse> {
		let ts = unix_secs_now().to_string();
		let url = self.signed_url(&body, &ts);
		debug!(%url, bytes = body.len(), "admin publish");

		let resp = self
			.http
			.post(url)
			.body(body)
			.send()
			.await
			.context("send admin request")?
			.error_for_status()
			.context("admin endpoint status")?;
		resp.json::<AdminResponse>().await.context("decode admin response")
	}
}
