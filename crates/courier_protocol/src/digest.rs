#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;

use hmac::{Hmac, Mac};
use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

/// Keyed digest used for login tokens and admin signatures. Output is always
/// lowercase hex.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DigestAlgorithm {
	/// `md5(secret || parts...)`; interoperable with existing clients.
	#[default]
	Md5,
	/// `HMAC-SHA256(secret, parts...)`.
	HmacSha256,
}

impl DigestAlgorithm {
	pub const fn as_str(self) -> &'static str {
		match self {
			DigestAlgorithm::Md5 => "md5",
			DigestAlgorithm::HmacSha256 => "hmac-sha256",
		}
	}
}

impl fmt::Display for DigestAlgorithm {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for DigestAlgorithm {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.trim().to_ascii_lowercase().as_str() {
			"md5" => Ok(DigestAlgorithm::Md5),
			"hmac-sha256" | "hmac_sha256" | "sha256" => Ok(DigestAlgorithm::HmacSha256),
			other => Err(format!("unknown digest algorithm: {other}")),
		}
	}
}

fn keyed_digest(alg: DigestAlgorithm, secret: &str, parts: &[&[u8]]) -> String {
	match alg {
		DigestAlgorithm::Md5 => {
			let mut h = Md5::new();
			h.update(secret.as_bytes());
			for p in parts {
				h.update(p);
			}
			format!("{:x}", h.finalize())
		}
		DigestAlgorithm::HmacSha256 => {
			// HMAC accepts keys of any length.
			let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(secret.as_bytes()) else {
				return String::new();
			};
			for p in parts {
				mac.update(p);
			}
			format!("{:x}", mac.finalize().into_bytes())
		}
	}
}

/// Login token over `(user, client_id, timestamp)`.
pub fn token_digest(alg: DigestAlgorithm, secret: &str, user: &str, client_id: &str, ts: i64) -> String {
	let ts = ts.to_string();
	keyed_digest(alg, secret, &[user.as_bytes(), client_id.as_bytes(), ts.as_bytes()])
}

/// Admin request signature over `(raw body, ts)`.
pub fn sign_digest(alg: DigestAlgorithm, secret: &str, body: &[u8], ts: &str) -> String {
	keyed_digest(alg, secret, &[body, ts.as_bytes()])
}

pub fn verify_token(alg: DigestAlgorithm, secret: &str, user: &str, client_id: &str, ts: i64, provided: &str) -> bool {
	let expected = token_digest(alg, secret, user, client_id, ts);
	constant_time_eq(expected.as_bytes(), provided.trim().to_ascii_lowercase().as_bytes())
}

pub fn verify_sign(alg: DigestAlgorithm, secret: &str, body: &[u8], ts: &str, provided: &str) -> bool {
	let expected = sign_digest(alg, secret, body, ts);
	constant_time_eq(expected.as_bytes(), provided.trim().to_ascii_lowercase().as_bytes())
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
	if a.is_empty() || a.len() != b.len() {
		return false;
	}

	let mut diff = 0u8;
	for (x, y) in a.iter().zip(b.iter()) {
		diff |= x ^ y;
	}

	diff == 0
}
