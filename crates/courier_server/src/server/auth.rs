#![forbid(unsafe_code)]

use anyhow::anyhow;
use courier_domain::unix_secs_now;
use courier_protocol::{LoginFrame, sign_digest, token_digest, verify_sign, verify_token};

use crate::config::AuthSettings;

/// Verifies client login tokens and admin request signatures.
#[derive(Debug, Clone)]
pub struct Authenticator {
	cfg: AuthSettings,
}

impl Authenticator {
	pub fn new(cfg: AuthSettings) -> Self {
		Self { cfg }
	}

	/// Check a login frame's token and, when configured, its timestamp age.
	pub fn verify_login(&self, login: &LoginFrame) -> anyhow::Result<()> {
		if self.cfg.secret.is_empty() {
			return Err(anyhow!("no client secret configured"));
		}

		if !verify_token(
			self.cfg.digest,
			self.cfg.secret.expose(),
			&login.user,
			&login.client_id,
			login.timestamp,
			&login.token,
		) {
			return Err(anyhow!("invalid token"));
		}

		if let Some(max_age) = self.cfg.token_max_age {
			let skew = unix_secs_now().abs_diff(login.timestamp);
			if skew > max_age.as_secs() {
				return Err(anyhow!("token timestamp outside the accepted window"));
			}
		}

		Ok(())
	}

	/// Check an admin request signature over `(body, ts)`.
	pub fn verify_admin(&self, body: &[u8], ts: &str, sign: &str) -> bool {
		!self.cfg.admin_secret.is_empty()
			&& verify_sign(self.cfg.digest, self.cfg.admin_secret.expose(), body, ts, sign)
	}

	/// Token a client would present for `(user, client_id, ts)`.
	pub fn login_token(&self, user: &str, client_id: &str, ts: i64) -> String {
		token_digest(self.cfg.digest, self.cfg.secret.expose(), user, client_id, ts)
	}

	/// Signature an admin caller would attach for `(body, ts)`.
	pub fn admin_sign(&self, body: &[u8], ts: &str) -> String {
		sign_digest(self.cfg.digest, self.cfg.admin_secret.expose(), body, ts)
	}
}
