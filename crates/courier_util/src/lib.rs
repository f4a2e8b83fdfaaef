#![forbid(unsafe_code)]

pub mod endpoint {
	use std::net::SocketAddr;

	/// URL scheme accepted for node endpoints.
	#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
	pub enum Scheme {
		Ws,
		Wss,
		Http,
		Https,
	}

	impl Scheme {
		pub const fn as_str(self) -> &'static str {
			match self {
				Scheme::Ws => "ws",
				Scheme::Wss => "wss",
				Scheme::Http => "http",
				Scheme::Https => "https",
			}
		}

		fn strip(s: &str) -> Option<(Self, &str)> {
			// Longest prefixes first.
			for scheme in [Scheme::Wss, Scheme::Ws, Scheme::Https, Scheme::Http] {
				if let Some(rest) = s.strip_prefix(scheme.as_str()).and_then(|r| r.strip_prefix("://")) {
					return Some((scheme, rest));
				}
			}
			None
		}
	}

	/// Parsed `scheme://host:port` endpoint (no path, query or fragment).
	#[derive(Debug, Clone, PartialEq, Eq, Hash)]
	pub struct Endpoint {
		pub scheme: Scheme,
		pub host: String,
		pub port: u16,
	}

	impl Endpoint {
		/// Returns `host:port` (host preserved, IPv6 stays bracketed).
		pub fn hostport(&self) -> String {
			format!("{}:{}", self.host, self.port)
		}

		/// Full URL with a trailing `/`, suitable for WebSocket and HTTP clients.
		pub fn url(&self) -> String {
			format!("{}://{}/", self.scheme.as_str(), self.hostport())
		}

		/// Convert to `SocketAddr` only if the host is an IP literal.
		pub fn to_socket_addr_if_ip_literal(&self) -> Result<SocketAddr, String> {
			self.hostport()
				.parse()
				.map_err(|_| format!("host must be an IP literal (DNS names not supported here): {}", self.host))
		}

		/// Parse `ws://`, `wss://`, `http://` or `https://` followed by `host:port`.
		/// A single trailing `/` is tolerated.
		pub fn parse(s: &str) -> Result<Self, String> {
			let s = s.trim();
			if s.is_empty() {
				return Err("endpoint must be non-empty (expected ws://host:port)".to_string());
			}

			let (scheme, rest) =
				Scheme::strip(s).ok_or_else(|| format!("invalid endpoint (expected ws:// or http:// scheme): {s}"))?;
			let rest = rest.strip_suffix('/').unwrap_or(rest);

			if rest.contains('/') || rest.contains('?') || rest.contains('#') {
				return Err(format!("invalid endpoint (expected host:port without path/query/fragment): {s}"));
			}

			let (host, port_str) = rest
				.rsplit_once(':')
				.ok_or_else(|| format!("invalid endpoint (missing :port): {s}"))?;

			let host = host.trim();
			if host.is_empty() {
				return Err(format!("invalid endpoint host: {s}"));
			}

			if host.contains(':') && !(host.starts_with('[') && host.ends_with(']')) {
				return Err(format!("invalid endpoint host (IPv6 must be bracketed like ws://[::1]:8080): {s}"));
			}

			let port: u16 = port_str
				.trim()
				.parse()
				.map_err(|_| format!("invalid endpoint port (expected 1..=65535): {s}"))?;

			if port == 0 {
				return Err(format!("invalid endpoint port (expected 1..=65535): {s}"));
			}

			Ok(Self {
				scheme,
				host: host.to_string(),
				port,
			})
		}

		/// Parse and require one of the WebSocket schemes.
		pub fn parse_ws(s: &str) -> Result<Self, String> {
			let e = Self::parse(s)?;
			match e.scheme {
				Scheme::Ws | Scheme::Wss => Ok(e),
				_ => Err(format!("expected ws://host:port or wss://host:port: {s}")),
			}
		}

		/// Parse and require one of the HTTP schemes.
		pub fn parse_http(s: &str) -> Result<Self, String> {
			let e = Self::parse(s)?;
			match e.scheme {
				Scheme::Http | Scheme::Https => Ok(e),
				_ => Err(format!("expected http://host:port or https://host:port: {s}")),
			}
		}
	}

	/// Validate a bind address of the form `host:port` where host is an IP literal.
	pub fn validate_bind_addr(s: &str) -> Result<SocketAddr, String> {
		let s = s.trim();
		let addr: SocketAddr = s
			.parse()
			.map_err(|_| format!("invalid bind address (expected ip:port): {s}"))?;
		Ok(addr)
	}

}
