#![forbid(unsafe_code)]

use std::net::SocketAddr;

/// Parsed `ws://host:port` endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WsEndpoint {
	pub host: String,
	pub port: u16,
}

impl WsEndpoint {
	/// Returns `host:port` (host preserved, IPv6 stays bracketed).
	pub fn hostport(&self) -> String {
		format!("{}:{}", self.host, self.port)
	}

	/// Convert to `SocketAddr` only if the host is an IP literal.
	pub fn to_socket_addr_if_ip_literal(&self) -> Result<SocketAddr, String> {
		self.hostport()
			.parse()
			.map_err(|_| format!("host must be an IP literal (DNS names not supported here): {}", self.host))
	}

	/// Parse a bind endpoint string in the form `ws://host:port`.
	pub fn parse(s: &str) -> Result<Self, String> {
		let s = s.trim();
		if s.is_empty() {
			return Err("endpoint must be non-empty (expected ws://host:port)".to_string());
		}

		let rest = s
			.strip_prefix("ws://")
			.ok_or_else(|| format!("invalid endpoint (expected ws://host:port): {s}"))?;

		if rest.contains('/') || rest.contains('?') || rest.contains('#') {
			return Err(format!(
				"invalid endpoint (expected ws://host:port without path/query/fragment): {s}"
			));
		}

		let (host, port_str) = rest
			.rsplit_once(':')
			.ok_or_else(|| format!("invalid endpoint (missing :port, expected ws://host:port): {s}"))?;

		let host = host.trim();
		if host.is_empty() {
			return Err(format!("invalid endpoint host (expected ws://host:port): {s}"));
		}

		if host.contains(':') && !(host.starts_with('[') && host.ends_with(']')) {
			return Err(format!(
				"invalid endpoint host (IPv6 must be bracketed like ws://[::1]:7070): {s}"
			));
		}

		let port = port_str
			.trim()
			.parse::<u16>()
			.map_err(|_| format!("invalid endpoint port (expected ws://host:port): {s}"))?;

		Ok(Self {
			host: host.to_string(),
			port,
		})
	}
}
