#![forbid(unsafe_code)]

pub mod endpoint {
	use std::net::SocketAddr;

	use thiserror::Error;

	pub const SCHEME: &str = "tcp://";

	#[derive(Debug, Error, Clone, PartialEq, Eq)]
	pub enum EndpointError {
		#[error("endpoint must be non-empty (expected tcp://host:port)")]
		Empty,

		#[error("invalid endpoint (expected tcp://host:port): {0}")]
		MissingScheme(String),

		#[error("invalid endpoint (expected tcp://host:port without path/query/fragment): {0}")]
		TrailingParts(String),

		#[error("invalid endpoint (missing :port, expected tcp://host:port): {0}")]
		MissingPort(String),

		#[error("invalid endpoint host: {0}")]
		InvalidHost(String),

		#[error("invalid endpoint host (IPv6 must be bracketed like tcp://[::1]:8081): {0}")]
		UnbracketedIpv6(String),

		#[error("invalid endpoint port: {0}")]
		InvalidPort(String),

		#[error("host must be an IP literal to bind (DNS names not supported here): {0}")]
		NotIpLiteral(String),
	}

	/// Parsed `tcp://host:port` endpoint.
	#[derive(Debug, Clone, PartialEq, Eq, Hash)]
	pub struct TcpEndpoint {
		pub host: String,
		pub port: u16,
	}

	impl TcpEndpoint {
		/// Returns `host:port` (IPv6 stays bracketed), suitable for `TcpStream::connect`.
		pub fn hostport(&self) -> String {
			format!("{}:{}", self.host, self.port)
		}

		/// Convert to `SocketAddr` only if the host is an IP literal.
		pub fn to_socket_addr_if_ip_literal(&self) -> Result<SocketAddr, EndpointError> {
			self.hostport()
				.parse()
				.map_err(|_| EndpointError::NotIpLiteral(self.host.clone()))
		}

		/// Parse a connectable endpoint; port 0 is rejected.
		pub fn parse(s: &str) -> Result<Self, EndpointError> {
			let e = Self::parse_inner(s)?;
			if e.port == 0 {
				return Err(EndpointError::InvalidPort(s.trim().to_string()));
			}
			Ok(e)
		}

		/// Parse a listen endpoint; port 0 asks the OS for an ephemeral port.
		pub fn parse_bind(s: &str) -> Result<Self, EndpointError> {
			Self::parse_inner(s)
		}

		fn parse_inner(s: &str) -> Result<Self, EndpointError> {
			let s = s.trim();
			if s.is_empty() {
				return Err(EndpointError::Empty);
			}

			let rest = s
				.strip_prefix(SCHEME)
				.ok_or_else(|| EndpointError::MissingScheme(s.to_string()))?;

			if rest.contains(['/', '?', '#']) {
				return Err(EndpointError::TrailingParts(s.to_string()));
			}

			let (host, port_str) = rest
				.rsplit_once(':')
				.ok_or_else(|| EndpointError::MissingPort(s.to_string()))?;

			let host = host.trim();
			if host.is_empty() || host == "[]" {
				return Err(EndpointError::InvalidHost(s.to_string()));
			}
			if host.contains(':') && !(host.starts_with('[') && host.ends_with(']')) {
				return Err(EndpointError::UnbracketedIpv6(s.to_string()));
			}

			let port: u16 = port_str
				.trim()
				.parse()
				.map_err(|_| EndpointError::InvalidPort(s.to_string()))?;

			Ok(Self {
				host: host.to_string(),
				port,
			})
		}
	}

	impl std::fmt::Display for TcpEndpoint {
		fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
			write!(f, "{SCHEME}{}", self.hostport())
		}
	}

	impl std::str::FromStr for TcpEndpoint {
		type Err = EndpointError;

		fn from_str(s: &str) -> Result<Self, Self::Err> {
			Self::parse(s)
		}
	}

}
