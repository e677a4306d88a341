#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::Duration;

use bytes::BytesMut;
use courier_protocol::framing::{DEFAULT_MAX_FRAME_SIZE, FramingError, encode_frame, try_decode_frame_from_buffer};
use courier_protocol::{Delivery, Reply, ServerFrame, WireEnvelope, msg_type};
use courier_util::endpoint::TcpEndpoint;
use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tracing::{debug, info};

/// Default relay endpoint for local development.
pub const DEFAULT_SERVER_ENDPOINT: &str = "tcp://127.0.0.1:8081";

/// Client connection settings.
#[derive(Debug, Clone)]
pub struct ClientConfig {
	/// Remote relay host (DNS name or IP literal).
	pub server_host: String,

	/// Remote relay TCP port.
	pub server_port: u16,

	/// Resolved address override; skips DNS when set.
	pub server_addr: Option<SocketAddr>,

	/// Maximum inbound/outbound frame size.
	pub max_frame_bytes: usize,

	pub connect_timeout: Duration,
}

impl ClientConfig {
	/// Create a config from `tcp://host:port`.
	pub fn from_tcp_endpoint(endpoint: &str) -> Result<Self, ClientCoreError> {
		let e = TcpEndpoint::parse(endpoint).map_err(|e| ClientCoreError::Connect(e.to_string()))?;
		Ok(Self {
			server_addr: e.to_socket_addr_if_ip_literal().ok(),
			server_host: e.host,
			server_port: e.port,
			..Self::default()
		})
	}

	pub fn from_addr(addr: SocketAddr) -> Self {
		Self {
			server_host: addr.ip().to_string(),
			server_port: addr.port(),
			server_addr: Some(addr),
			..Self::default()
		}
	}
}

impl Default for ClientConfig {
	fn default() -> Self {
		Self {
			server_host: "127.0.0.1".to_string(),
			server_port: 8081,
			server_addr: None,
			max_frame_bytes: DEFAULT_MAX_FRAME_SIZE,
			connect_timeout: Duration::from_secs(10),
		}
	}
}

/// Errors for client core operations.
#[derive(Debug, thiserror::Error)]
pub enum ClientCoreError {
	/// Connection establishment failed.
	#[error("failed to connect: {0}")]
	Connect(String),

	/// Protocol framing error.
	#[error(transparent)]
	Framing(#[from] FramingError),

	/// IO error.
	#[error("io error: {0}")]
	Io(#[from] std::io::Error),

	/// The relay closed the connection.
	#[error("connection closed by relay")]
	Closed,
}

/// One TCP connection to a relay.
///
/// Replies and deliveries share the stream, so whichever one is not being waited
/// for is buffered and handed out by the matching `next_*` call.
pub struct RelayClient {
	reader: OwnedReadHalf,
	writer: OwnedWriteHalf,
	buf: BytesMut,
	max_frame_bytes: usize,
	replies: VecDeque<Reply>,
	deliveries: VecDeque<Delivery>,
}

impl RelayClient {
	pub async fn connect(cfg: ClientConfig) -> Result<Self, ClientCoreError> {
		let target = match cfg.server_addr {
			Some(addr) => addr.to_string(),
			None => format!("{}:{}", cfg.server_host, cfg.server_port),
		};

		let stream = tokio::time::timeout(cfg.connect_timeout, TcpStream::connect(&target))
			.await
			.map_err(|_| ClientCoreError::Connect(format!("connect timeout after {:?} ({target})", cfg.connect_timeout)))?
			.map_err(|e| ClientCoreError::Connect(format!("{target}: {e}")))?;
		stream.set_nodelay(true)?;
		info!(remote = %target, "connected");

		let (reader, writer) = stream.into_split();
		Ok(Self {
			reader,
			writer,
			buf: BytesMut::with_capacity(8 * 1024),
			max_frame_bytes: cfg.max_frame_bytes,
			replies: VecDeque::new(),
			deliveries: VecDeque::new(),
		})
	}

	pub async fn connect_addr(addr: SocketAddr) -> Result<Self, ClientCoreError> {
		Self::connect(ClientConfig::from_addr(addr)).await
	}

	/// Announce presence and wait for the relay's reply.
	pub async fn announce(&mut self, credential: &str) -> Result<Reply, ClientCoreError> {
		self.send(&WireEnvelope {
			msg_type: msg_type::PRESENCE,
			from: credential.to_string(),
			to: None,
			content: None,
		})
		.await?;
		self.next_reply().await
	}

	/// Send a chat message and wait for the relay's reply.
	pub async fn send_chat(&mut self, credential: &str, to: &str, content: &str) -> Result<Reply, ClientCoreError> {
		self.send(&WireEnvelope {
			msg_type: msg_type::CHAT,
			from: credential.to_string(),
			to: Some(to.to_string()),
			content: Some(content.to_string()),
		})
		.await?;
		self.next_reply().await
	}

	/// Write one envelope without waiting for a reply.
	pub async fn send(&mut self, env: &WireEnvelope) -> Result<(), ClientCoreError> {
		let frame = encode_frame(env, self.max_frame_bytes)?;
		self.send_raw(&frame).await
	}

	/// Write raw bytes to the stream.
	pub async fn send_raw(&mut self, bytes: &[u8]) -> Result<(), ClientCoreError> {
		self.writer.write_all(bytes).await?;
		self.writer.flush().await?;
		Ok(())
	}

	pub async fn next_reply(&mut self) -> Result<Reply, ClientCoreError> {
		loop {
			if let Some(reply) = self.replies.pop_front() {
				return Ok(reply);
			}
			self.read_one().await?;
		}
	}

	pub async fn next_delivery(&mut self) -> Result<Delivery, ClientCoreError> {
		loop {
			if let Some(delivery) = self.deliveries.pop_front() {
				return Ok(delivery);
			}
			self.read_one().await?;
		}
	}

	/// Next frame in arrival order, buffered ones first (replies before deliveries).
	pub async fn next_frame(&mut self) -> Result<ServerFrame, ClientCoreError> {
		if let Some(reply) = self.replies.pop_front() {
			return Ok(ServerFrame::Reply(reply));
		}
		if let Some(delivery) = self.deliveries.pop_front() {
			return Ok(ServerFrame::Delivery(delivery));
		}
		self.read_one().await?;
		self.next_buffered().ok_or(ClientCoreError::Closed)
	}

	fn next_buffered(&mut self) -> Option<ServerFrame> {
		if let Some(reply) = self.replies.pop_front() {
			return Some(ServerFrame::Reply(reply));
		}
		self.deliveries.pop_front().map(ServerFrame::Delivery)
	}

	/// Half-close the write side; the relay ends the session once it has replied.
	pub async fn close(&mut self) -> Result<(), ClientCoreError> {
		self.writer.shutdown().await?;
		Ok(())
	}

	async fn read_one(&mut self) -> Result<(), ClientCoreError> {
		loop {
			match try_decode_frame_from_buffer::<ServerFrame>(&mut self.buf, self.max_frame_bytes)? {
				Some(ServerFrame::Reply(reply)) => {
					debug!(code = reply.result_code.as_u16(), "reply received");
					self.replies.push_back(reply);
					return Ok(());
				}
				Some(ServerFrame::Delivery(delivery)) => {
					debug!(from = %delivery.from, "delivery received");
					self.deliveries.push_back(delivery);
					return Ok(());
				}
				None => {}
			}

			let n = self.reader.read_buf(&mut self.buf).await?;
			if n == 0 {
				return Err(ClientCoreError::Closed);
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn default_config_is_sane() {
		let cfg = ClientConfig::default();
		assert_eq!(cfg.server_port, 8081);
		assert!(cfg.max_frame_bytes > 0);
	}

	#[test]
	fn endpoint_with_ip_literal_skips_dns() {
		let cfg = ClientConfig::from_tcp_endpoint("tcp://127.0.0.1:9000").expect("endpoint");
		assert_eq!(cfg.server_addr, Some("127.0.0.1:9000".parse().expect("addr")));

		let cfg = ClientConfig::from_tcp_endpoint("tcp://relay.example.com:9000").expect("endpoint");
		assert_eq!(cfg.server_addr, None);
		assert_eq!(cfg.server_host, "relay.example.com");

		assert!(ClientConfig::from_tcp_endpoint("quic://127.0.0.1:9000").is_err());
	}

	#[tokio::test]
	async fn buffers_frames_by_kind() {
		let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
		let addr = listener.local_addr().expect("addr");

		let server = tokio::spawn(async move {
			let (mut sock, _) = listener.accept().await.expect("accept");
			let delivery = Delivery {
				from: courier_domain::Identity::new("alice").expect("identity"),
				content: "hi".into(),
			};
			let mut out = encode_frame(&delivery, DEFAULT_MAX_FRAME_SIZE).expect("encode");
			out.extend(encode_frame(&Reply::ok("online"), DEFAULT_MAX_FRAME_SIZE).expect("encode"));
			sock.write_all(&out).await.expect("write");
		});

		let mut client = RelayClient::connect_addr(addr).await.expect("connect");
		let reply = client.next_reply().await.expect("reply");
		assert_eq!(reply.content, "online");
		let delivery = client.next_delivery().await.expect("delivery");
		assert_eq!(delivery.from.as_str(), "alice");
		assert!(matches!(client.next_frame().await, Err(ClientCoreError::Closed)));

		server.await.expect("server");
	}
}
