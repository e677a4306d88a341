#![forbid(unsafe_code)]

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use courier_protocol::{FramingError, encode_frame};
use serde::Serialize;
use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

/// Process-unique id of an accepted connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(pub u64);

impl fmt::Display for ConnId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "conn-{}", self.0)
	}
}

#[derive(Debug, Error)]
pub enum SendError {
	#[error("encode frame: {0}")]
	Encode(#[from] FramingError),

	#[error("write failed: {0}")]
	Io(#[from] std::io::Error),

	#[error("write timed out after {0:?}")]
	Timeout(Duration),

	#[error("connection already failed a write")]
	Closed,
}

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Write half of a client connection.
///
/// Cloned into the presence registry so the router and poller can write on the
/// owning session's behalf. Writers serialize on the inner mutex, so frames never
/// interleave. After a failed or timed-out write the stream may hold a partial
/// frame; the handle is poisoned and every later send fails with `Closed`.
#[derive(Clone)]
pub struct ConnHandle {
	id: ConnId,
	writer: Arc<Mutex<BoxedWriter>>,
	poisoned: Arc<AtomicBool>,
	write_timeout: Duration,
	max_frame_bytes: usize,
}

impl fmt::Debug for ConnHandle {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("ConnHandle")
			.field("id", &self.id)
			.field("poisoned", &self.is_poisoned())
			.finish_non_exhaustive()
	}
}

impl ConnHandle {
	pub fn new<W>(id: ConnId, writer: W, write_timeout: Duration, max_frame_bytes: usize) -> Self
	where
		W: AsyncWrite + Send + Unpin + 'static,
	{
		Self {
			id,
			writer: Arc::new(Mutex::new(Box::new(writer))),
			poisoned: Arc::new(AtomicBool::new(false)),
			write_timeout,
			max_frame_bytes,
		}
	}

	pub fn id(&self) -> ConnId {
		self.id
	}

	pub fn is_poisoned(&self) -> bool {
		self.poisoned.load(Ordering::Acquire)
	}

	/// Encode `msg` as one frame and write it, bounded by the write timeout.
	///
	/// Encoding errors leave the connection usable; I/O errors and timeouts poison it.
	pub async fn send<T: Serialize>(&self, msg: &T) -> Result<(), SendError> {
		if self.is_poisoned() {
			return Err(SendError::Closed);
		}

		let frame = encode_frame(msg, self.max_frame_bytes)?;

		let write = async {
			let mut w = self.writer.lock().await;
			w.write_all(&frame).await?;
			w.flush().await
		};

		let res = match tokio::time::timeout(self.write_timeout, write).await {
			Ok(Ok(())) => Ok(()),
			Ok(Err(e)) => Err(SendError::Io(e)),
			Err(_) => Err(SendError::Timeout(self.write_timeout)),
		};

		match res {
			Ok(()) => {
				metrics::counter!("courier_relay_frames_out_total").increment(1);
				metrics::counter!("courier_relay_bytes_out_total").increment(frame.len() as u64);
				Ok(())
			}
			Err(e) => {
				self.poisoned.store(true, Ordering::Release);
				Err(e)
			}
		}
	}

	/// Best-effort close of the write half.
	pub async fn shutdown(&self) {
		self.poisoned.store(true, Ordering::Release);
		let shutdown = async {
			let mut w = self.writer.lock().await;
			w.shutdown().await
		};
		let _ = tokio::time::timeout(self.write_timeout, shutdown).await;
	}
}

#[cfg(test)]
mod tests {
	use bytes::BytesMut;
	use courier_protocol::{DEFAULT_MAX_FRAME_SIZE, Reply, ServerFrame, try_decode_frame_from_buffer};
	use tokio::io::AsyncReadExt;

	use super::*;

	#[tokio::test]
	async fn send_writes_one_frame() {
		let (client, server) = tokio::io::duplex(1024);
		let handle = ConnHandle::new(ConnId(1), server, Duration::from_secs(1), DEFAULT_MAX_FRAME_SIZE);

		handle.send(&Reply::ok("delivered")).await.expect("send");

		let mut client = client;
		let mut buf = BytesMut::new();
		let frame = loop {
			client.read_buf(&mut buf).await.expect("read");
			if let Some(f) = try_decode_frame_from_buffer::<ServerFrame>(&mut buf, DEFAULT_MAX_FRAME_SIZE).expect("decode") {
				break f;
			}
		};
		assert_eq!(frame, ServerFrame::Reply(Reply::ok("delivered")));
	}

	#[tokio::test]
	async fn write_to_dropped_peer_poisons_handle() {
		let (client, server) = tokio::io::duplex(64);
		drop(client);
		let handle = ConnHandle::new(ConnId(2), server, Duration::from_secs(1), DEFAULT_MAX_FRAME_SIZE);

		assert!(matches!(handle.send(&Reply::ok("x")).await, Err(SendError::Io(_))));
		assert!(handle.is_poisoned());
		assert!(matches!(handle.send(&Reply::ok("x")).await, Err(SendError::Closed)));
	}

	#[tokio::test]
	async fn stalled_peer_times_out() {
		// Nobody reads the client side, so a frame larger than the pipe blocks.
		let (_client, server) = tokio::io::duplex(8);
		let handle = ConnHandle::new(ConnId(3), server, Duration::from_millis(50), DEFAULT_MAX_FRAME_SIZE);

		let err = handle.send(&Reply::ok("this frame does not fit")).await.unwrap_err();
		assert!(matches!(err, SendError::Timeout(_)));
	}

	#[tokio::test]
	async fn oversized_frame_does_not_poison() {
		let (_client, server) = tokio::io::duplex(1024);
		let handle = ConnHandle::new(ConnId(4), server, Duration::from_secs(1), 8);

		assert!(matches!(
			handle.send(&Reply::ok("far too long for eight bytes")).await,
			Err(SendError::Encode(_))
		));
		assert!(!handle.is_poisoned());
	}
}
