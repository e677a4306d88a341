#![forbid(unsafe_code)]

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, anyhow};
use bytes::BytesMut;
use courier_domain::Identity;
use courier_protocol::{Envelope, Reply, WireEnvelope, try_decode_frame_from_buffer};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::server::auth::Authenticator;
use crate::server::connection::{ConnHandle, ConnId};
use crate::server::router::{DeliveryOutcome, Router};

/// Per-connection server settings.
#[derive(Debug, Clone)]
pub struct SessionSettings {
	pub max_frame_bytes: usize,
	pub write_timeout: Duration,
	pub handoff_capacity: usize,
	pub command_rate_limit_per_conn_burst: u32,
	pub command_rate_limit_per_conn_per_minute: u32,
}

impl Default for SessionSettings {
	fn default() -> Self {
		Self {
			max_frame_bytes: courier_protocol::DEFAULT_MAX_FRAME_SIZE,
			write_timeout: Duration::from_secs(5),
			handoff_capacity: 64,
			command_rate_limit_per_conn_burst: 0,
			command_rate_limit_per_conn_per_minute: 0,
		}
	}
}

/// Everything a session needs, shared by all sessions.
#[derive(Clone)]
pub struct RelayContext {
	pub router: Arc<Router>,
	pub auth: Arc<dyn Authenticator>,
	pub settings: SessionSettings,
}

#[derive(Debug, Clone)]
struct TokenBucket {
	capacity: f64,
	tokens: f64,
	refill_per_sec: f64,
	last: Instant,
}

impl TokenBucket {
	fn new(capacity: u32, refill_per_minute: u32) -> Option<Self> {
		if capacity == 0 || refill_per_minute == 0 {
			return None;
		}
		Some(Self {
			capacity: capacity as f64,
			tokens: capacity as f64,
			refill_per_sec: refill_per_minute as f64 / 60.0,
			last: Instant::now(),
		})
	}

	fn allow(&mut self) -> bool {
		let now = Instant::now();
		let elapsed = now.duration_since(self.last).as_secs_f64();
		if elapsed > 0.0 {
			self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
			self.last = now;
		}
		if self.tokens >= 1.0 {
			self.tokens -= 1.0;
			true
		} else {
			false
		}
	}
}

/// Run one client connection to completion.
///
/// A reader task decodes frames and hands envelopes to a dispatcher task over a
/// bounded channel; both observe one cancellation token. When both have finished,
/// every identity this session registered is removed from the registry (only where
/// it still points at this connection) and the write half is closed.
pub async fn run_session<R, W>(conn_id: ConnId, reader: R, writer: W, ctx: RelayContext, cancel: CancellationToken)
where
	R: AsyncRead + Send + Unpin + 'static,
	W: AsyncWrite + Send + Unpin + 'static,
{
	struct SessionGaugeGuard;
	impl Drop for SessionGaugeGuard {
		fn drop(&mut self) {
			metrics::gauge!("courier_relay_active_sessions").decrement(1.0);
		}
	}

	metrics::gauge!("courier_relay_active_sessions").increment(1.0);
	let _guard = SessionGaugeGuard;

	let settings = ctx.settings.clone();
	let conn = ConnHandle::new(conn_id, writer, settings.write_timeout, settings.max_frame_bytes);
	let (tx, rx) = mpsc::channel::<WireEnvelope>(settings.handoff_capacity.max(1));

	let reader_cancel = cancel.clone();
	let reader_task = tokio::spawn(async move {
		let res = read_loop(reader, tx, settings.max_frame_bytes, &reader_cancel).await;
		if let Err(e) = &res {
			debug!(%conn_id, error = %e, "session reader stopped");
		}
		res
	});

	let dispatcher = Dispatcher {
		conn_id,
		conn: conn.clone(),
		router: Arc::clone(&ctx.router),
		auth: Arc::clone(&ctx.auth),
		rate_limiter: TokenBucket::new(
			ctx.settings.command_rate_limit_per_conn_burst,
			ctx.settings.command_rate_limit_per_conn_per_minute,
		),
		registered: HashSet::new(),
	};
	let dispatch_task = tokio::spawn(dispatcher.run(rx, cancel.clone()));

	let (read_res, dispatch_res) = tokio::join!(reader_task, dispatch_task);
	cancel.cancel();

	match read_res {
		Ok(Ok(())) => {}
		Ok(Err(e)) => {
			metrics::counter!("courier_relay_transport_faults_total").increment(1);
			info!(%conn_id, error = %e, "session terminated by transport fault");
		}
		Err(e) => warn!(%conn_id, error = %e, "session reader task failed"),
	}

	let registry = ctx.router.registry();
	match dispatch_res {
		Ok(registered) => {
			for identity in registered {
				registry.unregister(&identity, conn_id).await;
			}
		}
		Err(e) => {
			warn!(%conn_id, error = %e, "session dispatcher task failed");
			for identity in registry.present_identities().await {
				registry.unregister(&identity, conn_id).await;
			}
		}
	}

	conn.shutdown().await;
	debug!(%conn_id, "session closed");
}

/// Read frames until EOF, a transport fault, or cancellation.
async fn read_loop<R>(
	mut reader: R,
	tx: mpsc::Sender<WireEnvelope>,
	max_frame_bytes: usize,
	cancel: &CancellationToken,
) -> anyhow::Result<()>
where
	R: AsyncRead + Unpin,
{
	let mut buf = BytesMut::with_capacity(16 * 1024);

	loop {
		loop {
			match try_decode_frame_from_buffer::<WireEnvelope>(&mut buf, max_frame_bytes) {
				Ok(Some(env)) => {
					metrics::counter!("courier_relay_envelopes_in_total").increment(1);
					let sent = tokio::select! {
						_ = cancel.cancelled() => return Ok(()),
						sent = tx.send(env) => sent,
					};
					if sent.is_err() {
						return Ok(());
					}
				}
				Ok(None) => break,
				Err(e) => {
					metrics::counter!("courier_relay_decode_errors_total").increment(1);
					return Err(anyhow!(e).context("decode envelope frame"));
				}
			}
		}

		let n = tokio::select! {
			_ = cancel.cancelled() => return Ok(()),
			n = reader.read_buf(&mut buf) => n.context("connection read")?,
		};
		if n == 0 {
			if buf.is_empty() {
				return Ok(());
			}
			return Err(anyhow!("connection closed mid-frame ({} bytes buffered)", buf.len()));
		}
		metrics::counter!("courier_relay_bytes_in_total").increment(n as u64);
	}
}

struct Dispatcher {
	conn_id: ConnId,
	conn: ConnHandle,
	router: Arc<Router>,
	auth: Arc<dyn Authenticator>,
	rate_limiter: Option<TokenBucket>,
	/// Identities this session has put in the registry.
	registered: HashSet<Identity>,
}

impl Dispatcher {
	async fn run(mut self, mut rx: mpsc::Receiver<WireEnvelope>, cancel: CancellationToken) -> HashSet<Identity> {
		loop {
			// Envelopes already handed over are still answered after cancellation.
			let wire = tokio::select! {
				biased;
				wire = rx.recv() => wire,
				_ = cancel.cancelled() => None,
			};
			let Some(wire) = wire else {
				break;
			};

			let reply = self.dispatch(wire).await;
			if let Err(e) = self.conn.send(&reply).await {
				debug!(conn_id = %self.conn_id, error = %e, "reply write failed");
				cancel.cancel();
				break;
			}
			metrics::counter!("courier_relay_replies_out_total", "code" => reply.result_code.as_u16().to_string())
				.increment(1);
		}
		self.registered
	}

	fn allow(&mut self) -> bool {
		match self.rate_limiter.as_mut() {
			Some(bucket) => bucket.allow(),
			None => true,
		}
	}

	async fn dispatch(&mut self, wire: WireEnvelope) -> Reply {
		if !self.allow() {
			metrics::counter!("courier_relay_rate_limited_total").increment(1);
			return Reply::rate_limited("rate limit exceeded");
		}

		let envelope = match Envelope::try_from(wire) {
			Ok(env) => env,
			Err(e) => {
				metrics::counter!("courier_relay_malformed_total").increment(1);
				debug!(conn_id = %self.conn_id, error = %e, "malformed envelope");
				return Reply::bad_request(e.to_string());
			}
		};

		let source = match self.auth.verify(envelope.credential()).await {
			Ok(identity) => identity,
			Err(e) => {
				metrics::counter!("courier_relay_auth_failures_total").increment(1);
				warn!(conn_id = %self.conn_id, kind = envelope.kind(), error = %e, "credential rejected");
				return Reply::unauthorized("invalid credential");
			}
		};

		self.register(&source).await;

		match envelope {
			Envelope::PresenceAnnounce { .. } => Reply::ok("online"),
			Envelope::ChatRequest { target, content, .. } => {
				let outcome = self.router.route(source, target, content).await;
				match outcome {
					DeliveryOutcome::Rejected => Reply::internal(outcome.reply_text()),
					_ => Reply::ok(outcome.reply_text()),
				}
			}
		}
	}

	async fn register(&mut self, identity: &Identity) {
		let registry = self.router.registry();
		if let Some(previous) = registry.register(identity.clone(), self.conn.clone()).await {
			info!(conn_id = %self.conn_id, identity = %identity, %previous, "presence moved to new connection");
		}
		self.registered.insert(identity.clone());
	}
}
