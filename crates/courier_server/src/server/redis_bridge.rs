#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, anyhow};
use courier_domain::PendingMessage;
use futures::StreamExt;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::server::offline_store::OfflineStore;
use crate::server::queue_bridge::QueueBridge;
use crate::util::time::backoff_delay;

const RECONNECT_MIN: Duration = Duration::from_millis(250);
const RECONNECT_MAX: Duration = Duration::from_secs(15);

/// Queue bridge over Redis pub/sub.
///
/// `publish` only enqueues onto a bounded channel; a background task owns the broker
/// round-trip and appends to the offline store whenever the broker rejects a message.
pub struct RedisQueueBridge {
	client: redis::Client,
	topic: String,
	outbound: mpsc::Sender<PendingMessage>,
	subscriber_capacity: usize,
	cancel: CancellationToken,
}

impl RedisQueueBridge {
	pub async fn connect(
		redis_url: &str,
		topic: impl Into<String>,
		outbound_capacity: usize,
		fallback: Arc<dyn OfflineStore>,
		cancel: CancellationToken,
	) -> anyhow::Result<Self> {
		let topic = topic.into();
		let client = redis::Client::open(redis_url).context("open redis client")?;
		let conn = ConnectionManager::new(client.clone())
			.await
			.context("connect redis")?;

		let capacity = outbound_capacity.max(1);
		let (outbound, rx) = mpsc::channel(capacity);
		tokio::spawn(run_publisher(conn, topic.clone(), rx, fallback, cancel.clone()));

		info!(topic = %topic, "redis queue bridge connected");
		Ok(Self {
			client,
			topic,
			outbound,
			subscriber_capacity: capacity,
			cancel,
		})
	}
}

#[async_trait::async_trait]
impl QueueBridge for RedisQueueBridge {
	fn publish(&self, msg: &PendingMessage) -> anyhow::Result<()> {
		match self.outbound.try_send(msg.clone()) {
			Ok(()) => Ok(()),
			Err(TrySendError::Full(_)) => Err(anyhow!("redis outbound queue full")),
			Err(TrySendError::Closed(_)) => Err(anyhow!("redis publisher stopped")),
		}
	}

	async fn subscribe(&self) -> anyhow::Result<mpsc::Receiver<PendingMessage>> {
		let (tx, rx) = mpsc::channel(self.subscriber_capacity);
		tokio::spawn(run_subscriber(
			self.client.clone(),
			self.topic.clone(),
			tx,
			self.cancel.clone(),
		));
		Ok(rx)
	}

	fn name(&self) -> &'static str {
		"redis"
	}
}

/// The one broker call the publisher task needs.
#[async_trait::async_trait]
pub(crate) trait TopicPublisher: Send {
	/// Publish `payload` on `topic` and return how many subscribers received it.
	async fn publish(&mut self, topic: &str, payload: String) -> anyhow::Result<i64>;
}

#[async_trait::async_trait]
impl TopicPublisher for ConnectionManager {
	async fn publish(&mut self, topic: &str, payload: String) -> anyhow::Result<i64> {
		let receivers: i64 = AsyncCommands::publish(self, topic, payload).await?;
		Ok(receivers)
	}
}

async fn run_publisher<P: TopicPublisher>(
	mut conn: P,
	topic: String,
	mut rx: mpsc::Receiver<PendingMessage>,
	fallback: Arc<dyn OfflineStore>,
	cancel: CancellationToken,
) {
	loop {
		let msg = tokio::select! {
			biased;
			_ = cancel.cancelled() => None,
			msg = rx.recv() => msg,
		};
		let Some(msg) = msg else {
			break;
		};

		let published = match serde_json::to_string(&msg) {
			Ok(payload) => conn.publish(&topic, payload).await,
			Err(e) => Err(anyhow!(e).context("encode pending message")),
		};

		match published {
			Ok(receivers) if receivers > 0 => {
				metrics::counter!("courier_relay_queue_published_total").increment(1);
			}
			Ok(_) => {
				metrics::counter!("courier_relay_publish_failures_total").increment(1);
				warn!(message_id = %msg.id, target = %msg.target, "no redis subscriber received message; storing offline");
				store_fallback(fallback.as_ref(), &msg).await;
			}
			Err(e) => {
				metrics::counter!("courier_relay_publish_failures_total").increment(1);
				warn!(message_id = %msg.id, target = %msg.target, error = %e, "redis publish failed; storing offline");
				store_fallback(fallback.as_ref(), &msg).await;
			}
		}
	}

	// Anything still queued at shutdown goes to the store rather than being dropped.
	rx.close();
	while let Some(msg) = rx.recv().await {
		store_fallback(fallback.as_ref(), &msg).await;
	}
	debug!("redis publisher stopped");
}

async fn store_fallback(store: &dyn OfflineStore, msg: &PendingMessage) {
	metrics::counter!("courier_relay_store_fallbacks_total").increment(1);
	if let Err(e) = store.append(msg).await {
		error!(message_id = %msg.id, target = %msg.target, error = %e, "offline store append failed; message lost");
	}
}

async fn run_subscriber(
	client: redis::Client,
	topic: String,
	tx: mpsc::Sender<PendingMessage>,
	cancel: CancellationToken,
) {
	let mut attempt: u32 = 0;
	while !cancel.is_cancelled() && !tx.is_closed() {
		let mut pubsub = match client.get_async_pubsub().await {
			Ok(p) => p,
			Err(e) => {
				let delay = backoff_delay(attempt, RECONNECT_MIN, RECONNECT_MAX);
				attempt = attempt.saturating_add(1);
				warn!(error = %e, ?delay, "redis subscriber connect failed");
				tokio::select! {
					_ = cancel.cancelled() => break,
					_ = tokio::time::sleep(delay) => continue,
				}
			}
		};

		if let Err(e) = pubsub.subscribe(&topic).await {
			let delay = backoff_delay(attempt, RECONNECT_MIN, RECONNECT_MAX);
			attempt = attempt.saturating_add(1);
			warn!(topic = %topic, error = %e, ?delay, "redis subscribe failed");
			tokio::select! {
				_ = cancel.cancelled() => break,
				_ = tokio::time::sleep(delay) => continue,
			}
		}

		attempt = 0;
		info!(topic = %topic, "redis subscriber listening");

		let mut messages = pubsub.on_message();
		loop {
			let next = tokio::select! {
				_ = cancel.cancelled() => return,
				next = messages.next() => next,
			};
			let Some(raw) = next else {
				warn!(topic = %topic, "redis subscription stream ended; reconnecting");
				break;
			};

			let payload: String = match raw.get_payload() {
				Ok(p) => p,
				Err(e) => {
					warn!(error = %e, "redis message payload unreadable");
					continue;
				}
			};
			let msg: PendingMessage = match serde_json::from_str(&payload) {
				Ok(m) => m,
				Err(e) => {
					metrics::counter!("courier_relay_queue_decode_errors_total").increment(1);
					warn!(error = %e, "dropping malformed queue message");
					continue;
				}
			};
			if tx.send(msg).await.is_err() {
				return;
			}
		}
	}
	debug!(topic = %topic, "redis subscriber stopped");
}
