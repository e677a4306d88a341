#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::anyhow;
use courier_domain::PendingMessage;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::server::router::Router;

/// Shared pub/sub topic carrying deferred messages between relay instances.
#[async_trait::async_trait]
pub trait QueueBridge: Send + Sync {
	/// Hand `msg` to the bridge without waiting on the broker.
	///
	/// `Ok` means the bridge accepted the message; it does not mean a broker has it yet.
	fn publish(&self, msg: &PendingMessage) -> anyhow::Result<()>;

	/// Stream of every message published on the topic, from any instance.
	async fn subscribe(&self) -> anyhow::Result<mpsc::Receiver<PendingMessage>>;

	fn name(&self) -> &'static str;
}

/// Single-process bridge. Each subscriber owns a bounded channel and every publish is
/// offered to all of them.
///
/// A subscriber whose channel is full fails the publish instead of silently skipping
/// the message, so the caller can fall back to the offline store.
#[derive(Clone)]
pub struct LocalQueueBridge {
	subscribers: Arc<Mutex<Vec<mpsc::Sender<PendingMessage>>>>,
	capacity: usize,
}

impl LocalQueueBridge {
	pub fn new(capacity: usize) -> Self {
		Self {
			subscribers: Arc::new(Mutex::new(Vec::new())),
			capacity: capacity.max(1),
		}
	}
}

#[async_trait::async_trait]
impl QueueBridge for LocalQueueBridge {
	fn publish(&self, msg: &PendingMessage) -> anyhow::Result<()> {
		let mut subscribers = self
			.subscribers
			.lock()
			.map_err(|_| anyhow!("local queue subscriber list poisoned"))?;
		subscribers.retain(|tx| !tx.is_closed());
		if subscribers.is_empty() {
			return Err(anyhow!("no queue subscribers"));
		}

		let mut full = 0usize;
		for tx in subscribers.iter() {
			match tx.try_send(msg.clone()) {
				Ok(()) => {}
				Err(TrySendError::Full(_)) => full += 1,
				// Raced with a dropped receiver; pruned on the next publish.
				Err(TrySendError::Closed(_)) => {}
			}
		}

		if full > 0 {
			metrics::counter!("courier_relay_queue_full_total").increment(full as u64);
			warn!(message_id = %msg.id, full, "local queue subscriber full");
			return Err(anyhow!("local queue full for {full} subscriber(s)"));
		}
		Ok(())
	}

	async fn subscribe(&self) -> anyhow::Result<mpsc::Receiver<PendingMessage>> {
		let (tx, rx) = mpsc::channel(self.capacity);
		self.subscribers
			.lock()
			.map_err(|_| anyhow!("local queue subscriber list poisoned"))?
			.push(tx);
		Ok(rx)
	}

	fn name(&self) -> &'static str {
		"local"
	}
}

/// Consume the bridge topic and hand each message to the router until cancelled.
pub async fn run_queue_consumer(bridge: Arc<dyn QueueBridge>, router: Arc<Router>, cancel: CancellationToken) {
	let mut attempt: u32 = 0;
	loop {
		let mut rx = tokio::select! {
			_ = cancel.cancelled() => break,
			sub = bridge.subscribe() => match sub {
				Ok(rx) => {
					attempt = 0;
					info!(bridge = bridge.name(), "queue consumer subscribed");
					rx
				}
				Err(e) => {
					let delay = crate::util::time::backoff_delay(attempt, Duration::from_millis(200), Duration::from_secs(10));
					attempt = attempt.saturating_add(1);
					warn!(bridge = bridge.name(), error = %e, ?delay, "queue subscribe failed; retrying");
					tokio::select! {
						_ = cancel.cancelled() => break,
						_ = tokio::time::sleep(delay) => continue,
					}
				}
			},
		};

		loop {
			let msg = tokio::select! {
				_ = cancel.cancelled() => return,
				msg = rx.recv() => msg,
			};
			let Some(msg) = msg else {
				debug!(bridge = bridge.name(), "queue subscription closed; resubscribing");
				break;
			};
			metrics::counter!("courier_relay_queue_consumed_total").increment(1);
			router.handle_queued(msg).await;
		}
	}
	debug!(bridge = bridge.name(), "queue consumer stopped");
}

#[cfg(test)]
mod tests {
	use courier_domain::Identity;

	use super::*;

	fn pending(content: &str) -> PendingMessage {
		PendingMessage::new(
			Identity::new("alice").expect("identity"),
			Identity::new("bob").expect("identity"),
			content,
			0,
		)
	}

	#[tokio::test]
	async fn local_bridge_fans_out_to_every_subscriber() {
		let bridge = LocalQueueBridge::new(8);
		let mut a = bridge.subscribe().await.expect("subscribe");
		let mut b = bridge.subscribe().await.expect("subscribe");

		bridge.publish(&pending("hi")).expect("publish");

		let got_a = tokio::time::timeout(Duration::from_millis(500), a.recv()).await.expect("a").expect("open");
		let got_b = tokio::time::timeout(Duration::from_millis(500), b.recv()).await.expect("b").expect("open");
		assert_eq!(got_a.content, "hi");
		assert_eq!(got_a.id, got_b.id);
	}

	#[tokio::test]
	async fn local_publish_without_subscribers_fails() {
		let bridge = LocalQueueBridge::new(8);
		assert!(bridge.publish(&pending("lost")).is_err());

		let rx = bridge.subscribe().await.expect("subscribe");
		drop(rx);
		assert!(bridge.publish(&pending("lost")).is_err());
	}

	#[tokio::test]
	async fn local_publish_past_capacity_fails_instead_of_skipping() {
		let bridge = LocalQueueBridge::new(4);
		let mut rx = bridge.subscribe().await.expect("subscribe");

		for i in 0..4 {
			bridge.publish(&pending(&format!("m{i}"))).expect("within capacity");
		}
		assert!(bridge.publish(&pending("overflow")).is_err());

		// Everything accepted is still there, in order.
		for i in 0..4 {
			let got = rx.recv().await.expect("open");
			assert_eq!(got.content, format!("m{i}"));
		}
		bridge.publish(&pending("after drain")).expect("room again");
		assert_eq!(rx.recv().await.expect("open").content, "after drain");
	}
}
