#![forbid(unsafe_code)]

use std::sync::Arc;

use courier_domain::{Identity, PendingMessage};
use courier_protocol::Delivery;
use tracing::{debug, error, info, warn};

use crate::server::connection::SendError;
use crate::server::offline_store::OfflineStore;
use crate::server::queue_bridge::QueueBridge;
use crate::server::registry::PresenceRegistry;
use crate::util::time::unix_ms_now;

/// Result of routing one chat request. Everything but `Rejected` is a success for the sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
	/// Written to the recipient's live connection.
	Delivered,
	/// Handed to the queue bridge, with a background offline store write.
	Deferred,
	/// The bridge refused it; only the background offline store write carries it.
	DeferredUncertain,
	/// The delivery frame could not be encoded within the frame limit.
	Rejected,
}

impl DeliveryOutcome {
	pub fn reply_text(self) -> &'static str {
		match self {
			DeliveryOutcome::Delivered => "delivered",
			DeliveryOutcome::Deferred => "recipient offline; will deliver later",
			DeliveryOutcome::DeferredUncertain => "recipient offline; queued for later delivery",
			DeliveryOutcome::Rejected => "message could not be encoded for delivery",
		}
	}
}

/// Result of a single direct write attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectOutcome {
	Delivered,
	Absent,
	/// A registry entry existed but the write failed; the entry was removed.
	Stale,
	/// The delivery does not fit in one frame. The connection is untouched.
	Unencodable,
}

pub struct Router {
	registry: PresenceRegistry,
	bridge: Arc<dyn QueueBridge>,
	store: Arc<dyn OfflineStore>,
	instance_id: String,
}

impl Router {
	pub fn new(
		registry: PresenceRegistry,
		bridge: Arc<dyn QueueBridge>,
		store: Arc<dyn OfflineStore>,
		instance_id: impl Into<String>,
	) -> Self {
		Self {
			registry,
			bridge,
			store,
			instance_id: instance_id.into(),
		}
	}

	pub fn registry(&self) -> &PresenceRegistry {
		&self.registry
	}

	pub fn instance_id(&self) -> &str {
		&self.instance_id
	}

	/// Try one write to the connection currently registered for `target`.
	pub async fn deliver_direct(&self, target: &Identity, delivery: &Delivery) -> DirectOutcome {
		let Some(conn) = self.registry.lookup(target).await else {
			return DirectOutcome::Absent;
		};

		match conn.send(delivery).await {
			Ok(()) => {
				metrics::counter!("courier_relay_direct_deliveries_total").increment(1);
				DirectOutcome::Delivered
			}
			Err(SendError::Encode(e)) => {
				error!(target = %target, error = %e, "delivery frame could not be encoded");
				DirectOutcome::Unencodable
			}
			Err(e) => {
				metrics::counter!("courier_relay_stale_connections_total").increment(1);
				warn!(target = %target, conn_id = %conn.id(), error = %e, "direct write failed; dropping stale presence");
				self.registry.unregister(target, conn.id()).await;
				DirectOutcome::Stale
			}
		}
	}

	/// Deliver `content` from `source` to `target`, deferring when the target is unreachable.
	///
	/// Never waits on the queue broker or the offline store.
	pub async fn route(&self, source: Identity, target: Identity, content: String) -> DeliveryOutcome {
		let delivery = Delivery {
			from: source.clone(),
			content,
		};

		match self.deliver_direct(&target, &delivery).await {
			DirectOutcome::Delivered => {
				debug!(source = %source, target = %target, "delivered directly");
				return DeliveryOutcome::Delivered;
			}
			DirectOutcome::Unencodable => return DeliveryOutcome::Rejected,
			DirectOutcome::Absent | DirectOutcome::Stale => {}
		}

		let msg = PendingMessage::new(source, target, delivery.content, unix_ms_now()).with_origin(&self.instance_id);

		// Stored first so the message survives a bridge that accepts it and then loses it.
		// Whichever instance delivers it removes the record again.
		self.spawn_store(msg.clone());

		match self.bridge.publish(&msg) {
			Ok(()) => {
				metrics::counter!("courier_relay_deferred_total").increment(1);
				debug!(message_id = %msg.id, target = %msg.target, bridge = self.bridge.name(), "deferred via queue");
				DeliveryOutcome::Deferred
			}
			Err(e) => {
				metrics::counter!("courier_relay_publish_failures_total").increment(1);
				warn!(message_id = %msg.id, target = %msg.target, error = %e, "queue publish failed; offline store only");
				DeliveryOutcome::DeferredUncertain
			}
		}
	}

	fn spawn_store(&self, msg: PendingMessage) {
		let store = Arc::clone(&self.store);
		tokio::spawn(async move {
			if let Err(e) = store.append(&msg).await {
				error!(message_id = %msg.id, target = %msg.target, error = %e, "offline store append failed");
			}
		});
	}

	/// Handle a message consumed from the queue bridge.
	///
	/// Undeliverable messages go to the offline store, never back onto the queue. Appends
	/// are idempotent by message id, so every instance sharing the topic may store the same
	/// message and still leave one record. A delivered message is removed from the store,
	/// which also blocks a slower append of it from any instance.
	pub async fn handle_queued(&self, msg: PendingMessage) {
		let delivery = Delivery {
			from: msg.source.clone(),
			content: msg.content.clone(),
		};

		match self.deliver_direct(&msg.target, &delivery).await {
			DirectOutcome::Delivered => {
				info!(message_id = %msg.id, target = %msg.target, "queued message delivered");
				if let Err(e) = self.store.remove(&msg.target, &msg.id).await {
					// The poller may deliver the stored copy once more.
					warn!(message_id = %msg.id, target = %msg.target, error = %e, "offline store remove failed");
				}
			}
			DirectOutcome::Unencodable => {
				// Kept stored; the poller counts its attempts and retry bounds decide its fate.
				error!(message_id = %msg.id, target = %msg.target, "queued message cannot be encoded for delivery; keeping it stored");
				self.store_queued(&msg).await;
			}
			DirectOutcome::Absent | DirectOutcome::Stale => {
				metrics::counter!("courier_relay_store_fallbacks_total").increment(1);
				self.store_queued(&msg).await;
			}
		}
	}

	async fn store_queued(&self, msg: &PendingMessage) {
		match self.store.append(msg).await {
			Ok(()) => debug!(message_id = %msg.id, target = %msg.target, "stored offline"),
			Err(e) => {
				error!(message_id = %msg.id, target = %msg.target, error = %e, "offline store append failed; message lost")
			}
		}
	}
}
