#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use courier_domain::{Identity, StoredMessage};
use courier_protocol::Delivery;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::server::offline_store::OfflineStore;
use crate::server::router::{DirectOutcome, Router};
use crate::util::time::unix_ms_now;

#[derive(Debug, Clone)]
pub struct PollerSettings {
	pub interval: Duration,
	/// Sleep used while nobody is present; cut short by any registration.
	pub idle_interval: Duration,
	/// Upper bound of records delivered per identity per tick.
	pub max_per_identity: usize,
	pub max_attempts: Option<u32>,
	pub ttl: Option<Duration>,
	/// How long a delivered message id keeps blocking late appends of the same message.
	pub removal_retention: Duration,
}

impl Default for PollerSettings {
	fn default() -> Self {
		Self {
			interval: Duration::from_secs(5),
			idle_interval: Duration::from_secs(30),
			max_per_identity: 32,
			max_attempts: None,
			ttl: None,
			removal_retention: Duration::from_secs(3600),
		}
	}
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickStats {
	pub delivered: usize,
	pub failed: usize,
	pub expired: usize,
}

/// Background redelivery of offline messages to identities that are present again.
pub struct ReconciliationPoller {
	router: Arc<Router>,
	store: Arc<dyn OfflineStore>,
	settings: PollerSettings,
}

impl ReconciliationPoller {
	pub fn new(router: Arc<Router>, store: Arc<dyn OfflineStore>, settings: PollerSettings) -> Self {
		Self {
			router,
			store,
			settings,
		}
	}

	fn is_expired(&self, stored: &StoredMessage, now_ms: i64) -> bool {
		if let Some(max) = self.settings.max_attempts
			&& stored.attempts >= max
		{
			return true;
		}
		if let Some(ttl) = self.settings.ttl
			&& stored.age_ms(now_ms) > ttl.as_millis() as u64
		{
			return true;
		}
		false
	}

	/// One pass over every present identity.
	pub async fn tick(&self) -> TickStats {
		let mut stats = TickStats::default();
		for identity in self.router.registry().present_identities().await {
			self.drain_identity(&identity, &mut stats).await;
		}

		metrics::counter!("courier_relay_reconciled_total").increment(stats.delivered as u64);
		metrics::counter!("courier_relay_expired_total").increment(stats.expired as u64);
		if stats != TickStats::default() {
			debug!(
				delivered = stats.delivered,
				failed = stats.failed,
				expired = stats.expired,
				"reconciliation tick"
			);
		}
		stats
	}

	async fn drain_identity(&self, identity: &Identity, stats: &mut TickStats) {
		for _ in 0..self.settings.max_per_identity {
			let stored = match self.store.peek_one_for(identity).await {
				Ok(Some(s)) => s,
				Ok(None) => return,
				Err(e) => {
					warn!(identity = %identity, error = %e, "offline store peek failed");
					return;
				}
			};

			if self.is_expired(&stored, unix_ms_now()) {
				warn!(
					identity = %identity,
					message_id = %stored.message.id,
					attempts = stored.attempts,
					"dropping offline message past retry bounds"
				);
				if let Err(e) = self.store.remove(identity, &stored.message.id).await {
					warn!(identity = %identity, error = %e, "offline store remove failed");
					return;
				}
				stats.expired += 1;
				continue;
			}

			let delivery = Delivery {
				from: stored.message.source.clone(),
				content: stored.message.content.clone(),
			};
			match self.router.deliver_direct(identity, &delivery).await {
				DirectOutcome::Delivered => {
					if let Err(e) = self.store.remove(identity, &stored.message.id).await {
						// Left in place; the next tick delivers it again.
						warn!(identity = %identity, message_id = %stored.message.id, error = %e, "offline store remove failed");
						return;
					}
					stats.delivered += 1;
				}
				DirectOutcome::Unencodable => {
					// Kept at the head; only max_attempts or ttl removes it.
					error!(
						identity = %identity,
						message_id = %stored.message.id,
						attempts = stored.attempts,
						"offline message cannot be encoded for delivery; keeping it stored"
					);
					self.count_failure(identity, &stored, stats).await;
					return;
				}
				DirectOutcome::Absent | DirectOutcome::Stale => {
					self.count_failure(identity, &stored, stats).await;
					return;
				}
			}
		}
	}

	async fn count_failure(&self, identity: &Identity, stored: &StoredMessage, stats: &mut TickStats) {
		if let Err(e) = self.store.record_failed_attempt(identity, &stored.message.id).await {
			warn!(identity = %identity, error = %e, "offline store attempt bookkeeping failed");
		}
		stats.failed += 1;
	}

	/// Forget removal markers older than `removal_retention`.
	pub async fn prune_removed(&self) -> u64 {
		let cutoff = unix_ms_now().saturating_sub(self.settings.removal_retention.as_millis() as i64);
		match self.store.prune_removed(cutoff).await {
			Ok(n) => {
				if n > 0 {
					debug!(pruned = n, "removal markers pruned");
				}
				n
			}
			Err(e) => {
				warn!(error = %e, "pruning removal markers failed");
				0
			}
		}
	}

	pub async fn run(self, cancel: CancellationToken) {
		let registry = self.router.registry().clone();
		loop {
			self.prune_removed().await;
			let idle = registry.is_empty().await;
			if !idle {
				self.tick().await;
			}

			let pause = if idle {
				self.settings.idle_interval
			} else {
				self.settings.interval
			};

			tokio::select! {
				_ = cancel.cancelled() => break,
				_ = tokio::time::sleep(pause) => {}
				_ = registry.wait_for_registration(), if idle => {}
			}
		}
		debug!("reconciliation poller stopped");
	}
}
