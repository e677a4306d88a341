#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;

use courier_domain::Identity;
use tokio::sync::{Notify, RwLock};
use tracing::debug;

use crate::server::connection::{ConnHandle, ConnId};

/// Which identities are directly reachable right now, and through which connection.
///
/// Holds non-owning handles: sessions own their connections and remove their own
/// entries on exit. At most one entry per identity; a newer registration replaces
/// the older one.
#[derive(Clone, Default)]
pub struct PresenceRegistry {
	inner: Arc<RwLock<HashMap<Identity, ConnHandle>>>,
	registered: Arc<Notify>,
}

impl PresenceRegistry {
	pub fn new() -> Self {
		Self::default()
	}

	/// Map `identity` to `conn`. Returns the id of a different connection that was superseded.
	pub async fn register(&self, identity: Identity, conn: ConnHandle) -> Option<ConnId> {
		let conn_id = conn.id();
		let (prev, present) = {
			let mut map = self.inner.write().await;
			let prev = map.insert(identity.clone(), conn);
			(prev.map(|p| p.id()), map.len())
		};
		metrics::gauge!("courier_relay_present_identities").set(present as f64);

		let superseded = prev.filter(|p| *p != conn_id);
		if prev.is_none() || superseded.is_some() {
			debug!(identity = %identity, %conn_id, superseded = ?superseded, "presence registered");
			self.registered.notify_one();
		}
		superseded
	}

	pub async fn lookup(&self, identity: &Identity) -> Option<ConnHandle> {
		self.inner.read().await.get(identity).cloned()
	}

	/// Remove `identity` only if it still maps to `conn_id`.
	pub async fn unregister(&self, identity: &Identity, conn_id: ConnId) -> bool {
		let (removed, present) = {
			let mut map = self.inner.write().await;
			let matches = map.get(identity).is_some_and(|c| c.id() == conn_id);
			if matches {
				map.remove(identity);
			}
			(matches, map.len())
		};

		if removed {
			metrics::gauge!("courier_relay_present_identities").set(present as f64);
			debug!(identity = %identity, %conn_id, "presence unregistered");
		}
		removed
	}

	pub async fn is_present(&self, identity: &Identity) -> bool {
		self.inner.read().await.contains_key(identity)
	}

	/// Snapshot of the currently present identities.
	pub async fn present_identities(&self) -> Vec<Identity> {
		self.inner.read().await.keys().cloned().collect()
	}

	pub async fn len(&self) -> usize {
		self.inner.read().await.len()
	}

	pub async fn is_empty(&self) -> bool {
		self.inner.read().await.is_empty()
	}

	/// Resolves after a registration that added or replaced an entry.
	///
	/// A registration with nobody waiting is remembered, so the next call returns at once.
	pub async fn wait_for_registration(&self) {
		self.registered.notified().await;
	}
}
