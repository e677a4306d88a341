#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use courier_domain::{Identity, PendingMessage};
use courier_protocol::{DEFAULT_MAX_FRAME_SIZE, Delivery, try_decode_frame_from_buffer};
use tokio::io::{AsyncReadExt, DuplexStream};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::server::connection::{ConnHandle, ConnId};
use crate::server::offline_store::{InMemoryOfflineStore, OfflineStore};
use crate::server::poller::{PollerSettings, ReconciliationPoller, TickStats};
use crate::server::queue_bridge::LocalQueueBridge;
use crate::server::registry::PresenceRegistry;
use crate::server::router::Router;
use crate::util::time::unix_ms_now;

fn id(s: &str) -> Identity {
	Identity::new(s).expect("valid identity")
}

fn connect(n: u64) -> (DuplexStream, ConnHandle) {
	connect_with_limit(n, DEFAULT_MAX_FRAME_SIZE)
}

fn connect_with_limit(n: u64, max_frame_bytes: usize) -> (DuplexStream, ConnHandle) {
	let (client, server) = tokio::io::duplex(64 * 1024);
	(
		client,
		ConnHandle::new(ConnId(n), server, Duration::from_millis(500), max_frame_bytes),
	)
}

async fn read_deliveries(client: &mut DuplexStream, count: usize) -> Vec<Delivery> {
	let mut buf = BytesMut::new();
	let mut out = Vec::new();
	while out.len() < count {
		while let Some(d) = try_decode_frame_from_buffer::<Delivery>(&mut buf, DEFAULT_MAX_FRAME_SIZE).expect("decode") {
			out.push(d);
		}
		if out.len() >= count {
			break;
		}
		let n = timeout(Duration::from_secs(1), client.read_buf(&mut buf))
			.await
			.expect("delivery within timeout")
			.expect("read");
		assert!(n > 0, "peer closed before all deliveries");
	}
	out
}

fn setup(settings: PollerSettings) -> (PresenceRegistry, Arc<InMemoryOfflineStore>, ReconciliationPoller) {
	let registry = PresenceRegistry::new();
	let store = Arc::new(InMemoryOfflineStore::new());
	let router = Arc::new(Router::new(
		registry.clone(),
		Arc::new(LocalQueueBridge::new(8)),
		store.clone() as Arc<dyn OfflineStore>,
		"relay-a",
	));
	let poller = ReconciliationPoller::new(router, store.clone() as Arc<dyn OfflineStore>, settings);
	(registry, store, poller)
}

fn pending(to: &str, content: &str) -> PendingMessage {
	PendingMessage::new(id("alice"), id(to), content, unix_ms_now()).with_origin("relay-a")
}

#[tokio::test]
async fn stored_messages_reach_identity_once_present() {
	let (registry, store, poller) = setup(PollerSettings::default());
	store.append(&pending("bob", "one")).await.expect("append");
	store.append(&pending("bob", "two")).await.expect("append");

	// Nobody present: nothing happens.
	assert_eq!(poller.tick().await, TickStats::default());
	assert_eq!(store.pending_count(&id("bob")).await.expect("count"), 2);

	let (mut bob_client, bob) = connect(1);
	registry.register(id("bob"), bob).await;

	let stats = poller.tick().await;
	assert_eq!(stats.delivered, 2);
	assert_eq!(store.pending_count(&id("bob")).await.expect("count"), 0);

	let got = read_deliveries(&mut bob_client, 2).await;
	let contents: Vec<_> = got.iter().map(|d| d.content.as_str()).collect();
	assert_eq!(contents, vec!["one", "two"]);
	assert!(got.iter().all(|d| d.from == id("alice")));
}

#[tokio::test]
async fn per_identity_batch_is_bounded() {
	let (registry, store, poller) = setup(PollerSettings {
		max_per_identity: 1,
		..PollerSettings::default()
	});
	store.append(&pending("bob", "one")).await.expect("append");
	store.append(&pending("bob", "two")).await.expect("append");

	let (_bob_client, bob) = connect(1);
	registry.register(id("bob"), bob).await;

	assert_eq!(poller.tick().await.delivered, 1);
	assert_eq!(store.pending_count(&id("bob")).await.expect("count"), 1);
	assert_eq!(poller.tick().await.delivered, 1);
	assert_eq!(store.pending_count(&id("bob")).await.expect("count"), 0);
}

#[tokio::test]
async fn failed_write_keeps_message_and_counts_attempt() {
	let (registry, store, poller) = setup(PollerSettings::default());
	store.append(&pending("bob", "kept")).await.expect("append");

	let (bob_client, bob) = connect(1);
	registry.register(id("bob"), bob).await;
	drop(bob_client);

	let stats = poller.tick().await;
	assert_eq!(stats.failed, 1);
	assert_eq!(stats.delivered, 0);
	assert!(!registry.is_present(&id("bob")).await);

	let stored = store.peek_one_for(&id("bob")).await.expect("peek").expect("still stored");
	assert_eq!(stored.message.content, "kept");
	assert_eq!(stored.attempts, 1);
}

#[tokio::test]
async fn records_past_max_attempts_are_dropped() {
	let (registry, store, poller) = setup(PollerSettings {
		max_attempts: Some(1),
		..PollerSettings::default()
	});
	let doomed = pending("bob", "doomed");
	store.append(&doomed).await.expect("append");
	store.append(&pending("bob", "fresh")).await.expect("append");
	store.record_failed_attempt(&id("bob"), &doomed.id).await.expect("attempt");

	let (mut bob_client, bob) = connect(1);
	registry.register(id("bob"), bob).await;

	let stats = poller.tick().await;
	assert_eq!(stats.expired, 1);
	assert_eq!(stats.delivered, 1);

	let got = read_deliveries(&mut bob_client, 1).await;
	assert_eq!(got[0].content, "fresh");
}

#[tokio::test]
async fn records_past_ttl_are_dropped() {
	let (registry, store, poller) = setup(PollerSettings {
		ttl: Some(Duration::from_secs(60)),
		..PollerSettings::default()
	});
	let old = PendingMessage::new(id("alice"), id("bob"), "old", unix_ms_now() - 120_000);
	store.append(&old).await.expect("append");

	let (_bob_client, bob) = connect(1);
	registry.register(id("bob"), bob).await;

	let stats = poller.tick().await;
	assert_eq!(stats.expired, 1);
	assert_eq!(stats.delivered, 0);
	assert_eq!(store.pending_count(&id("bob")).await.expect("count"), 0);
}

#[tokio::test]
async fn unencodable_record_is_kept_and_counted() {
	let (registry, store, poller) = setup(PollerSettings::default());
	store.append(&pending("bob", &"x".repeat(256))).await.expect("append");
	store.append(&pending("bob", "behind")).await.expect("append");

	let (_bob_client, bob) = connect_with_limit(1, 64);
	registry.register(id("bob"), bob).await;

	let stats = poller.tick().await;
	assert_eq!(stats.failed, 1);
	assert_eq!(stats.expired, 0);
	assert!(registry.is_present(&id("bob")).await);

	let head = store.peek_one_for(&id("bob")).await.expect("peek").expect("kept");
	assert_eq!(head.message.content.len(), 256);
	assert_eq!(head.attempts, 1);
	assert_eq!(store.pending_count(&id("bob")).await.expect("count"), 2);
}

#[tokio::test]
async fn unencodable_record_expires_under_max_attempts() {
	let (registry, store, poller) = setup(PollerSettings {
		max_attempts: Some(2),
		..PollerSettings::default()
	});
	store.append(&pending("bob", &"x".repeat(256))).await.expect("append");

	let (_bob_client, bob) = connect_with_limit(1, 64);
	registry.register(id("bob"), bob).await;

	assert_eq!(poller.tick().await.failed, 1);
	assert_eq!(poller.tick().await.failed, 1);
	assert_eq!(poller.tick().await.expired, 1);
	assert_eq!(store.pending_count(&id("bob")).await.expect("count"), 0);
}

#[tokio::test]
async fn old_removal_markers_are_pruned() {
	let (_registry, store, poller) = setup(PollerSettings {
		removal_retention: Duration::from_millis(1),
		..PollerSettings::default()
	});
	let delivered = pending("bob", "gone");
	store.remove(&id("bob"), &delivered.id).await.expect("remove");
	tokio::time::sleep(Duration::from_millis(10)).await;

	assert_eq!(poller.prune_removed().await, 1);
	store.append(&delivered).await.expect("append");
	assert_eq!(store.pending_count(&id("bob")).await.expect("count"), 1);
}

#[tokio::test]
async fn idle_poller_wakes_on_registration() {
	let (registry, store, poller) = setup(PollerSettings {
		interval: Duration::from_millis(20),
		idle_interval: Duration::from_secs(3600),
		..PollerSettings::default()
	});
	store.append(&pending("bob", "wake")).await.expect("append");

	let cancel = CancellationToken::new();
	let task = tokio::spawn(poller.run(cancel.clone()));
	tokio::time::sleep(Duration::from_millis(20)).await;

	let (mut bob_client, bob) = connect(1);
	registry.register(id("bob"), bob).await;

	let got = read_deliveries(&mut bob_client, 1).await;
	assert_eq!(got[0].content, "wake");

	cancel.cancel();
	timeout(Duration::from_secs(1), task)
		.await
		.expect("poller stops on cancel")
		.expect("join");
}
