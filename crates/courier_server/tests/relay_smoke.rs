#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::process::Stdio;
use std::time::Duration;

use anyhow::Context as _;
use courier_client_core::RelayClient;
use courier_protocol::ResultCode;
use tokio::process::{Child, Command};

fn free_local_addr() -> anyhow::Result<SocketAddr> {
	let listener = std::net::TcpListener::bind("127.0.0.1:0").context("bind port-finding listener")?;
	Ok(listener.local_addr()?)
}

fn spawn_relay(addr: SocketAddr) -> anyhow::Result<Child> {
	let missing_config = std::env::temp_dir().join(format!("courier-smoke-{}-missing.toml", std::process::id()));
	let log = if std::env::var_os("COURIER_TEST_LOG").is_some() {
		Stdio::inherit()
	} else {
		Stdio::null()
	};

	Command::new(env!("CARGO_BIN_EXE_courier_server"))
		.arg("--bind")
		.arg(format!("tcp://{addr}"))
		.arg("--config")
		.arg(missing_config)
		.env("COURIER_AUTH_INSECURE_PLAINTEXT", "true")
		.env("COURIER_RECONCILE_INTERVAL_MS", "50")
		.env_remove("COURIER_AUTH_HMAC_SECRET")
		.env_remove("COURIER_QUEUE_BACKEND")
		.env_remove("COURIER_OFFLINE_STORE_DATABASE_URL")
		.stdout(Stdio::null())
		.stderr(log)
		.kill_on_drop(true)
		.spawn()
		.context("spawn courier_server")
}

async fn connect_with_retry(addr: SocketAddr) -> anyhow::Result<RelayClient> {
	let mut last_err = None;
	for _ in 0..100 {
		match RelayClient::connect_addr(addr).await {
			Ok(c) => return Ok(c),
			Err(e) => last_err = Some(e),
		}
		tokio::time::sleep(Duration::from_millis(50)).await;
	}
	Err(anyhow::anyhow!("relay never accepted connections: {last_err:?}"))
}

#[tokio::test]
async fn relay_binary_delivers_live_and_offline_messages() -> anyhow::Result<()> {
	let addr = free_local_addr()?;
	let _relay = spawn_relay(addr)?;

	let mut alice = connect_with_retry(addr).await?;
	let mut bob = connect_with_retry(addr).await?;

	assert_eq!(bob.announce("bob").await?.result_code, ResultCode::Ok);
	let reply = alice.send_chat("alice", "bob", "live").await?;
	assert_eq!(reply.content, "delivered");
	let d = tokio::time::timeout(Duration::from_secs(2), bob.next_delivery()).await??;
	assert_eq!((d.from.as_str(), d.content.as_str()), ("alice", "live"));

	let reply = alice.send_chat("alice", "carol", "stored").await?;
	assert_eq!(reply.result_code, ResultCode::Ok);
	assert_ne!(reply.content, "delivered");

	// Give the consumer a moment to hand the message to the offline store.
	tokio::time::sleep(Duration::from_millis(100)).await;

	let mut carol = connect_with_retry(addr).await?;
	assert_eq!(carol.announce("carol").await?.result_code, ResultCode::Ok);
	let d = tokio::time::timeout(Duration::from_secs(2), carol.next_delivery())
		.await
		.context("reconciled delivery within timeout")??;
	assert_eq!((d.from.as_str(), d.content.as_str()), ("alice", "stored"));

	Ok(())
}
