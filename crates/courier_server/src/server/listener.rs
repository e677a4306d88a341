#![forbid(unsafe_code)]

use std::time::Duration;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::server::connection::ConnId;
use crate::server::session::{RelayContext, run_session};

/// Accept connections until cancelled, one session task per connection.
pub async fn serve(listener: TcpListener, ctx: RelayContext, cancel: CancellationToken) {
	let mut next_conn_id: u64 = 1;

	loop {
		let accepted = tokio::select! {
			_ = cancel.cancelled() => break,
			accepted = listener.accept() => accepted,
		};

		let (stream, remote) = match accepted {
			Ok(pair) => pair,
			Err(e) => {
				// Typically fd exhaustion; back off instead of spinning.
				warn!(error = %e, "accept failed");
				tokio::time::sleep(Duration::from_millis(100)).await;
				continue;
			}
		};

		if let Err(e) = stream.set_nodelay(true) {
			debug!(error = %e, "set_nodelay failed");
		}

		let conn_id = ConnId(next_conn_id);
		next_conn_id += 1;
		metrics::counter!("courier_relay_connections_total").increment(1);
		debug!(%conn_id, %remote, "accepted connection");

		let (reader, writer) = stream.into_split();
		tokio::spawn(run_session(conn_id, reader, writer, ctx.clone(), cancel.child_token()));
	}
	debug!("listener stopped");
}
