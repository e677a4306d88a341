#![forbid(unsafe_code)]

use std::collections::{HashMap, VecDeque};

use anyhow::{Context, anyhow};
use courier_domain::{Identity, MessageId, PendingMessage, StoredMessage};
use tokio::sync::Mutex;

use crate::util::time::unix_ms_now;

/// Per-recipient ordered inbox of messages awaiting delivery.
///
/// Records are keyed by `MessageId`. Appending an id that is already stored, or that
/// was removed and not yet pruned, is a no-op, so every relay instance may append the
/// same message and a delivery acknowledged before the append still wins.
#[async_trait::async_trait]
pub trait OfflineStore: Send + Sync {
	/// Append to the tail of the target's inbox.
	async fn append(&self, msg: &PendingMessage) -> anyhow::Result<()>;

	/// Oldest record for `identity`, without removing it.
	async fn peek_one_for(&self, identity: &Identity) -> anyhow::Result<Option<StoredMessage>>;

	/// Remove `message_id` from the inbox of `identity` and remember it as removed.
	///
	/// Returns false when no such record was stored; the removal marker is written either way.
	async fn remove(&self, identity: &Identity, message_id: &MessageId) -> anyhow::Result<bool>;

	/// Bump the attempt counter of `message_id`.
	async fn record_failed_attempt(&self, identity: &Identity, message_id: &MessageId) -> anyhow::Result<()>;

	async fn pending_count(&self, identity: &Identity) -> anyhow::Result<usize>;

	/// Drop removal markers written before `before_unix_ms`. Returns how many went.
	async fn prune_removed(&self, before_unix_ms: i64) -> anyhow::Result<u64>;
}

#[derive(Default)]
struct Inboxes {
	by_target: HashMap<Identity, VecDeque<StoredMessage>>,
	removed: HashMap<MessageId, i64>,
}

#[derive(Default)]
pub struct InMemoryOfflineStore {
	inner: Mutex<Inboxes>,
}

impl InMemoryOfflineStore {
	pub fn new() -> Self {
		Self::default()
	}
}

#[async_trait::async_trait]
impl OfflineStore for InMemoryOfflineStore {
	async fn append(&self, msg: &PendingMessage) -> anyhow::Result<()> {
		let mut guard = self.inner.lock().await;
		if guard.removed.contains_key(&msg.id) {
			return Ok(());
		}
		let queue = guard.by_target.entry(msg.target.clone()).or_default();
		if !queue.iter().any(|s| s.message.id == msg.id) {
			queue.push_back(StoredMessage::new(msg.clone()));
		}
		Ok(())
	}

	async fn peek_one_for(&self, identity: &Identity) -> anyhow::Result<Option<StoredMessage>> {
		let guard = self.inner.lock().await;
		Ok(guard.by_target.get(identity).and_then(|q| q.front().cloned()))
	}

	async fn remove(&self, identity: &Identity, message_id: &MessageId) -> anyhow::Result<bool> {
		let mut guard = self.inner.lock().await;
		guard.removed.insert(*message_id, unix_ms_now());

		let Some(queue) = guard.by_target.get_mut(identity) else {
			return Ok(false);
		};
		let removed = match queue.iter().position(|s| s.message.id == *message_id) {
			Some(pos) => queue.remove(pos).is_some(),
			None => false,
		};
		if queue.is_empty() {
			guard.by_target.remove(identity);
		}
		Ok(removed)
	}

	async fn record_failed_attempt(&self, identity: &Identity, message_id: &MessageId) -> anyhow::Result<()> {
		let mut guard = self.inner.lock().await;
		if let Some(record) = guard
			.by_target
			.get_mut(identity)
			.and_then(|q| q.iter_mut().find(|s| s.message.id == *message_id))
		{
			record.attempts = record.attempts.saturating_add(1);
		}
		Ok(())
	}

	async fn pending_count(&self, identity: &Identity) -> anyhow::Result<usize> {
		let guard = self.inner.lock().await;
		Ok(guard.by_target.get(identity).map(VecDeque::len).unwrap_or(0))
	}

	async fn prune_removed(&self, before_unix_ms: i64) -> anyhow::Result<u64> {
		let mut guard = self.inner.lock().await;
		let before = guard.removed.len();
		guard.removed.retain(|_, removed_at| *removed_at >= before_unix_ms);
		Ok((before - guard.removed.len()) as u64)
	}
}

/// Offline store backed by sqlite, postgres or mysql.
#[derive(Clone)]
pub struct SqlOfflineStore {
	backend: SqlBackend,
}

#[derive(Clone)]
enum SqlBackend {
	Sqlite(sqlx::SqlitePool),
	Postgres(sqlx::PgPool),
	Mysql(sqlx::MySqlPool),
}

type Row = (i64, String, String, String, String, Option<String>, i64, i64);

const PEEK_QUERY: &str = "SELECT seq, message_id, source_user, target_user, content, origin, attempts, created_at_ms \
	FROM offline_messages WHERE target_user = ? ORDER BY seq LIMIT 1";
const PEEK_QUERY_PG: &str = "SELECT seq, message_id, source_user, target_user, content, origin, attempts, created_at_ms \
	FROM offline_messages WHERE target_user = $1 ORDER BY seq LIMIT 1";

fn row_to_stored(row: Row) -> anyhow::Result<StoredMessage> {
	let (seq, message_id, source, target, content, origin, attempts, created_at_unix_ms) = row;
	let message = PendingMessage {
		id: message_id
			.parse::<MessageId>()
			.map_err(|e| anyhow!("offline message {seq}: bad message_id: {e}"))?,
		source: Identity::new(source).map_err(|e| anyhow!("offline message {seq}: bad source_user: {e}"))?,
		target: Identity::new(target).map_err(|e| anyhow!("offline message {seq}: bad target_user: {e}"))?,
		content,
		origin,
		created_at_unix_ms,
	};
	Ok(StoredMessage {
		message,
		attempts: attempts.clamp(0, u32::MAX as i64) as u32,
	})
}

impl SqlOfflineStore {
	pub async fn connect(database_url: &str, max_connections: u32) -> anyhow::Result<Self> {
		let max_connections = max_connections.max(1);

		if database_url.starts_with("sqlite:") {
			// Every connection to an in-memory database is a separate database.
			let in_memory = database_url.contains(":memory:") || database_url.contains("mode=memory");
			let mut opts = sqlx::sqlite::SqlitePoolOptions::new();
			opts = if in_memory {
				opts.max_connections(1).idle_timeout(None).max_lifetime(None)
			} else {
				opts.max_connections(max_connections)
			};
			let pool = opts.connect(database_url).await.context("connect sqlite")?;
			sqlx::migrate!("migrations/sqlite")
				.run(&pool)
				.await
				.context("run sqlite migrations")?;

			Ok(Self {
				backend: SqlBackend::Sqlite(pool),
			})
		} else if database_url.starts_with("postgres:") || database_url.starts_with("postgresql:") {
			let pool = sqlx::postgres::PgPoolOptions::new()
				.max_connections(max_connections)
				.connect(database_url)
				.await
				.context("connect postgres")?;
			sqlx::migrate!("migrations/postgres")
				.run(&pool)
				.await
				.context("run postgres migrations")?;

			Ok(Self {
				backend: SqlBackend::Postgres(pool),
			})
		} else if database_url.starts_with("mysql:") || database_url.starts_with("mariadb:") {
			let pool = sqlx::mysql::MySqlPoolOptions::new()
				.max_connections(max_connections)
				.connect(database_url)
				.await
				.context("connect mysql")?;
			sqlx::migrate!("migrations/mysql")
				.run(&pool)
				.await
				.context("run mysql migrations")?;

			Ok(Self {
				backend: SqlBackend::Mysql(pool),
			})
		} else {
			Err(anyhow!("unsupported database_url (use sqlite:, postgres:, mysql:)"))
		}
	}

	pub fn backend_name(&self) -> &'static str {
		match &self.backend {
			SqlBackend::Sqlite(_) => "sqlite",
			SqlBackend::Postgres(_) => "postgres",
			SqlBackend::Mysql(_) => "mysql",
		}
	}
}

#[async_trait::async_trait]
impl OfflineStore for SqlOfflineStore {
	async fn append(&self, msg: &PendingMessage) -> anyhow::Result<()> {
		let message_id = msg.id.to_string();
		match &self.backend {
			SqlBackend::Sqlite(pool) => {
				sqlx::query(
					"INSERT OR IGNORE INTO offline_messages \
					(message_id, target_user, source_user, content, origin, attempts, created_at_ms) \
					SELECT ?, ?, ?, ?, ?, 0, ? \
					WHERE NOT EXISTS (SELECT 1 FROM removed_messages WHERE message_id = ?)",
				)
				.bind(&message_id)
				.bind(msg.target.as_str())
				.bind(msg.source.as_str())
				.bind(&msg.content)
				.bind(msg.origin.as_deref())
				.bind(msg.created_at_unix_ms)
				.bind(&message_id)
				.execute(pool)
				.await
				.context("insert offline message (sqlite)")?;
			}
			SqlBackend::Postgres(pool) => {
				sqlx::query(
					"INSERT INTO offline_messages \
					(message_id, target_user, source_user, content, origin, attempts, created_at_ms) \
					SELECT $1, $2, $3, $4, $5, 0, $6 \
					WHERE NOT EXISTS (SELECT 1 FROM removed_messages WHERE message_id = $1) \
					ON CONFLICT (message_id) DO NOTHING",
				)
				.bind(&message_id)
				.bind(msg.target.as_str())
				.bind(msg.source.as_str())
				.bind(&msg.content)
				.bind(msg.origin.as_deref())
				.bind(msg.created_at_unix_ms)
				.execute(pool)
				.await
				.context("insert offline message (postgres)")?;
			}
			SqlBackend::Mysql(pool) => {
				sqlx::query(
					"INSERT IGNORE INTO offline_messages \
					(message_id, target_user, source_user, content, origin, attempts, created_at_ms) \
					SELECT ?, ?, ?, ?, ?, 0, ? FROM DUAL \
					WHERE NOT EXISTS (SELECT 1 FROM removed_messages WHERE message_id = ?)",
				)
				.bind(&message_id)
				.bind(msg.target.as_str())
				.bind(msg.source.as_str())
				.bind(&msg.content)
				.bind(msg.origin.as_deref())
				.bind(msg.created_at_unix_ms)
				.bind(&message_id)
				.execute(pool)
				.await
				.context("insert offline message (mysql)")?;
			}
		}
		Ok(())
	}

	async fn peek_one_for(&self, identity: &Identity) -> anyhow::Result<Option<StoredMessage>> {
		let row: Option<Row> = match &self.backend {
			SqlBackend::Sqlite(pool) => sqlx::query_as(PEEK_QUERY)
				.bind(identity.as_str())
				.fetch_optional(pool)
				.await
				.context("peek offline message (sqlite)")?,
			SqlBackend::Postgres(pool) => {
				// attempts is INTEGER (int4) in postgres.
				let row: Option<(i64, String, String, String, String, Option<String>, i32, i64)> =
					sqlx::query_as(PEEK_QUERY_PG)
						.bind(identity.as_str())
						.fetch_optional(pool)
						.await
						.context("peek offline message (postgres)")?;
				row.map(|(seq, id, src, tgt, content, origin, attempts, created)| {
					(seq, id, src, tgt, content, origin, attempts as i64, created)
				})
			}
			SqlBackend::Mysql(pool) => {
				let row: Option<(i64, String, String, String, String, Option<String>, i32, i64)> =
					sqlx::query_as(PEEK_QUERY)
						.bind(identity.as_str())
						.fetch_optional(pool)
						.await
						.context("peek offline message (mysql)")?;
				row.map(|(seq, id, src, tgt, content, origin, attempts, created)| {
					(seq, id, src, tgt, content, origin, attempts as i64, created)
				})
			}
		};

		row.map(row_to_stored).transpose()
	}

	async fn remove(&self, identity: &Identity, message_id: &MessageId) -> anyhow::Result<bool> {
		let message_id = message_id.to_string();
		let now = unix_ms_now();
		match &self.backend {
			SqlBackend::Sqlite(pool) => {
				let mut tx = pool.begin().await.context("begin sqlite tx")?;
				let deleted = sqlx::query("DELETE FROM offline_messages WHERE target_user = ? AND message_id = ?")
					.bind(identity.as_str())
					.bind(&message_id)
					.execute(&mut *tx)
					.await
					.context("delete offline message (sqlite)")?
					.rows_affected();
				sqlx::query("INSERT OR REPLACE INTO removed_messages (message_id, removed_at_ms) VALUES (?, ?)")
					.bind(&message_id)
					.bind(now)
					.execute(&mut *tx)
					.await
					.context("mark removed (sqlite)")?;
				tx.commit().await.context("commit sqlite tx")?;
				Ok(deleted > 0)
			}
			SqlBackend::Postgres(pool) => {
				let mut tx = pool.begin().await.context("begin postgres tx")?;
				let deleted = sqlx::query("DELETE FROM offline_messages WHERE target_user = $1 AND message_id = $2")
					.bind(identity.as_str())
					.bind(&message_id)
					.execute(&mut *tx)
					.await
					.context("delete offline message (postgres)")?
					.rows_affected();
				sqlx::query(
					"INSERT INTO removed_messages (message_id, removed_at_ms) VALUES ($1, $2) \
					ON CONFLICT (message_id) DO UPDATE SET removed_at_ms = EXCLUDED.removed_at_ms",
				)
				.bind(&message_id)
				.bind(now)
				.execute(&mut *tx)
				.await
				.context("mark removed (postgres)")?;
				tx.commit().await.context("commit postgres tx")?;
				Ok(deleted > 0)
			}
			SqlBackend::Mysql(pool) => {
				let mut tx = pool.begin().await.context("begin mysql tx")?;
				let deleted = sqlx::query("DELETE FROM offline_messages WHERE target_user = ? AND message_id = ?")
					.bind(identity.as_str())
					.bind(&message_id)
					.execute(&mut *tx)
					.await
					.context("delete offline message (mysql)")?
					.rows_affected();
				sqlx::query(
					"INSERT INTO removed_messages (message_id, removed_at_ms) VALUES (?, ?) \
					ON DUPLICATE KEY UPDATE removed_at_ms = VALUES(removed_at_ms)",
				)
				.bind(&message_id)
				.bind(now)
				.execute(&mut *tx)
				.await
				.context("mark removed (mysql)")?;
				tx.commit().await.context("commit mysql tx")?;
				Ok(deleted > 0)
			}
		}
	}

	async fn record_failed_attempt(&self, identity: &Identity, message_id: &MessageId) -> anyhow::Result<()> {
		let message_id = message_id.to_string();
		match &self.backend {
			SqlBackend::Sqlite(pool) => {
				sqlx::query(
					"UPDATE offline_messages SET attempts = attempts + 1 WHERE target_user = ? AND message_id = ?",
				)
				.bind(identity.as_str())
				.bind(&message_id)
				.execute(pool)
				.await
				.context("bump attempts (sqlite)")?;
			}
			SqlBackend::Postgres(pool) => {
				sqlx::query(
					"UPDATE offline_messages SET attempts = attempts + 1 WHERE target_user = $1 AND message_id = $2",
				)
				.bind(identity.as_str())
				.bind(&message_id)
				.execute(pool)
				.await
				.context("bump attempts (postgres)")?;
			}
			SqlBackend::Mysql(pool) => {
				sqlx::query(
					"UPDATE offline_messages SET attempts = attempts + 1 WHERE target_user = ? AND message_id = ?",
				)
				.bind(identity.as_str())
				.bind(&message_id)
				.execute(pool)
				.await
				.context("bump attempts (mysql)")?;
			}
		}
		Ok(())
	}

	async fn pending_count(&self, identity: &Identity) -> anyhow::Result<usize> {
		let (count,): (i64,) = match &self.backend {
			SqlBackend::Sqlite(pool) => sqlx::query_as("SELECT COUNT(*) FROM offline_messages WHERE target_user = ?")
				.bind(identity.as_str())
				.fetch_one(pool)
				.await
				.context("count offline messages (sqlite)")?,
			SqlBackend::Postgres(pool) => sqlx::query_as("SELECT COUNT(*) FROM offline_messages WHERE target_user = $1")
				.bind(identity.as_str())
				.fetch_one(pool)
				.await
				.context("count offline messages (postgres)")?,
			SqlBackend::Mysql(pool) => sqlx::query_as("SELECT COUNT(*) FROM offline_messages WHERE target_user = ?")
				.bind(identity.as_str())
				.fetch_one(pool)
				.await
				.context("count offline messages (mysql)")?,
		};
		Ok(count.max(0) as usize)
	}

	async fn prune_removed(&self, before_unix_ms: i64) -> anyhow::Result<u64> {
		let res = match &self.backend {
			SqlBackend::Sqlite(pool) => sqlx::query("DELETE FROM removed_messages WHERE removed_at_ms < ?")
				.bind(before_unix_ms)
				.execute(pool)
				.await
				.context("prune removal markers (sqlite)")?
				.rows_affected(),
			SqlBackend::Postgres(pool) => sqlx::query("DELETE FROM removed_messages WHERE removed_at_ms < $1")
				.bind(before_unix_ms)
				.execute(pool)
				.await
				.context("prune removal markers (postgres)")?
				.rows_affected(),
			SqlBackend::Mysql(pool) => sqlx::query("DELETE FROM removed_messages WHERE removed_at_ms < ?")
				.bind(before_unix_ms)
				.execute(pool)
				.await
				.context("prune removal markers (mysql)")?
				.rows_affected(),
		};
		Ok(res)
	}
}
