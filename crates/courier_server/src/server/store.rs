#![forbid(unsafe_code)]

use std::collections::{BTreeSet, HashMap, HashSet};
use std::str::FromStr;

use anyhow::{Context, anyhow};
use courier_domain::{MessageId, StoredMessage, Tag, UserId, unix_secs_now};
use sqlx::{Postgres, QueryBuilder, Sqlite};
use tokio::sync::Mutex;

/// Persistence contract for messages, delivery records and tag membership.
#[async_trait::async_trait]
pub trait MessageStore: Send + Sync {
	/// Persist a message body once. Returns its creation time (unix seconds).
	async fn save_message(&self, id: &MessageId, data: &str) -> anyhow::Result<i64>;

	/// Create an unacknowledged delivery record for `(message, user)`.
	async fn save_delivery(&self, message_id: &MessageId, user: &UserId) -> anyhow::Result<()>;

	/// Ids of unacknowledged deliveries for `user`, oldest first.
	async fn unacked_message_ids(&self, user: &UserId) -> anyhow::Result<Vec<MessageId>>;

	/// Message bodies for `ids`, oldest first. Unknown ids are skipped.
	async fn fetch_messages(&self, ids: &[MessageId]) -> anyhow::Result<Vec<StoredMessage>>;

	/// Mark `(user, id)` deliveries acknowledged. Returns the number of records changed.
	async fn acknowledge(&self, user: &UserId, ids: &[MessageId]) -> anyhow::Result<u64>;

	/// Users tagged with any of `tags`, each at most once.
	async fn users_by_tags(&self, tags: &[Tag]) -> anyhow::Result<Vec<UserId>>;

	/// Attach tags to `user`; pairs that already exist are left alone.
	async fn add_tags(&self, user: &UserId, tags: &[Tag]) -> anyhow::Result<()>;

	/// Detach tags from `user`.
	async fn remove_tags(&self, user: &UserId, tags: &[Tag]) -> anyhow::Result<()>;
}

#[derive(Debug)]
struct DeliveryRow {
	message_id: MessageId,
	user: UserId,
	ack: bool,
}

#[derive(Debug, Default)]
struct MemoryState {
	// message id -> (body, insertion sequence)
	messages: HashMap<MessageId, (StoredMessage, u64)>,
	// insertion order is creation order
	deliveries: Vec<DeliveryRow>,
	tags: HashMap<UserId, HashSet<Tag>>,
	seq: u64,
}

/// Process-local store used when no database is configured and in tests.
#[derive(Default)]
pub struct InMemoryStore {
	inner: Mutex<MemoryState>,
}

impl InMemoryStore {
	pub fn new() -> Self {
		Self::default()
	}

	/// Acknowledgement state of one delivery record, if it exists.
	pub async fn delivery_acked(&self, message_id: &MessageId, user: &UserId) -> Option<bool> {
		let guard = self.inner.lock().await;
		guard
			.deliveries
			.iter()
			.find(|d| &d.message_id == message_id && &d.user == user)
			.map(|d| d.ack)
	}

	pub async fn delivery_count(&self) -> usize {
		self.inner.lock().await.deliveries.len()
	}

	pub async fn message_count(&self) -> usize {
		self.inner.lock().await.messages.len()
	}
}

#[async_trait::async_trait]
impl MessageStore for InMemoryStore {
	async fn save_message(&self, id: &MessageId, data: &str) -> anyhow::Result<i64> {
		let mut guard = self.inner.lock().await;
		if let Some((existing, _)) = guard.messages.get(id) {
			return Ok(existing.created_at);
		}

		guard.seq += 1;
		let seq = guard.seq;
		let created_at = unix_secs_now();
		guard.messages.insert(
			id.clone(),
			(
				StoredMessage {
					id: id.clone(),
					data: data.to_string(),
					created_at,
				},
				seq,
			),
		);
		Ok(created_at)
	}

	async fn save_delivery(&self, message_id: &MessageId, user: &UserId) -> anyhow::Result<()> {
		let mut guard = self.inner.lock().await;
		guard.deliveries.push(DeliveryRow {
			message_id: message_id.clone(),
			user: user.clone(),
			ack: false,
		});
		Ok(())
	}

	async fn unacked_message_ids(&self, user: &UserId) -> anyhow::Result<Vec<MessageId>> {
		let guard = self.inner.lock().await;
		Ok(guard
			.deliveries
			.iter()
			.filter(|d| &d.user == user && !d.ack)
			.map(|d| d.message_id.clone())
			.collect())
	}

	async fn fetch_messages(&self, ids: &[MessageId]) -> anyhow::Result<Vec<StoredMessage>> {
		let guard = self.inner.lock().await;
		let wanted: HashSet<&MessageId> = ids.iter().collect();
		let mut found = wanted
			.into_iter()
			.filter_map(|id| guard.messages.get(id))
			.collect::<Vec<_>>();
		found.sort_by_key(|(m, seq)| (m.created_at, *seq));
		Ok(found.into_iter().map(|(m, _)| m.clone()).collect())
	}

	async fn acknowledge(&self, user: &UserId, ids: &[MessageId]) -> anyhow::Result<u64> {
		let mut guard = self.inner.lock().await;
		let wanted: HashSet<&MessageId> = ids.iter().collect();
		let mut changed = 0u64;
		for d in guard.deliveries.iter_mut() {
			if &d.user == user && !d.ack && wanted.contains(&d.message_id) {
				d.ack = true;
				changed += 1;
			}
		}
		Ok(changed)
	}

	async fn users_by_tags(&self, tags: &[Tag]) -> anyhow::Result<Vec<UserId>> {
		if tags.is_empty() {
			return Ok(Vec::new());
		}
		let guard = self.inner.lock().await;
		let users = guard
			.tags
			.iter()
			.filter(|(_, user_tags)| tags.iter().any(|t| user_tags.contains(t)))
			.map(|(user, _)| user.clone())
			.collect::<BTreeSet<_>>();
		Ok(users.into_iter().collect())
	}

	async fn add_tags(&self, user: &UserId, tags: &[Tag]) -> anyhow::Result<()> {
		let mut guard = self.inner.lock().await;
		guard.tags.entry(user.clone()).or_default().extend(tags.iter().cloned());
		Ok(())
	}

	async fn remove_tags(&self, user: &UserId, tags: &[Tag]) -> anyhow::Result<()> {
		let mut guard = self.inner.lock().await;
		if let Some(user_tags) = guard.tags.get_mut(user) {
			for t in tags {
				user_tags.remove(t);
			}
			if user_tags.is_empty() {
				guard.tags.remove(user);
			}
		}
		Ok(())
	}
}

/// sqlx-backed store (SQLite or Postgres).
#[derive(Clone)]
pub struct SqlStore {
	backend: SqlBackend,
}

#[derive(Clone)]
enum SqlBackend {
	Sqlite(sqlx::SqlitePool),
	Postgres(sqlx::PgPool),
}

type MessageRow = (String, String, i64);

fn into_stored(rows: Vec<MessageRow>) -> Vec<StoredMessage> {
	rows.into_iter()
		.filter_map(|(id, data, created_at)| {
			Some(StoredMessage {
				id: MessageId::new(id).ok()?,
				data,
				created_at,
			})
		})
		.collect()
}

fn into_ids<T: FromStr>(rows: Vec<(String,)>) -> Vec<T> {
	rows.into_iter().filter_map(|(s,)| s.parse::<T>().ok()).collect()
}

impl SqlStore {
	pub async fn connect(database_url: &str, max_connections: u32) -> anyhow::Result<Self> {
		let max_connections = max_connections.max(1);

		if database_url.starts_with("sqlite:") {
			let opts = sqlx::sqlite::SqliteConnectOptions::from_str(database_url)
				.context("parse sqlite url")?
				.create_if_missing(true);
			// An in-memory database exists per connection.
			let max_connections = if database_url.contains(":memory:") {
				1
			} else {
				max_connections
			};
			let pool = sqlx::sqlite::SqlitePoolOptions::new()
				.max_connections(max_connections)
				.connect_with(opts)
				.await
				.context("connect sqlite")?;
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
		} else {
			Err(anyhow!("unsupported database_url (use sqlite: or postgres:)"))
		}
	}
}

#[async_trait::async_trait]
impl MessageStore for SqlStore {
	async fn save_message(&self, id: &MessageId, data: &str) -> anyhow::Result<i64> {
		let now = unix_secs_now();
		match &self.backend {
			SqlBackend::Sqlite(pool) => {
				sqlx::query(
					"INSERT INTO messages (message_id, data, created_at) VALUES (?, ?, ?) \
					ON CONFLICT(message_id) DO NOTHING",
				)
				.bind(id.as_str())
				.bind(data)
				.bind(now)
				.execute(pool)
				.await
				.context("insert message (sqlite)")?;

				let (created_at,): (i64,) = sqlx::query_as("SELECT created_at FROM messages WHERE message_id = ?")
					.bind(id.as_str())
					.fetch_one(pool)
					.await
					.context("select message created_at (sqlite)")?;
				Ok(created_at)
			}
			SqlBackend::Postgres(pool) => {
				sqlx::query(
					"INSERT INTO messages (message_id, data, created_at) VALUES ($1, $2, $3) \
					ON CONFLICT (message_id) DO NOTHING",
				)
				.bind(id.as_str())
				.bind(data)
				.bind(now)
				.execute(pool)
				.await
				.context("insert message (postgres)")?;

				let (created_at,): (i64,) = sqlx::query_as("SELECT created_at FROM messages WHERE message_id = $1")
					.bind(id.as_str())
					.fetch_one(pool)
					.await
					.context("select message created_at (postgres)")?;
				Ok(created_at)
			}
		}
	}

	async fn save_delivery(&self, message_id: &MessageId, user: &UserId) -> anyhow::Result<()> {
		let now = unix_secs_now();
		match &self.backend {
			SqlBackend::Sqlite(pool) => {
				sqlx::query("INSERT INTO user_messages (message_id, user_id, ack, created_at) VALUES (?, ?, ?, ?)")
					.bind(message_id.as_str())
					.bind(user.as_str())
					.bind(false)
					.bind(now)
					.execute(pool)
					.await
					.context("insert user message (sqlite)")?;
			}
			SqlBackend::Postgres(pool) => {
				sqlx::query("INSERT INTO user_messages (message_id, user_id, ack, created_at) VALUES ($1, $2, $3, $4)")
					.bind(message_id.as_str())
					.bind(user.as_str())
					.bind(false)
					.bind(now)
					.execute(pool)
					.await
					.context("insert user message (postgres)")?;
			}
		}
		Ok(())
	}

	async fn unacked_message_ids(&self, user: &UserId) -> anyhow::Result<Vec<MessageId>> {
		let rows: Vec<(String,)> = match &self.backend {
			SqlBackend::Sqlite(pool) => sqlx::query_as(
				"SELECT message_id FROM user_messages WHERE user_id = ? AND ack = ? ORDER BY created_at ASC, id ASC",
			)
			.bind(user.as_str())
			.bind(false)
			.fetch_all(pool)
			.await
			.context("select unacked ids (sqlite)")?,
			SqlBackend::Postgres(pool) => sqlx::query_as(
				"SELECT message_id FROM user_messages WHERE user_id = $1 AND ack = $2 ORDER BY created_at ASC, id ASC",
			)
			.bind(user.as_str())
			.bind(false)
			.fetch_all(pool)
			.await
			.context("select unacked ids (postgres)")?,
		};
		Ok(into_ids(rows))
	}

	async fn fetch_messages(&self, ids: &[MessageId]) -> anyhow::Result<Vec<StoredMessage>> {
		if ids.is_empty() {
			return Ok(Vec::new());
		}

		const SELECT: &str = "SELECT message_id, data, created_at FROM messages WHERE message_id IN (";
		const ORDER: &str = ") ORDER BY created_at ASC, id ASC";

		let rows: Vec<MessageRow> = match &self.backend {
			SqlBackend::Sqlite(pool) => {
				let mut qb = QueryBuilder::<Sqlite>::new(SELECT);
				let mut list = qb.separated(", ");
				for id in ids {
					list.push_bind(id.as_str());
				}
				list.push_unseparated(ORDER);
				qb.build_query_as::<MessageRow>()
					.fetch_all(pool)
					.await
					.context("select messages (sqlite)")?
			}
			SqlBackend::Postgres(pool) => {
				let mut qb = QueryBuilder::<Postgres>::new(SELECT);
				let mut list = qb.separated(", ");
				for id in ids {
					list.push_bind(id.as_str());
				}
				list.push_unseparated(ORDER);
				qb.build_query_as::<MessageRow>()
					.fetch_all(pool)
					.await
					.context("select messages (postgres)")?
			}
		};
		Ok(into_stored(rows))
	}

	async fn acknowledge(&self, user: &UserId, ids: &[MessageId]) -> anyhow::Result<u64> {
		if ids.is_empty() {
			return Ok(0);
		}

		let affected = match &self.backend {
			SqlBackend::Sqlite(pool) => {
				let mut qb = QueryBuilder::<Sqlite>::new("UPDATE user_messages SET ack = ");
				qb.push_bind(true);
				qb.push(" WHERE user_id = ");
				qb.push_bind(user.as_str());
				qb.push(" AND message_id IN (");
				let mut list = qb.separated(", ");
				for id in ids {
					list.push_bind(id.as_str());
				}
				list.push_unseparated(")");
				qb.build()
					.execute(pool)
					.await
					.context("ack user messages (sqlite)")?
					.rows_affected()
			}
			SqlBackend::Postgres(pool) => {
				let mut qb = QueryBuilder::<Postgres>::new("UPDATE user_messages SET ack = ");
				qb.push_bind(true);
				qb.push(" WHERE user_id = ");
				qb.push_bind(user.as_str());
				qb.push(" AND message_id IN (");
				let mut list = qb.separated(", ");
				for id in ids {
					list.push_bind(id.as_str());
				}
				list.push_unseparated(")");
				qb.build()
					.execute(pool)
					.await
					.context("ack user messages (postgres)")?
					.rows_affected()
			}
		};
		Ok(affected)
	}

	async fn users_by_tags(&self, tags: &[Tag]) -> anyhow::Result<Vec<UserId>> {
		if tags.is_empty() {
			return Ok(Vec::new());
		}

		const SELECT: &str = "SELECT DISTINCT user_id FROM user_tags WHERE tag IN (";

		let rows: Vec<(String,)> = match &self.backend {
			SqlBackend::Sqlite(pool) => {
				let mut qb = QueryBuilder::<Sqlite>::new(SELECT);
				let mut list = qb.separated(", ");
				for t in tags {
					list.push_bind(t.as_str());
				}
				list.push_unseparated(") ORDER BY user_id");
				qb.build_query_as()
					.fetch_all(pool)
					.await
					.context("select tagged users (sqlite)")?
			}
			SqlBackend::Postgres(pool) => {
				let mut qb = QueryBuilder::<Postgres>::new(SELECT);
				let mut list = qb.separated(", ");
				for t in tags {
					list.push_bind(t.as_str());
				}
				list.push_unseparated(") ORDER BY user_id");
				qb.build_query_as()
					.fetch_all(pool)
					.await
					.context("select tagged users (postgres)")?
			}
		};
		Ok(into_ids(rows))
	}

	async fn add_tags(&self, user: &UserId, tags: &[Tag]) -> anyhow::Result<()> {
		let now = unix_secs_now();
		match &self.backend {
			SqlBackend::Sqlite(pool) => {
				for t in tags {
					sqlx::query(
						"INSERT INTO user_tags (user_id, tag, created_at) VALUES (?, ?, ?) \
						ON CONFLICT(user_id, tag) DO NOTHING",
					)
					.bind(user.as_str())
					.bind(t.as_str())
					.bind(now)
					.execute(pool)
					.await
					.context("insert user tag (sqlite)")?;
				}
			}
			SqlBackend::Postgres(pool) => {
				for t in tags {
					sqlx::query(
						"INSERT INTO user_tags (user_id, tag, created_at) VALUES ($1, $2, $3) \
						ON CONFLICT (user_id, tag) DO NOTHING",
					)
					.bind(user.as_str())
					.bind(t.as_str())
					.bind(now)
					.execute(pool)
					.await
					.context("insert user tag (postgres)")?;
				}
			}
		}
		Ok(())
	}

	async fn remove_tags(&self, user: &UserId, tags: &[Tag]) -> anyhow::Result<()> {
		if tags.is_empty() {
			return Ok(());
		}

		match &self.backend {
			SqlBackend::Sqlite(pool) => {
				let mut qb = QueryBuilder::<Sqlite>::new("DELETE FROM user_tags WHERE user_id = ");
				qb.push_bind(user.as_str());
				qb.push(" AND tag IN (");
				let mut list = qb.separated(", ");
				for t in tags {
					list.push_bind(t.as_str());
				}
				list.push_unseparated(")");
				qb.build().execute(pool).await.context("delete user tags (sqlite)")?;
			}
			SqlBackend::Postgres(pool) => {
				let mut qb = QueryBuilder::<Postgres>::new("DELETE FROM user_tags WHERE user_id = ");
				qb.push_bind(user.as_str());
				qb.push(" AND tag IN (");
				let mut list = qb.separated(", ");
				for t in tags {
					list.push_bind(t.as_str());
				}
				list.push_unseparated(")");
				qb.build().execute(pool).await.context("delete user tags (postgres)")?;
			}
		}
		Ok(())
	}
}
