#![forbid(unsafe_code)]

use std::collections::{HashMap, VecDeque};

use anyhow::{Context as _, anyhow};
use banter_domain::{JoinCode, MessageId, RoomId, UserId, Username};
use banter_protocol::{Event, EventPayload, MessageReceived};
use chrono::{DateTime, TimeZone, Utc};
use tokio::sync::Mutex;

/// A chat message as kept by the message store.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredMessage {
	pub id: MessageId,
	pub room_id: RoomId,
	pub user_id: UserId,
	pub username: Username,
	pub content: String,
	pub timestamp: DateTime<Utc>,
}

impl StoredMessage {
	/// Wire form broadcast live and replayed to late joiners.
	pub fn to_event(&self) -> Event {
		Event::new(
			self.room_id.clone(),
			EventPayload::MessageReceived(MessageReceived {
				id: self.id,
				content: self.content.clone(),
				user_id: self.user_id.clone(),
				username: self.username.clone(),
				timestamp: self.timestamp,
			}),
		)
	}
}

/// Room membership entry as kept by the room store.
#[derive(Debug, Clone, PartialEq)]
pub struct RoomMember {
	pub user_id: UserId,
	pub username: Username,
	pub joined_at: DateTime<Utc>,
}

/// A room as kept by the room store.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRoom {
	pub id: RoomId,
	pub join_code: JoinCode,
	pub created_at: DateTime<Utc>,
	pub members: Vec<RoomMember>,
}

/// Message persistence contract. Backends are swappable; the core
/// only reads through `get_by_room` at registration time.
#[async_trait::async_trait]
pub trait MessageStore: Send + Sync {
	/// Up to `limit` most recent messages, ordered oldest to newest.
	async fn get_by_room(&self, room_id: &RoomId, limit: usize) -> anyhow::Result<Vec<StoredMessage>>;

	/// Up to `limit` messages newer than `after`, oldest to newest.
	async fn get_by_room_after(
		&self,
		room_id: &RoomId,
		after: DateTime<Utc>,
		limit: usize,
	) -> anyhow::Result<Vec<StoredMessage>>;

	async fn count(&self, room_id: &RoomId) -> anyhow::Result<usize>;

	async fn create(&self, message: StoredMessage) -> anyhow::Result<()>;

	async fn delete(&self, room_id: &RoomId, id: &MessageId) -> anyhow::Result<()>;
}

/// Room persistence contract, driven by the publish-side callers.
#[async_trait::async_trait]
pub trait RoomStore: Send + Sync {
	async fn get_by_id(&self, room_id: &RoomId) -> anyhow::Result<Option<StoredRoom>>;

	async fn create(&self, room: StoredRoom) -> anyhow::Result<()>;

	async fn add_member(&self, room_id: &RoomId, member: RoomMember) -> anyhow::Result<()>;

	async fn remove_member(&self, room_id: &RoomId, user_id: &UserId) -> anyhow::Result<()>;

	async fn delete(&self, room_id: &RoomId) -> anyhow::Result<()>;
}

/// Default bound on messages retained per room by the in-memory store.
pub const DEFAULT_IN_MEMORY_CAPACITY: usize = 2048;

/// Volatile message store.
pub struct InMemoryMessageStore {
	per_room_capacity: usize,
	inner: Mutex<HashMap<RoomId, VecDeque<StoredMessage>>>,
}

impl InMemoryMessageStore {
	pub fn new(per_room_capacity: usize) -> Self {
		Self {
			per_room_capacity,
			inner: Mutex::new(HashMap::new()),
		}
	}
}

impl Default for InMemoryMessageStore {
	fn default() -> Self {
		Self::new(DEFAULT_IN_MEMORY_CAPACITY)
	}
}

#[async_trait::async_trait]
impl MessageStore for InMemoryMessageStore {
	async fn get_by_room(&self, room_id: &RoomId, limit: usize) -> anyhow::Result<Vec<StoredMessage>> {
		let guard = self.inner.lock().await;
		let Some(messages) = guard.get(room_id) else {
			return Ok(Vec::new());
		};

		let skip = messages.len().saturating_sub(limit);
		Ok(messages.iter().skip(skip).cloned().collect())
	}

	async fn get_by_room_after(
		&self,
		room_id: &RoomId,
		after: DateTime<Utc>,
		limit: usize,
	) -> anyhow::Result<Vec<StoredMessage>> {
		let guard = self.inner.lock().await;
		let Some(messages) = guard.get(room_id) else {
			return Ok(Vec::new());
		};

		Ok(messages.iter().filter(|m| m.timestamp > after).take(limit).cloned().collect())
	}

	async fn count(&self, room_id: &RoomId) -> anyhow::Result<usize> {
		let guard = self.inner.lock().await;
		Ok(guard.get(room_id).map(|m| m.len()).unwrap_or(0))
	}

	async fn create(&self, message: StoredMessage) -> anyhow::Result<()> {
		let mut guard = self.inner.lock().await;
		let messages = guard.entry(message.room_id.clone()).or_default();
		messages.push_back(message);

		while messages.len() > self.per_room_capacity {
			messages.pop_front();
		}
		Ok(())
	}

	async fn delete(&self, room_id: &RoomId, id: &MessageId) -> anyhow::Result<()> {
		let mut guard = self.inner.lock().await;
		if let Some(messages) = guard.get_mut(room_id) {
			messages.retain(|m| m.id != *id);
		}
		Ok(())
	}
}

/// Volatile room store.
#[derive(Default)]
pub struct InMemoryRoomStore {
	inner: Mutex<HashMap<RoomId, StoredRoom>>,
}

#[async_trait::async_trait]
impl RoomStore for InMemoryRoomStore {
	async fn get_by_id(&self, room_id: &RoomId) -> anyhow::Result<Option<StoredRoom>> {
		let guard = self.inner.lock().await;
		Ok(guard.get(room_id).cloned())
	}

	async fn create(&self, room: StoredRoom) -> anyhow::Result<()> {
		let mut guard = self.inner.lock().await;
		if guard.contains_key(&room.id) {
			return Err(anyhow!("room already exists: {}", room.id));
		}
		guard.insert(room.id.clone(), room);
		Ok(())
	}

	async fn add_member(&self, room_id: &RoomId, member: RoomMember) -> anyhow::Result<()> {
		let mut guard = self.inner.lock().await;
		let room = guard.get_mut(room_id).ok_or_else(|| anyhow!("no such room: {room_id}"))?;

		// A rejoin replaces the previous entry for that user.
		room.members.retain(|m| m.user_id != member.user_id);
		room.members.push(member);
		Ok(())
	}

	async fn remove_member(&self, room_id: &RoomId, user_id: &UserId) -> anyhow::Result<()> {
		let mut guard = self.inner.lock().await;
		if let Some(room) = guard.get_mut(room_id) {
			room.members.retain(|m| m.user_id != *user_id);
		}
		Ok(())
	}

	async fn delete(&self, room_id: &RoomId) -> anyhow::Result<()> {
		let mut guard = self.inner.lock().await;
		guard.remove(room_id);
		Ok(())
	}
}

/// Durable message store backed by SQLite.
#[derive(Clone)]
pub struct SqliteMessageStore {
	pool: sqlx::SqlitePool,
}

impl SqliteMessageStore {
	pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
		let pool = sqlx::SqlitePool::connect(database_url).await.context("connect sqlite")?;
		sqlx::migrate!("migrations/sqlite")
			.run(&pool)
			.await
			.context("run sqlite migrations")?;

		Ok(Self { pool })
	}

	fn row_to_message(row: (String, String, String, String, String, i64)) -> anyhow::Result<StoredMessage> {
		let (id, room_id, user_id, username, content, created_at_ms) = row;
		Ok(StoredMessage {
			id: id.parse().context("parse message id")?,
			room_id: RoomId::new(room_id).context("parse room id")?,
			user_id: UserId::new(user_id).context("parse user id")?,
			username: Username::new(username).context("parse username")?,
			content,
			timestamp: Utc
				.timestamp_millis_opt(created_at_ms)
				.single()
				.ok_or_else(|| anyhow!("invalid created_at_ms: {created_at_ms}"))?,
		})
	}
}

#[async_trait::async_trait]
impl MessageStore for SqliteMessageStore {
	async fn get_by_room(&self, room_id: &RoomId, limit: usize) -> anyhow::Result<Vec<StoredMessage>> {
		let rows = sqlx::query_as::<_, (String, String, String, String, String, i64)>(
			"SELECT id, room_id, user_id, username, content, created_at_ms FROM messages \
			WHERE room_id = ? ORDER BY created_at_ms DESC, rowid DESC LIMIT ?",
		)
		.bind(room_id.as_str())
		.bind(limit as i64)
		.fetch_all(&self.pool)
		.await
		.context("select recent messages")?;

		let mut messages = rows
			.into_iter()
			.map(Self::row_to_message)
			.collect::<anyhow::Result<Vec<_>>>()?;
		messages.reverse();
		Ok(messages)
	}

	async fn get_by_room_after(
		&self,
		room_id: &RoomId,
		after: DateTime<Utc>,
		limit: usize,
	) -> anyhow::Result<Vec<StoredMessage>> {
		let rows = sqlx::query_as::<_, (String, String, String, String, String, i64)>(
			"SELECT id, room_id, user_id, username, content, created_at_ms FROM messages \
			WHERE room_id = ? AND created_at_ms > ? ORDER BY created_at_ms ASC, rowid ASC LIMIT ?",
		)
		.bind(room_id.as_str())
		.bind(after.timestamp_millis())
		.bind(limit as i64)
		.fetch_all(&self.pool)
		.await
		.context("select messages after timestamp")?;

		rows.into_iter().map(Self::row_to_message).collect()
	}

	async fn count(&self, room_id: &RoomId) -> anyhow::Result<usize> {
		let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM messages WHERE room_id = ?")
			.bind(room_id.as_str())
			.fetch_one(&self.pool)
			.await
			.context("count messages")?;
		Ok(count as usize)
	}

	async fn create(&self, message: StoredMessage) -> anyhow::Result<()> {
		sqlx::query(
			"INSERT INTO messages (id, room_id, user_id, username, content, created_at_ms) VALUES (?, ?, ?, ?, ?, ?)",
		)
		.bind(message.id.to_string())
		.bind(message.room_id.as_str())
		.bind(message.user_id.as_str())
		.bind(message.username.as_str())
		.bind(&message.content)
		.bind(message.timestamp.timestamp_millis())
		.execute(&self.pool)
		.await
		.context("insert message")?;
		Ok(())
	}

	async fn delete(&self, room_id: &RoomId, id: &MessageId) -> anyhow::Result<()> {
		sqlx::query("DELETE FROM messages WHERE room_id = ? AND id = ?")
			.bind(room_id.as_str())
			.bind(id.to_string())
			.execute(&self.pool)
			.await
			.context("delete message")?;
		Ok(())
	}
}
