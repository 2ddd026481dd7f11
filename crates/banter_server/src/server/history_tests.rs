#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use banter_domain::{MessageId, RoomId, UserId, Username};
use banter_protocol::{Event, EventPayload};
use chrono::{DateTime, TimeZone, Utc};
use tokio::sync::mpsc;
use tokio::time::timeout;

use crate::server::hub::{Hub, HubConfig};
use crate::server::registry::RoomRegistry;
use crate::server::session::Client;
use crate::server::store::{InMemoryMessageStore, MessageStore, StoredMessage};

fn room(id: &str) -> RoomId {
	RoomId::new(id.to_string()).expect("valid RoomId")
}

fn stored(room_id: &RoomId, n: u32) -> StoredMessage {
	StoredMessage {
		id: MessageId::new_v4(),
		room_id: room_id.clone(),
		user_id: UserId::new("u1").expect("valid UserId"),
		username: Username::new("alice").expect("valid Username"),
		content: format!("m{n}"),
		timestamp: Utc.timestamp_millis_opt(1_700_000_000_000 + i64::from(n)).single().expect("valid ts"),
	}
}

fn content_of(event: &Event) -> &str {
	match &event.payload {
		EventPayload::MessageReceived(m) => m.content.as_str(),
		other => panic!("expected message.received, got: {other:?}"),
	}
}

async fn recv(rx: &mut mpsc::Receiver<Event>) -> Event {
	timeout(Duration::from_millis(500), rx.recv())
		.await
		.expect("expected event within timeout")
		.expect("channel open")
}

async fn register_and_wait(hub: &Hub, registry: &RoomRegistry, client: Client) {
	let rid = client.room_id().clone();
	hub.register(client).await;
	timeout(Duration::from_secs(1), async {
		loop {
			if registry.get(&rid).map(|r| r.client_count()).unwrap_or(0) >= 1 {
				return;
			}
			tokio::time::sleep(Duration::from_millis(5)).await;
		}
	})
	.await
	.expect("client registered within timeout");
}

#[tokio::test]
async fn replays_at_most_the_limit_oldest_first_before_live_events() {
	let rid = room("r");
	let store = Arc::new(InMemoryMessageStore::default());
	for n in 1..=75 {
		store.create(stored(&rid, n)).await.expect("seed message");
	}

	let registry = Arc::new(RoomRegistry::new(1000));
	let cfg = HubConfig {
		history_replay_limit: 50,
		..HubConfig::default()
	};
	let hub = Hub::start(Arc::clone(&registry), Arc::clone(&store) as Arc<dyn MessageStore>, cfg);

	let (x, mut x_rx) = Client::new(
		rid.clone(),
		UserId::new("ux").expect("valid UserId"),
		Username::new("xavier").expect("valid Username"),
		64,
	);
	register_and_wait(&hub, &registry, x.clone()).await;

	// The 50 most recent seeded messages, oldest first.
	for n in 26..=75 {
		assert_eq!(content_of(&recv(&mut x_rx).await), format!("m{n}"));
	}

	// Live traffic only after the replay prefix.
	hub.broadcast(stored(&rid, 1000).to_event()).await;
	assert_eq!(content_of(&recv(&mut x_rx).await), "m1000");

	let extra = timeout(Duration::from_millis(50), x_rx.recv()).await;
	assert!(extra.is_err(), "no further events expected");
}

#[tokio::test]
async fn empty_room_replays_nothing() {
	let rid = room("r");
	let registry = Arc::new(RoomRegistry::new(1000));
	let hub = Hub::start(
		Arc::clone(&registry),
		Arc::new(InMemoryMessageStore::default()),
		HubConfig::default(),
	);

	let (x, mut x_rx) = Client::new(
		rid.clone(),
		UserId::new("ux").expect("valid UserId"),
		Username::new("xavier").expect("valid Username"),
		64,
	);
	register_and_wait(&hub, &registry, x.clone()).await;

	let got = timeout(Duration::from_millis(100), x_rx.recv()).await;
	assert!(got.is_err(), "no history expected for a fresh room");
}

struct DelayedStore {
	messages: Vec<StoredMessage>,
	delay: Duration,
}

#[async_trait::async_trait]
impl MessageStore for DelayedStore {
	async fn get_by_room(&self, _room_id: &RoomId, limit: usize) -> anyhow::Result<Vec<StoredMessage>> {
		tokio::time::sleep(self.delay).await;
		let skip = self.messages.len().saturating_sub(limit);
		Ok(self.messages[skip..].to_vec())
	}

	async fn get_by_room_after(
		&self,
		_room_id: &RoomId,
		_after: DateTime<Utc>,
		_limit: usize,
	) -> anyhow::Result<Vec<StoredMessage>> {
		Ok(Vec::new())
	}

	async fn count(&self, _room_id: &RoomId) -> anyhow::Result<usize> {
		Ok(self.messages.len())
	}

	async fn create(&self, _message: StoredMessage) -> anyhow::Result<()> {
		Ok(())
	}

	async fn delete(&self, _room_id: &RoomId, _id: &MessageId) -> anyhow::Result<()> {
		Ok(())
	}
}

#[tokio::test]
async fn live_events_racing_the_replay_arrive_after_it() {
	let rid = room("r");
	let store = Arc::new(DelayedStore {
		messages: (1..=3).map(|n| stored(&rid, n)).collect(),
		delay: Duration::from_millis(100),
	});

	let registry = Arc::new(RoomRegistry::new(1000));
	let hub = Hub::start(
		Arc::clone(&registry),
		Arc::clone(&store) as Arc<dyn MessageStore>,
		HubConfig::default(),
	);

	let (x, mut x_rx) = Client::new(
		rid.clone(),
		UserId::new("ux").expect("valid UserId"),
		Username::new("xavier").expect("valid Username"),
		64,
	);
	register_and_wait(&hub, &registry, x.clone()).await;

	// Fanned out while the loader is still fetching; must queue behind
	// the replay prefix, not ahead of it.
	hub.broadcast(stored(&rid, 1000).to_event()).await;

	for n in 1..=3 {
		assert_eq!(content_of(&recv(&mut x_rx).await), format!("m{n}"));
	}
	assert_eq!(content_of(&recv(&mut x_rx).await), "m1000");
}

struct FailingStore;

#[async_trait::async_trait]
impl MessageStore for FailingStore {
	async fn get_by_room(&self, _room_id: &RoomId, _limit: usize) -> anyhow::Result<Vec<StoredMessage>> {
		Err(anyhow!("store unavailable"))
	}

	async fn get_by_room_after(
		&self,
		_room_id: &RoomId,
		_after: DateTime<Utc>,
		_limit: usize,
	) -> anyhow::Result<Vec<StoredMessage>> {
		Err(anyhow!("store unavailable"))
	}

	async fn count(&self, _room_id: &RoomId) -> anyhow::Result<usize> {
		Err(anyhow!("store unavailable"))
	}

	async fn create(&self, _message: StoredMessage) -> anyhow::Result<()> {
		Err(anyhow!("store unavailable"))
	}

	async fn delete(&self, _room_id: &RoomId, _id: &MessageId) -> anyhow::Result<()> {
		Err(anyhow!("store unavailable"))
	}
}

#[tokio::test]
async fn store_failure_leaves_the_client_connected_without_history() {
	let rid = room("r");
	let registry = Arc::new(RoomRegistry::new(1000));
	let hub = Hub::start(Arc::clone(&registry), Arc::new(FailingStore), HubConfig::default());

	let (x, mut x_rx) = Client::new(
		rid.clone(),
		UserId::new("ux").expect("valid UserId"),
		Username::new("xavier").expect("valid Username"),
		64,
	);
	register_and_wait(&hub, &registry, x.clone()).await;

	hub.broadcast(stored(&rid, 7).to_event()).await;
	assert_eq!(content_of(&recv(&mut x_rx).await), "m7");
	assert!(!x.is_closed());
}

struct StalledStore;

#[async_trait::async_trait]
impl MessageStore for StalledStore {
	async fn get_by_room(&self, _room_id: &RoomId, _limit: usize) -> anyhow::Result<Vec<StoredMessage>> {
		tokio::time::sleep(Duration::from_secs(60)).await;
		Ok(Vec::new())
	}

	async fn get_by_room_after(
		&self,
		_room_id: &RoomId,
		_after: DateTime<Utc>,
		_limit: usize,
	) -> anyhow::Result<Vec<StoredMessage>> {
		Ok(Vec::new())
	}

	async fn count(&self, _room_id: &RoomId) -> anyhow::Result<usize> {
		Ok(0)
	}

	async fn create(&self, _message: StoredMessage) -> anyhow::Result<()> {
		Ok(())
	}

	async fn delete(&self, _room_id: &RoomId, _id: &MessageId) -> anyhow::Result<()> {
		Ok(())
	}
}

#[tokio::test]
async fn stalled_store_is_cut_off_by_the_load_timeout() {
	let rid = room("r");
	let registry = Arc::new(RoomRegistry::new(1000));
	let cfg = HubConfig {
		history_load_timeout: Duration::from_millis(50),
		..HubConfig::default()
	};
	let hub = Hub::start(Arc::clone(&registry), Arc::new(StalledStore), cfg);

	let (x, mut x_rx) = Client::new(
		rid.clone(),
		UserId::new("ux").expect("valid UserId"),
		Username::new("xavier").expect("valid Username"),
		64,
	);
	register_and_wait(&hub, &registry, x.clone()).await;

	// Live traffic flows while (and after) the load is abandoned.
	hub.broadcast(stored(&rid, 9).to_event()).await;
	assert_eq!(content_of(&recv(&mut x_rx).await), "m9");

	tokio::time::sleep(Duration::from_millis(100)).await;
	assert!(!x.is_closed());
}

#[tokio::test]
async fn client_close_aborts_the_replay() {
	let rid = room("r");
	let store = Arc::new(InMemoryMessageStore::default());
	for n in 1..=20 {
		store.create(stored(&rid, n)).await.expect("seed message");
	}

	let registry = Arc::new(RoomRegistry::new(1000));
	let cfg = HubConfig {
		history_replay_limit: 20,
		history_load_timeout: Duration::from_secs(5),
		..HubConfig::default()
	};
	let hub = Hub::start(Arc::clone(&registry), Arc::clone(&store) as Arc<dyn MessageStore>, cfg);

	// Capacity 1 and an undrained queue: the loader parks on the
	// second enqueue until the client closes.
	let (x, x_rx) = Client::new(
		rid.clone(),
		UserId::new("ux").expect("valid UserId"),
		Username::new("xavier").expect("valid Username"),
		1,
	);
	register_and_wait(&hub, &registry, x.clone()).await;

	tokio::time::sleep(Duration::from_millis(50)).await;
	x.close();

	// The loader observes the close and gives up; the queue never
	// grew beyond its capacity.
	tokio::time::sleep(Duration::from_millis(50)).await;
	let mut x_rx = x_rx;
	let mut held = 0;
	while x_rx.try_recv().is_ok() {
		held += 1;
	}
	assert!(held <= 1, "replay continued after close: {held} events");
}
