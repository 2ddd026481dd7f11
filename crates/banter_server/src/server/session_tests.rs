#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use banter_domain::{MessageId, RoomId, UserId, Username};
use banter_protocol::{Event, EventPayload, MessageReceived, decode_event_default};
use chrono::{TimeZone, Utc};
use tokio::sync::mpsc;
use tokio::time::timeout;

use crate::server::hub::{Hub, HubConfig};
use crate::server::registry::RoomRegistry;
use crate::server::session::{Client, Enqueue, SessionSettings, run_reader, run_writer};
use crate::server::store::{InMemoryMessageStore, MessageStore};
use crate::server::transport::duplex::{DuplexEnd, pair};
use crate::server::transport::{Frame, FrameReader, FrameWriter};

fn room(id: &str) -> RoomId {
	RoomId::new(id.to_string()).expect("valid RoomId")
}

fn mk_client(room_id: &RoomId, capacity: usize) -> (Client, mpsc::Receiver<Event>) {
	Client::new(
		room_id.clone(),
		UserId::new("u1").expect("valid UserId"),
		Username::new("alice").expect("valid Username"),
		capacity,
	)
}

fn mk_message(room_id: &RoomId, n: u32) -> Event {
	Event::new(
		room_id.clone(),
		EventPayload::MessageReceived(MessageReceived {
			id: MessageId::new_v4(),
			content: format!("m{n}"),
			user_id: UserId::new("u1").expect("valid UserId"),
			username: Username::new("alice").expect("valid Username"),
			timestamp: Utc.timestamp_millis_opt(1_700_000_000_000).single().expect("valid ts"),
		}),
	)
}

struct ReaderFixture {
	hub: Hub,
	registry: Arc<RoomRegistry>,
	store: Arc<InMemoryMessageStore>,
	client: Client,
	client_rx: mpsc::Receiver<Event>,
	peer: DuplexEnd,
}

/// Register a client, then run its reader pump against one end of an
/// in-memory transport.
async fn reader_fixture(settings: SessionSettings) -> ReaderFixture {
	let rid = room("r");
	let registry = Arc::new(RoomRegistry::new(1000));
	let store = Arc::new(InMemoryMessageStore::default());
	let hub = Hub::start(
		Arc::clone(&registry),
		Arc::clone(&store) as Arc<dyn MessageStore>,
		HubConfig::default(),
	);

	let (client, client_rx) = mk_client(&rid, settings.outbound_capacity);
	hub.register(client.clone()).await;
	timeout(Duration::from_secs(1), async {
		loop {
			if registry.get(&rid).map(|r| r.client_count()).unwrap_or(0) == 1 {
				return;
			}
			tokio::time::sleep(Duration::from_millis(5)).await;
		}
	})
	.await
	.expect("client registered within timeout");

	let (server_end, peer) = pair(32);
	tokio::spawn(run_reader(
		client.clone(),
		server_end.reader,
		hub.handle(),
		Arc::clone(&store) as Arc<dyn MessageStore>,
		settings,
	));

	ReaderFixture {
		hub,
		registry,
		store,
		client,
		client_rx,
		peer,
	}
}

async fn recv(rx: &mut mpsc::Receiver<Event>) -> Event {
	timeout(Duration::from_millis(500), rx.recv())
		.await
		.expect("expected event within timeout")
		.expect("channel open")
}

async fn next_frame(end: &mut DuplexEnd) -> Frame {
	timeout(Duration::from_millis(500), end.reader.next_frame())
		.await
		.expect("expected frame within timeout")
		.expect("transport ok")
		.expect("transport open")
}

#[tokio::test]
async fn reader_turns_frames_into_room_broadcasts() {
	let mut fx = reader_fixture(SessionSettings::default()).await;

	fx.peer.writer.send_text("hello there".to_string()).await.expect("send");

	let event = recv(&mut fx.client_rx).await;
	match &event.payload {
		EventPayload::MessageReceived(m) => {
			assert_eq!(m.content, "hello there");
			assert_eq!(m.user_id.as_str(), "u1");
			assert_eq!(m.username.as_str(), "alice");
		}
		other => panic!("expected message.received, got: {other:?}"),
	}

	// The frame was persisted before broadcast.
	assert_eq!(fx.store.count(fx.client.room_id()).await.expect("count"), 1);
}

#[tokio::test]
async fn reader_skips_oversized_and_blank_frames() {
	let settings = SessionSettings {
		max_frame_bytes: 16,
		..SessionSettings::default()
	};
	let mut fx = reader_fixture(settings).await;

	fx.peer.writer.send_text("x".repeat(64)).await.expect("send oversized");
	fx.peer.writer.send_text("   ".to_string()).await.expect("send blank");
	fx.peer.writer.send_text("ok".to_string()).await.expect("send ok");

	let event = recv(&mut fx.client_rx).await;
	match &event.payload {
		EventPayload::MessageReceived(m) => assert_eq!(m.content, "ok"),
		other => panic!("expected message.received, got: {other:?}"),
	}

	assert_eq!(fx.store.count(fx.client.room_id()).await.expect("count"), 1);
}

#[tokio::test]
async fn reader_eof_unregisters_the_client() {
	let fx = reader_fixture(SessionSettings::default()).await;
	let rid = fx.client.room_id().clone();

	drop(fx.peer);

	timeout(Duration::from_secs(1), async {
		loop {
			if fx.registry.get(&rid).is_none() {
				return;
			}
			tokio::time::sleep(Duration::from_millis(5)).await;
		}
	})
	.await
	.expect("room removed after reader EOF");
	assert!(fx.client.is_closed());
	drop(fx.hub);
}

#[tokio::test]
async fn reader_gives_up_after_the_idle_deadline() {
	let settings = SessionSettings {
		read_idle_deadline: Duration::from_millis(50),
		..SessionSettings::default()
	};
	let fx = reader_fixture(settings).await;
	let rid = fx.client.room_id().clone();

	// No frames at all; the idle deadline must end the session.
	timeout(Duration::from_secs(1), async {
		loop {
			if fx.registry.get(&rid).is_none() {
				return;
			}
			tokio::time::sleep(Duration::from_millis(5)).await;
		}
	})
	.await
	.expect("idle session torn down");
}

#[tokio::test]
async fn writer_serializes_events_and_emits_pings() {
	let rid = room("r");
	let settings = SessionSettings {
		ping_interval: Duration::from_millis(20),
		..SessionSettings::default()
	};
	let (client, outbound_rx) = mk_client(&rid, 8);

	let (server_end, mut peer) = pair(32);
	tokio::spawn(run_writer(client.clone(), outbound_rx, server_end.writer, settings));

	let event = mk_message(&rid, 1);
	assert_eq!(client.try_enqueue(event.clone()), Enqueue::Queued);

	let mut saw_text = false;
	let mut saw_ping = false;
	for _ in 0..8 {
		match next_frame(&mut peer).await {
			Frame::Text(text) => {
				assert_eq!(decode_event_default(&text).expect("decodable frame"), event);
				saw_text = true;
			}
			Frame::Ping => saw_ping = true,
			other => panic!("unexpected frame: {other:?}"),
		}
		if saw_text && saw_ping {
			break;
		}
	}
	assert!(saw_text && saw_ping);

	client.close();
}

#[tokio::test]
async fn writer_drains_queued_events_on_close() {
	let rid = room("r");
	let (client, outbound_rx) = mk_client(&rid, 8);

	for n in 1..=3 {
		assert_eq!(client.try_enqueue(mk_message(&rid, n)), Enqueue::Queued);
	}
	client.close();

	// Started after close: the writer must still flush the queue
	// before shutting the transport.
	let (server_end, mut peer) = pair(32);
	let writer_task = tokio::spawn(run_writer(
		client.clone(),
		outbound_rx,
		server_end.writer,
		SessionSettings::default(),
	));

	for n in 1..=3 {
		match next_frame(&mut peer).await {
			Frame::Text(text) => {
				let event = decode_event_default(&text).expect("decodable frame");
				match event.payload {
					EventPayload::MessageReceived(m) => assert_eq!(m.content, format!("m{n}")),
					other => panic!("expected message.received, got: {other:?}"),
				}
			}
			other => panic!("unexpected frame: {other:?}"),
		}
	}
	assert_eq!(next_frame(&mut peer).await, Frame::Close);

	timeout(Duration::from_secs(1), writer_task).await.expect("writer exits").expect("writer ok");
}

#[tokio::test]
async fn concurrent_close_is_safe_with_both_pumps_running() {
	let fx = reader_fixture(SessionSettings::default()).await;
	let ReaderFixture {
		hub: _hub,
		registry,
		store: _store,
		client,
		client_rx,
		peer: _peer,
	} = fx;
	let rid = client.room_id().clone();

	// The writer drains the client's real outbound queue over its own
	// transport.
	let (writer_end, mut peer_for_writer) = pair(32);
	let writer_task = tokio::spawn(run_writer(
		client.clone(),
		client_rx,
		writer_end.writer,
		SessionSettings::default(),
	));

	let c1 = {
		let client = client.clone();
		tokio::spawn(async move { client.close() })
	};
	let c2 = {
		let client = client.clone();
		tokio::spawn(async move { client.close() })
	};

	let first = c1.await.expect("close ok");
	let second = c2.await.expect("close ok");
	assert!(first ^ second, "exactly one close performs the transition");

	// Writer observes the close and shuts the transport.
	timeout(Duration::from_secs(1), async {
		loop {
			match peer_for_writer.reader.next_frame().await.expect("transport ok") {
				Some(Frame::Close) | None => return,
				Some(_) => {}
			}
		}
	})
	.await
	.expect("writer closed the transport");

	timeout(Duration::from_secs(1), writer_task).await.expect("writer exits").expect("writer ok");

	// Reader observes the close and unregisters.
	timeout(Duration::from_secs(1), async {
		loop {
			if registry.get(&rid).is_none() {
				return;
			}
			tokio::time::sleep(Duration::from_millis(5)).await;
		}
	})
	.await
	.expect("reader unregistered after close");

	assert!(!client.close(), "close stays a no-op afterwards");
}

#[tokio::test]
async fn gated_live_events_queue_behind_the_replay_prefix() {
	let rid = room("r");
	let (client, mut outbound_rx) = mk_client(&rid, 8);

	client.gate_for_replay();

	// Live fan-out while gated is buffered, not enqueued.
	assert_eq!(client.try_enqueue(mk_message(&rid, 2)), Enqueue::Queued);
	assert!(outbound_rx.try_recv().is_err());

	// The replay path bypasses the gate.
	client.enqueue(mk_message(&rid, 1)).await.expect("replay enqueue");

	client.finish_replay();
	assert_eq!(client.try_enqueue(mk_message(&rid, 3)), Enqueue::Queued);

	for n in 1..=3 {
		let event = timeout(Duration::from_millis(500), outbound_rx.recv())
			.await
			.expect("event within timeout")
			.expect("queue open");
		match event.payload {
			EventPayload::MessageReceived(m) => assert_eq!(m.content, format!("m{n}")),
			other => panic!("expected message.received, got: {other:?}"),
		}
	}
}

#[tokio::test]
async fn enqueue_after_close_is_discarded() {
	let rid = room("r");
	let (client, mut outbound_rx) = mk_client(&rid, 8);

	assert_eq!(client.try_enqueue(mk_message(&rid, 1)), Enqueue::Queued);
	client.close();
	assert_eq!(client.try_enqueue(mk_message(&rid, 2)), Enqueue::Closed);

	// Only the pre-close event is in the queue.
	assert!(outbound_rx.try_recv().is_ok());
	assert!(outbound_rx.try_recv().is_err());
}
