#![forbid(unsafe_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use anyhow::anyhow;
use banter_domain::{ClientId, MessageId, RoomId, UserId, Username};
use banter_protocol::{DEFAULT_MAX_FRAME_SIZE, Event, encode_event};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior, timeout};
use tracing::{debug, warn};

use crate::server::hub::HubHandle;
use crate::server::store::{MessageStore, StoredMessage};
use crate::server::transport::{Frame, FrameReader, FrameWriter};

/// Default per-client outbound queue capacity.
pub const DEFAULT_OUTBOUND_CAPACITY: usize = 64;

/// Per-connection timing and size limits.
#[derive(Debug, Clone)]
pub struct SessionSettings {
	/// Per-client outbound queue capacity.
	pub outbound_capacity: usize,

	/// Maximum size of a single frame, both directions.
	pub max_frame_bytes: usize,

	/// Idle deadline on the read side, re-armed by any inbound frame.
	pub read_idle_deadline: Duration,

	/// Deadline applied to each individual transport write.
	pub write_deadline: Duration,

	/// Keep-alive ping cadence; must stay below the peer's read deadline.
	pub ping_interval: Duration,
}

impl Default for SessionSettings {
	fn default() -> Self {
		Self {
			outbound_capacity: DEFAULT_OUTBOUND_CAPACITY,
			max_frame_bytes: DEFAULT_MAX_FRAME_SIZE,
			read_idle_deadline: Duration::from_secs(60),
			write_deadline: Duration::from_secs(10),
			ping_interval: Duration::from_secs(30),
		}
	}
}

/// Outcome of a non-blocking enqueue onto a client's outbound queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueue {
	Queued,
	/// Queue full; the event was dropped for this client only.
	Dropped {
		consecutive: u32,
	},
	Closed,
}

/// Live events held back while this client's history replay is still
/// being enqueued.
#[derive(Debug, Default)]
struct ReplayGate {
	gated: bool,
	buffered: Vec<Event>,
}

#[derive(Debug)]
struct ClientInner {
	client_id: ClientId,
	room_id: RoomId,
	user_id: UserId,
	username: Username,
	joined_at: DateTime<Utc>,
	outbound_capacity: usize,
	outbound_tx: mpsc::Sender<Event>,
	closed: watch::Sender<bool>,
	consecutive_drops: AtomicU32,
	replay_gate: Mutex<ReplayGate>,
}

/// Handle to one connected session. Cheap to clone; all clones refer
/// to the same connection state.
#[derive(Debug, Clone)]
pub struct Client {
	inner: Arc<ClientInner>,
}

impl Client {
	/// Build a client and the receiving end of its outbound queue.
	/// The receiver belongs to the writer pump.
	pub fn new(
		room_id: RoomId,
		user_id: UserId,
		username: Username,
		outbound_capacity: usize,
	) -> (Self, mpsc::Receiver<Event>) {
		let outbound_capacity = outbound_capacity.max(1);
		let (outbound_tx, outbound_rx) = mpsc::channel(outbound_capacity);
		let (closed, _) = watch::channel(false);

		let client = Self {
			inner: Arc::new(ClientInner {
				client_id: ClientId::new_v4(),
				room_id,
				user_id,
				username,
				joined_at: Utc::now(),
				outbound_capacity,
				outbound_tx,
				closed,
				consecutive_drops: AtomicU32::new(0),
				replay_gate: Mutex::new(ReplayGate::default()),
			}),
		};
		(client, outbound_rx)
	}

	pub fn client_id(&self) -> ClientId {
		self.inner.client_id
	}

	pub fn room_id(&self) -> &RoomId {
		&self.inner.room_id
	}

	pub fn user_id(&self) -> &UserId {
		&self.inner.user_id
	}

	pub fn username(&self) -> &Username {
		&self.inner.username
	}

	pub fn joined_at(&self) -> DateTime<Utc> {
		self.inner.joined_at
	}

	pub fn is_closed(&self) -> bool {
		*self.inner.closed.borrow()
	}

	/// Mark the client closed and wake both pumps. Idempotent; returns
	/// whether this call performed the transition.
	pub fn close(&self) -> bool {
		// Hand anything the replay gate still holds (a kick reason may
		// be in there) to the writer's final drain.
		self.finish_replay();
		self.inner.closed.send_if_modified(|closed| {
			if *closed {
				false
			} else {
				*closed = true;
				true
			}
		})
	}

	/// Resolves once the client is closed.
	pub async fn closed(&self) {
		let mut rx = self.inner.closed.subscribe();
		while !*rx.borrow_and_update() {
			if rx.changed().await.is_err() {
				return;
			}
		}
	}

	/// Hold live fan-out in a side buffer until the history replay has
	/// been enqueued. Armed by the hub loop before the client becomes
	/// visible to broadcast.
	pub(crate) fn gate_for_replay(&self) {
		self.inner.replay_gate.lock().gated = true;
	}

	/// Move the buffered live events in behind the replay prefix and
	/// reopen the direct path. Flushing happens under the gate lock so
	/// no concurrent enqueue can jump ahead of the buffer.
	pub(crate) fn finish_replay(&self) {
		let mut gate = self.inner.replay_gate.lock();
		for event in gate.buffered.drain(..) {
			if self.is_closed() {
				break;
			}
			if self.inner.outbound_tx.try_send(event).is_err() {
				metrics::counter!("banter_server_outbound_dropped_total").increment(1);
			}
		}
		gate.gated = false;
	}

	/// Non-blocking enqueue used by the hub's fan-out. After `close`,
	/// events are silently discarded.
	pub(crate) fn try_enqueue(&self, event: Event) -> Enqueue {
		if self.is_closed() {
			return Enqueue::Closed;
		}

		{
			let mut gate = self.inner.replay_gate.lock();
			if gate.gated {
				if gate.buffered.len() >= self.inner.outbound_capacity {
					let consecutive = self.inner.consecutive_drops.fetch_add(1, Ordering::Relaxed).saturating_add(1);
					return Enqueue::Dropped { consecutive };
				}
				gate.buffered.push(event);
				self.inner.consecutive_drops.store(0, Ordering::Relaxed);
				return Enqueue::Queued;
			}
		}

		match self.inner.outbound_tx.try_send(event) {
			Ok(()) => {
				self.inner.consecutive_drops.store(0, Ordering::Relaxed);
				Enqueue::Queued
			}
			Err(TrySendError::Full(_)) => {
				let consecutive = self.inner.consecutive_drops.fetch_add(1, Ordering::Relaxed).saturating_add(1);
				Enqueue::Dropped { consecutive }
			}
			Err(TrySendError::Closed(_)) => Enqueue::Closed,
		}
	}

	/// Waiting enqueue used by the history loader.
	pub(crate) async fn enqueue(&self, event: Event) -> anyhow::Result<()> {
		if self.is_closed() {
			return Err(anyhow!("client closed"));
		}
		self.inner
			.outbound_tx
			.send(event)
			.await
			.map_err(|_| anyhow!("outbound queue closed"))
	}
}

/// Reader pump: turns inbound text frames into `message.received`
/// broadcasts until EOF, a read error, the idle deadline, or close.
/// Always unregisters the client on the way out.
pub async fn run_reader<R: FrameReader>(
	client: Client,
	mut reader: R,
	hub: HubHandle,
	messages: Arc<dyn MessageStore>,
	settings: SessionSettings,
) {
	loop {
		let next = tokio::select! {
			_ = client.closed() => break,
			res = timeout(settings.read_idle_deadline, reader.next_frame()) => res,
		};

		let frame = match next {
			Err(_) => {
				debug!(client_id = %client.client_id(), "read idle deadline expired");
				break;
			}
			Ok(Err(e)) => {
				debug!(client_id = %client.client_id(), error = %e, "transport read failed");
				break;
			}
			Ok(Ok(None)) => break,
			Ok(Ok(Some(frame))) => frame,
		};

		match frame {
			Frame::Text(text) => {
				if text.len() > settings.max_frame_bytes {
					metrics::counter!("banter_server_frames_oversized_total").increment(1);
					warn!(
						client_id = %client.client_id(),
						len = text.len(),
						max = settings.max_frame_bytes,
						"dropping oversized inbound frame"
					);
					continue;
				}

				let content = text.trim();
				if content.is_empty() {
					continue;
				}

				metrics::counter!("banter_server_frames_in_total").increment(1);

				let message = StoredMessage {
					id: MessageId::new_v4(),
					room_id: client.room_id().clone(),
					user_id: client.user_id().clone(),
					username: client.username().clone(),
					content: content.to_string(),
					timestamp: Utc::now(),
				};

				if let Err(e) = messages.create(message.clone()).await {
					warn!(client_id = %client.client_id(), error = %e, "failed to persist inbound message");
				}

				hub.broadcast(message.to_event()).await;
			}

			// Any traffic, pongs included, re-arms the idle deadline on
			// the next loop iteration.
			Frame::Ping | Frame::Pong => {}

			Frame::Close => break,
		}
	}

	hub.unregister(client.clone()).await;
	client.close();
}

/// Writer pump: drains the outbound queue to the transport with a
/// per-write deadline and emits keep-alive pings. Owns transport
/// closure on the way out.
pub async fn run_writer<W: FrameWriter>(
	client: Client,
	mut outbound_rx: mpsc::Receiver<Event>,
	mut writer: W,
	settings: SessionSettings,
) {
	let mut ping = tokio::time::interval_at(Instant::now() + settings.ping_interval, settings.ping_interval);
	ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

	loop {
		tokio::select! {
			maybe = outbound_rx.recv() => {
				let Some(event) = maybe else { break; };
				if !write_event(&client, &mut writer, &event, &settings).await {
					break;
				}
			}

			_ = ping.tick() => {
				match timeout(settings.write_deadline, writer.send_ping()).await {
					Ok(Ok(())) => {}
					Ok(Err(e)) => {
						debug!(client_id = %client.client_id(), error = %e, "ping write failed");
						break;
					}
					Err(_) => {
						debug!(client_id = %client.client_id(), "ping write deadline expired");
						break;
					}
				}
			}

			_ = client.closed() => {
				// Flush whatever is already queued, then shut the
				// transport. A kicked client still sees the reason.
				while let Ok(event) = outbound_rx.try_recv() {
					if !write_event(&client, &mut writer, &event, &settings).await {
						break;
					}
				}
				break;
			}
		}
	}

	let _ = writer.close().await;
	client.close();
}

/// Returns false when the connection is no longer usable.
async fn write_event<W: FrameWriter>(client: &Client, writer: &mut W, event: &Event, settings: &SessionSettings) -> bool {
	let text = match encode_event(event, settings.max_frame_bytes) {
		Ok(text) => text,
		Err(e) => {
			metrics::counter!("banter_server_encode_errors_total").increment(1);
			warn!(
				client_id = %client.client_id(),
				kind = %event.kind(),
				error = %e,
				"failed to encode outbound event; skipping"
			);
			return true;
		}
	};

	match timeout(settings.write_deadline, writer.send_text(text)).await {
		Ok(Ok(())) => {
			metrics::counter!("banter_server_frames_out_total").increment(1);
			true
		}
		Ok(Err(e)) => {
			debug!(client_id = %client.client_id(), error = %e, "transport write failed");
			false
		}
		Err(_) => {
			debug!(client_id = %client.client_id(), "write deadline expired");
			false
		}
	}
}
