#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use banter_protocol::{Event, EventPayload};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::server::history::spawn_history_load;
use crate::server::registry::RoomRegistry;
use crate::server::session::{Client, Enqueue};
use crate::server::store::MessageStore;

/// Hub channel sizing and dispatch policy.
#[derive(Debug, Clone)]
pub struct HubConfig {
	/// Broadcast channel capacity.
	pub broadcast_capacity: usize,

	/// Register/unregister channel capacity.
	pub control_capacity: usize,

	/// Messages replayed to a newly registered client.
	pub history_replay_limit: usize,

	/// Bound on one client's history load.
	pub history_load_timeout: Duration,

	/// Consecutive per-client drops before a forced disconnect.
	pub slow_client_drop_threshold: u32,

	/// Bound on `shutdown` waiting for the loop to drain.
	pub shutdown_deadline: Duration,
}

impl Default for HubConfig {
	fn default() -> Self {
		Self {
			broadcast_capacity: 256,
			control_capacity: 64,
			history_replay_limit: 50,
			history_load_timeout: Duration::from_secs(5),
			slow_client_drop_threshold: 32,
			shutdown_deadline: Duration::from_secs(5),
		}
	}
}

struct HubShared {
	registry: Arc<RoomRegistry>,
	register_tx: mpsc::Sender<Client>,
	unregister_tx: mpsc::Sender<Client>,
	broadcast_tx: mpsc::Sender<Event>,
	shutdown_tx: Mutex<Option<oneshot::Sender<()>>>,
	loop_task: Mutex<Option<JoinHandle<()>>>,
	shutdown_deadline: Duration,
}

/// Single coordinator of registration, deregistration and broadcast
/// dispatch. Exactly one owner loop mutates the registry; everything
/// else talks to it through bounded channels.
#[derive(Clone)]
pub struct Hub {
	shared: Arc<HubShared>,
}

impl Hub {
	/// Start the hub loop.
	pub fn start(registry: Arc<RoomRegistry>, messages: Arc<dyn MessageStore>, cfg: HubConfig) -> Self {
		let (register_tx, register_rx) = mpsc::channel(cfg.control_capacity.max(1));
		let (unregister_tx, unregister_rx) = mpsc::channel(cfg.control_capacity.max(1));
		let (broadcast_tx, broadcast_rx) = mpsc::channel(cfg.broadcast_capacity.max(1));
		let (shutdown_tx, shutdown_rx) = oneshot::channel();

		let shutdown_deadline = cfg.shutdown_deadline;
		let worker = HubLoop {
			registry: Arc::clone(&registry),
			messages,
			cfg,
		};
		let loop_task = tokio::spawn(worker.run(register_rx, unregister_rx, broadcast_rx, shutdown_rx));

		Self {
			shared: Arc::new(HubShared {
				registry,
				register_tx,
				unregister_tx,
				broadcast_tx,
				shutdown_tx: Mutex::new(Some(shutdown_tx)),
				loop_task: Mutex::new(Some(loop_task)),
				shutdown_deadline,
			}),
		}
	}

	/// Hand a freshly connected client to the hub. Eventually the
	/// client is installed in its room and a history load is running.
	pub async fn register(&self, client: Client) {
		if self.shared.register_tx.send(client).await.is_err() {
			debug!("register after hub shutdown; ignoring");
		}
	}

	/// Remove a client. Idempotent; unknown clients are a no-op.
	pub async fn unregister(&self, client: Client) {
		if self.shared.unregister_tx.send(client).await.is_err() {
			debug!("unregister after hub shutdown; ignoring");
		}
	}

	/// Submit an event for dispatch to its room.
	pub async fn broadcast(&self, event: Event) {
		if self.shared.broadcast_tx.send(event).await.is_err() {
			debug!("broadcast after hub shutdown; dropping event");
		}
	}

	/// Capability handle for sessions: publish and self-unregister
	/// only, no registry access.
	pub fn handle(&self) -> HubHandle {
		HubHandle {
			broadcast_tx: self.shared.broadcast_tx.clone(),
			unregister_tx: self.shared.unregister_tx.clone(),
		}
	}

	pub fn registry(&self) -> &Arc<RoomRegistry> {
		&self.shared.registry
	}

	/// One-shot shutdown: disconnects every client, releases the
	/// registry and joins the loop. Subsequent calls are no-ops, and
	/// subsequent sends become no-ops once the loop exits.
	pub async fn shutdown(&self) {
		let Some(tx) = self.shared.shutdown_tx.lock().take() else {
			return;
		};
		let _ = tx.send(());

		let task = self.shared.loop_task.lock().take();
		if let Some(task) = task
			&& timeout(self.shared.shutdown_deadline, task).await.is_err()
		{
			warn!("hub loop did not exit within the shutdown deadline");
		}
	}
}

/// The slice of the hub a session is allowed to reach back into.
#[derive(Clone)]
pub struct HubHandle {
	broadcast_tx: mpsc::Sender<Event>,
	unregister_tx: mpsc::Sender<Client>,
}

impl HubHandle {
	pub async fn broadcast(&self, event: Event) {
		if self.broadcast_tx.send(event).await.is_err() {
			debug!("broadcast after hub shutdown; dropping event");
		}
	}

	pub async fn unregister(&self, client: Client) {
		let _ = self.unregister_tx.send(client).await;
	}
}

struct HubLoop {
	registry: Arc<RoomRegistry>,
	messages: Arc<dyn MessageStore>,
	cfg: HubConfig,
}

impl HubLoop {
	async fn run(
		self,
		mut register_rx: mpsc::Receiver<Client>,
		mut unregister_rx: mpsc::Receiver<Client>,
		mut broadcast_rx: mpsc::Receiver<Event>,
		mut shutdown_rx: oneshot::Receiver<()>,
	) {
		info!("hub loop started");

		loop {
			tokio::select! {
				_ = &mut shutdown_rx => {
					let closed = self.registry.disconnect_all();
					info!(clients = closed, "hub shutdown: disconnected all clients");
					break;
				}

				Some(client) = register_rx.recv() => self.handle_register(client),

				Some(client) = unregister_rx.recv() => self.handle_unregister(&client),

				Some(event) = broadcast_rx.recv() => self.handle_broadcast(event),

				else => break,
			}
		}

		info!("hub loop exited");
	}

	fn handle_register(&self, client: Client) {
		let room = self.registry.get_or_create(client.room_id());
		if !room.add_client(client.clone()) {
			debug!(room = %room.id(), client_id = %client.client_id(), "duplicate register ignored");
			return;
		}

		// This handler runs to completion before the loop can touch a
		// broadcast, so the gate is up before any fan-out sees the
		// client; the loader lowers it once the replay is enqueued.
		client.gate_for_replay();

		metrics::counter!("banter_server_registers_total").increment(1);
		debug!(
			room = %room.id(),
			client_id = %client.client_id(),
			user_id = %client.user_id(),
			clients = room.client_count(),
			"client registered"
		);

		spawn_history_load(
			client,
			Arc::clone(&self.messages),
			self.cfg.history_replay_limit,
			self.cfg.history_load_timeout,
		);
	}

	fn handle_unregister(&self, client: &Client) {
		if let Some(room) = self.registry.get(client.room_id()) {
			if room.remove_client(&client.client_id()).is_some() {
				metrics::counter!("banter_server_unregisters_total").increment(1);
				debug!(room = %room.id(), client_id = %client.client_id(), "client unregistered");
			}

			if room.client_count() == 0 {
				self.registry.remove(client.room_id());
				debug!(room = %room.id(), "removed empty room");
			}
		}
		client.close();
	}

	fn handle_broadcast(&self, event: Event) {
		let Some(room) = self.registry.get(&event.room_id) else {
			metrics::counter!("banter_server_broadcast_no_room_total").increment(1);
			debug!(room = %event.room_id, kind = %event.kind(), "dropping broadcast for unknown room");
			return;
		};

		room.append_history(event.clone());
		metrics::counter!("banter_server_events_broadcast_total").increment(1);

		// Consistent snapshot; enqueue never blocks the loop. A full
		// queue costs that client this event only.
		let clients = room.snapshot_clients();
		let mut slow: Vec<Client> = Vec::new();

		for client in &clients {
			match client.try_enqueue(event.clone()) {
				Enqueue::Queued => {}
				Enqueue::Dropped { consecutive } => {
					metrics::counter!("banter_server_outbound_dropped_total").increment(1);
					debug!(
						room = %room.id(),
						client_id = %client.client_id(),
						consecutive,
						"outbound queue full; dropped event for client"
					);
					if consecutive >= self.cfg.slow_client_drop_threshold {
						slow.push(client.clone());
					}
				}
				Enqueue::Closed => {}
			}
		}

		for client in slow {
			metrics::counter!("banter_server_slow_client_disconnects_total").increment(1);
			warn!(
				room = %room.id(),
				client_id = %client.client_id(),
				threshold = self.cfg.slow_client_drop_threshold,
				"disconnecting slow client"
			);
			self.remove_and_close(&client);
		}

		match &event.payload {
			EventPayload::RoomDeleted(_) => {
				// Members got the deletion event above; now tear the
				// room down.
				if let Some(room) = self.registry.remove(&event.room_id) {
					let remaining = room.snapshot_clients();
					for client in &remaining {
						room.remove_client(&client.client_id());
						client.close();
					}
					info!(room = %room.id(), clients = remaining.len(), "room deleted");
				}
			}
			EventPayload::Kicked(kick) => {
				// The kick reason is already queued; close the kicked
				// user's connections.
				for client in clients.iter().filter(|c| c.user_id() == &kick.user_id) {
					info!(
						room = %room.id(),
						client_id = %client.client_id(),
						user_id = %kick.user_id,
						"closing kicked client"
					);
					self.remove_and_close(client);
				}
			}
			_ => {}
		}
	}

	fn remove_and_close(&self, client: &Client) {
		if let Some(room) = self.registry.get(client.room_id()) {
			room.remove_client(&client.client_id());
			if room.client_count() == 0 {
				self.registry.remove(client.room_id());
				debug!(room = %room.id(), "removed empty room");
			}
		}
		client.close();
	}
}
