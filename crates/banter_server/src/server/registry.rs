#![forbid(unsafe_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use banter_domain::{ClientId, RoomId};
use banter_protocol::Event;
use parking_lot::RwLock;
use tracing::debug;

use crate::server::session::Client;

/// Default ring capacity for a room's recent-event history.
pub const DEFAULT_HISTORY_CAPACITY: usize = 1000;

#[derive(Debug, Default)]
struct RoomInner {
	clients: HashMap<ClientId, Client>,
	history: VecDeque<Event>,
}

/// One live room: the connected client set plus a bounded ring of the
/// most recent events broadcast to it. The room never writes to
/// client queues itself; it hands out snapshots for the hub to use.
#[derive(Debug)]
pub struct Room {
	id: RoomId,
	history_capacity: usize,
	inner: RwLock<RoomInner>,
}

impl Room {
	fn new(id: RoomId, history_capacity: usize) -> Self {
		Self {
			id,
			history_capacity,
			inner: RwLock::new(RoomInner::default()),
		}
	}

	pub fn id(&self) -> &RoomId {
		&self.id
	}

	/// Insert a client, unique by client id. A second add with the
	/// same id is a no-op; returns whether the client was inserted.
	pub fn add_client(&self, client: Client) -> bool {
		let mut inner = self.inner.write();
		match inner.clients.entry(client.client_id()) {
			std::collections::hash_map::Entry::Occupied(_) => false,
			std::collections::hash_map::Entry::Vacant(entry) => {
				entry.insert(client);
				true
			}
		}
	}

	/// Remove a client. Idempotent.
	pub fn remove_client(&self, client_id: &ClientId) -> Option<Client> {
		self.inner.write().clients.remove(client_id)
	}

	/// Point-in-time copy of the client set, used for dispatch without
	/// holding the room lock.
	pub fn snapshot_clients(&self) -> Vec<Client> {
		self.inner.read().clients.values().cloned().collect()
	}

	pub fn client_count(&self) -> usize {
		self.inner.read().clients.len()
	}

	pub fn contains_client(&self, client_id: &ClientId) -> bool {
		self.inner.read().clients.contains_key(client_id)
	}

	/// Push an event into the history ring, dropping the oldest entry
	/// once the ring is full.
	pub fn append_history(&self, event: Event) {
		let mut inner = self.inner.write();
		inner.history.push_back(event);
		while inner.history.len() > self.history_capacity {
			inner.history.pop_front();
		}
	}

	/// Recent events in publication order.
	pub fn history_snapshot(&self) -> Vec<Event> {
		self.inner.read().history.iter().cloned().collect()
	}
}

/// Process-wide map of live rooms. Mutated only by the hub loop;
/// concurrent reads are unrestricted.
#[derive(Debug)]
pub struct RoomRegistry {
	history_capacity: usize,
	rooms: RwLock<HashMap<RoomId, Arc<Room>>>,
}

impl RoomRegistry {
	pub fn new(history_capacity: usize) -> Self {
		Self {
			history_capacity,
			rooms: RwLock::new(HashMap::new()),
		}
	}

	pub fn get_or_create(&self, room_id: &RoomId) -> Arc<Room> {
		let mut rooms = self.rooms.write();
		Arc::clone(
			rooms
				.entry(room_id.clone())
				.or_insert_with(|| Arc::new(Room::new(room_id.clone(), self.history_capacity))),
		)
	}

	pub fn get(&self, room_id: &RoomId) -> Option<Arc<Room>> {
		self.rooms.read().get(room_id).cloned()
	}

	/// Remove a room. Quietly does nothing if absent.
	pub fn remove(&self, room_id: &RoomId) -> Option<Arc<Room>> {
		self.rooms.write().remove(room_id)
	}

	pub fn room_count(&self) -> usize {
		self.rooms.read().len()
	}

	/// Total connected clients across all rooms.
	pub fn connected_clients(&self) -> usize {
		self.rooms.read().values().map(|room| room.client_count()).sum()
	}

	/// Close every client and clear the map. Shutdown only. Returns
	/// the number of clients closed.
	pub fn disconnect_all(&self) -> usize {
		let rooms: Vec<Arc<Room>> = {
			let mut map = self.rooms.write();
			map.drain().map(|(_, room)| room).collect()
		};

		let mut closed = 0usize;
		for room in rooms {
			for client in room.snapshot_clients() {
				room.remove_client(&client.client_id());
				client.close();
				closed += 1;
			}
			debug!(room = %room.id(), "room released on shutdown");
		}
		closed
	}
}

impl Default for RoomRegistry {
	fn default() -> Self {
		Self::new(DEFAULT_HISTORY_CAPACITY)
	}
}

#[cfg(test)]
mod tests {
	use banter_domain::{UserId, Username};
	use banter_protocol::{ErrorInfo, EventPayload};

	use super::*;

	fn room_id(id: &str) -> RoomId {
		RoomId::new(id.to_string()).expect("valid RoomId")
	}

	fn client(room: &RoomId) -> Client {
		let (client, _rx) = Client::new(
			room.clone(),
			UserId::new_anonymous(),
			Username::new("alice").expect("valid Username"),
			4,
		);
		client
	}

	fn event(room: &RoomId, n: u32) -> Event {
		Event::new(room.clone(), EventPayload::Error(ErrorInfo::new("test", format!("e{n}"))))
	}

	#[test]
	fn add_client_is_unique_by_id() {
		let room = Room::new(room_id("r"), 8);
		let c = client(room.id());

		assert!(room.add_client(c.clone()));
		assert!(!room.add_client(c.clone()));
		assert_eq!(room.client_count(), 1);

		room.remove_client(&c.client_id());
		room.remove_client(&c.client_id());
		assert_eq!(room.client_count(), 0);
	}

	#[test]
	fn history_ring_keeps_most_recent_in_order() {
		let rid = room_id("r");
		let room = Room::new(rid.clone(), 3);

		for n in 1..=5 {
			room.append_history(event(&rid, n));
		}

		let history = room.history_snapshot();
		assert_eq!(history.len(), 3);
		assert_eq!(history, vec![event(&rid, 3), event(&rid, 4), event(&rid, 5)]);
	}

	#[test]
	fn registry_get_or_create_and_remove() {
		let registry = RoomRegistry::new(8);
		let rid = room_id("r");

		assert!(registry.get(&rid).is_none());
		let room = registry.get_or_create(&rid);
		assert!(Arc::ptr_eq(&room, &registry.get_or_create(&rid)));
		assert_eq!(registry.room_count(), 1);

		registry.remove(&rid);
		registry.remove(&rid);
		assert!(registry.get(&rid).is_none());
	}

	#[test]
	fn disconnect_all_closes_every_client() {
		let registry = RoomRegistry::new(8);

		let mut clients = Vec::new();
		for r in ["a", "b"] {
			let rid = room_id(r);
			let room = registry.get_or_create(&rid);
			for _ in 0..3 {
				let c = client(&rid);
				room.add_client(c.clone());
				clients.push(c);
			}
		}

		let closed = registry.disconnect_all();
		assert_eq!(closed, 6);
		assert_eq!(registry.room_count(), 0);
		assert!(clients.iter().all(|c| c.is_closed()));
	}
}
