#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::server::session::Client;
use crate::server::store::MessageStore;

/// Replay a bounded prefix of the room's prior messages to a newly
/// registered client. Runs off the hub loop; failures leave the
/// client connected without history.
pub fn spawn_history_load(
	client: Client,
	messages: Arc<dyn MessageStore>,
	limit: usize,
	load_timeout: Duration,
) -> JoinHandle<()> {
	tokio::spawn(async move {
		match timeout(load_timeout, replay_history(&client, messages.as_ref(), limit)).await {
			Ok(Ok(replayed)) => {
				if replayed > 0 {
					metrics::counter!("banter_server_history_replayed_total").increment(replayed as u64);
					debug!(
						room = %client.room_id(),
						client_id = %client.client_id(),
						replayed,
						"history replayed"
					);
				}
			}
			Ok(Err(e)) => {
				metrics::counter!("banter_server_history_load_failures_total").increment(1);
				warn!(
					room = %client.room_id(),
					client_id = %client.client_id(),
					error = %e,
					"history load failed; client continues without history"
				);
			}
			Err(_) => {
				metrics::counter!("banter_server_history_load_failures_total").increment(1);
				warn!(
					room = %client.room_id(),
					client_id = %client.client_id(),
					"history load timed out"
				);
			}
		}

		// Every exit path lowers the gate, or the client would never
		// see live traffic again.
		client.finish_replay();
	})
}

async fn replay_history(client: &Client, messages: &dyn MessageStore, limit: usize) -> anyhow::Result<usize> {
	if limit == 0 {
		return Ok(0);
	}

	let stored = messages.get_by_room(client.room_id(), limit).await?;

	let mut replayed = 0usize;
	for message in stored {
		let event = message.to_event();
		tokio::select! {
			_ = client.closed() => return Ok(replayed),
			res = client.enqueue(event) => {
				if res.is_err() {
					return Ok(replayed);
				}
			}
		}
		replayed += 1;
	}
	Ok(replayed)
}
