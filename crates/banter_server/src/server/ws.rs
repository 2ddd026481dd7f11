#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use banter_domain::{JoinCode, RoomId, UserId, Username};
use banter_protocol::{ErrorInfo, Event, EventPayload, MemberEntry, MemberJoined, MemberLeft, MemberList, encode_event};
use chrono::Utc;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};
use tungstenite::Message;
use tungstenite::handshake::server::{Request, Response};
use tungstenite::http::Uri;
use url::Url;

use crate::server::hub::Hub;
use crate::server::session::{Client, SessionSettings, run_reader, run_writer};
use crate::server::store::{MessageStore, RoomMember, RoomStore, StoredRoom};
use crate::server::transport::{Frame, FrameReader, FrameWriter};

/// Read half of a websocket connection as a session transport.
pub struct WsFrameReader<S> {
	inner: SplitStream<WebSocketStream<S>>,
}

impl<S> WsFrameReader<S> {
	pub fn new(inner: SplitStream<WebSocketStream<S>>) -> Self {
		Self { inner }
	}
}

#[async_trait::async_trait]
impl<S: AsyncRead + AsyncWrite + Unpin + Send> FrameReader for WsFrameReader<S> {
	async fn next_frame(&mut self) -> anyhow::Result<Option<Frame>> {
		loop {
			let Some(msg) = self.inner.next().await else {
				return Ok(None);
			};
			let msg = msg.map_err(|e| anyhow!(e).context("websocket read"))?;

			match msg {
				Message::Text(text) => return Ok(Some(Frame::Text(text.as_str().to_string()))),
				Message::Ping(_) => return Ok(Some(Frame::Ping)),
				Message::Pong(_) => return Ok(Some(Frame::Pong)),
				Message::Close(_) => return Ok(Some(Frame::Close)),
				Message::Binary(_) => {
					metrics::counter!("banter_server_binary_frames_dropped_total").increment(1);
					debug!("ignoring binary websocket frame");
				}
				_ => {}
			}
		}
	}
}

/// Write half of a websocket connection as a session transport.
pub struct WsFrameWriter<S> {
	inner: SplitSink<WebSocketStream<S>, Message>,
}

impl<S> WsFrameWriter<S> {
	pub fn new(inner: SplitSink<WebSocketStream<S>, Message>) -> Self {
		Self { inner }
	}
}

#[async_trait::async_trait]
impl<S: AsyncRead + AsyncWrite + Unpin + Send> FrameWriter for WsFrameWriter<S> {
	async fn send_text(&mut self, text: String) -> anyhow::Result<()> {
		self.inner
			.send(Message::text(text))
			.await
			.map_err(|e| anyhow!(e).context("websocket write"))
	}

	async fn send_ping(&mut self) -> anyhow::Result<()> {
		self.inner
			.send(Message::Ping(tungstenite::Bytes::new()))
			.await
			.map_err(|e| anyhow!(e).context("websocket ping"))
	}

	async fn close(&mut self) -> anyhow::Result<()> {
		// Initiates the close handshake and flushes; errors here mean
		// the peer is already gone.
		let _ = self.inner.close().await;
		Ok(())
	}
}

/// Validated join inputs from the upgrade request.
#[derive(Debug)]
struct JoinRequest {
	room_id: RoomId,
	join_code: JoinCode,
	username: Username,
}

#[derive(Debug)]
enum JoinReject {
	/// Not a room join request; close without an event.
	Malformed(String),

	/// A join attempt with a bad field; reported as `error.join`.
	Invalid {
		room_id: RoomId,
		code: &'static str,
		message: String,
	},
}

fn parse_join_request(uri: &Uri) -> Result<JoinRequest, JoinReject> {
	let url = Url::parse(&format!("ws://localhost{uri}"))
		.map_err(|e| JoinReject::Malformed(format!("invalid request uri: {e}")))?;

	let mut segments = url
		.path_segments()
		.ok_or_else(|| JoinReject::Malformed("missing request path".to_string()))?;

	let room_segment = match (segments.next(), segments.next(), segments.next(), segments.next()) {
		(Some("ws"), Some("rooms"), Some(room), None) if !room.is_empty() => room.to_string(),
		_ => {
			return Err(JoinReject::Malformed(format!(
				"expected /ws/rooms/{{roomId}}, got {}",
				url.path()
			)));
		}
	};

	let room_id = RoomId::new(room_segment).map_err(|e| JoinReject::Malformed(format!("invalid roomId: {e}")))?;

	let mut join_code = None;
	let mut username = None;
	for (key, value) in url.query_pairs() {
		match key.as_ref() {
			"joinCode" => join_code = Some(value.into_owned()),
			"username" => username = Some(value.into_owned()),
			_ => {}
		}
	}

	let join_code = match join_code {
		Some(code) => JoinCode::new(code).map_err(|e| JoinReject::Invalid {
			room_id: room_id.clone(),
			code: "invalid_join_code",
			message: format!("invalid joinCode: {e}"),
		})?,
		None => {
			return Err(JoinReject::Invalid {
				room_id,
				code: "missing_join_code",
				message: "joinCode query parameter is required".to_string(),
			});
		}
	};

	let username = match username {
		Some(name) => Username::new(name).map_err(|e| JoinReject::Invalid {
			room_id: room_id.clone(),
			code: "invalid_username",
			message: format!("invalid username: {e}"),
		})?,
		None => {
			return Err(JoinReject::Invalid {
				room_id,
				code: "missing_username",
				message: "username query parameter is required".to_string(),
			});
		}
	};

	Ok(JoinRequest {
		room_id,
		join_code,
		username,
	})
}

/// Bind and accept websocket connections until the listener fails.
pub async fn run_ws_listener(
	bind: SocketAddr,
	hub: Hub,
	rooms: Arc<dyn RoomStore>,
	messages: Arc<dyn MessageStore>,
	settings: SessionSettings,
	allow_open_rooms: bool,
) -> anyhow::Result<()> {
	let listener = TcpListener::bind(bind).await.context("bind websocket listener")?;
	serve(listener, hub, rooms, messages, settings, allow_open_rooms).await
}

/// Accept connections on an already-bound listener.
pub async fn serve(
	listener: TcpListener,
	hub: Hub,
	rooms: Arc<dyn RoomStore>,
	messages: Arc<dyn MessageStore>,
	settings: SessionSettings,
	allow_open_rooms: bool,
) -> anyhow::Result<()> {
	let local = listener.local_addr().context("listener local_addr")?;
	info!(bind = %local, "websocket listener ready");

	let mut next_conn_id: u64 = 1;

	loop {
		let (stream, remote) = listener.accept().await.context("accept tcp connection")?;

		let conn_id = next_conn_id;
		next_conn_id += 1;
		metrics::counter!("banter_server_connections_total").increment(1);

		let hub = hub.clone();
		let rooms = Arc::clone(&rooms);
		let messages = Arc::clone(&messages);
		let settings = settings.clone();

		tokio::spawn(async move {
			debug!(conn_id, remote = %remote, "accepted connection");
			if let Err(e) = handle_socket(conn_id, stream, hub, rooms, messages, settings, allow_open_rooms).await {
				debug!(conn_id, remote = %remote, error = %e, "connection handler exited with error");
			}
		});
	}
}

/// Upgrade one TCP connection, validate the join, and run the session
/// to completion.
async fn handle_socket(
	conn_id: u64,
	stream: TcpStream,
	hub: Hub,
	rooms: Arc<dyn RoomStore>,
	messages: Arc<dyn MessageStore>,
	settings: SessionSettings,
	allow_open_rooms: bool,
) -> anyhow::Result<()> {
	struct ConnectionGaugeGuard;
	impl Drop for ConnectionGaugeGuard {
		fn drop(&mut self) {
			metrics::gauge!("banter_server_active_connections").decrement(1.0);
		}
	}

	metrics::gauge!("banter_server_active_connections").increment(1.0);
	let _conn_guard = ConnectionGaugeGuard;

	let mut request_uri: Option<Uri> = None;
	let ws = tokio_tungstenite::accept_hdr_async(stream, |req: &Request, resp: Response| {
		request_uri = Some(req.uri().clone());
		Ok(resp)
	})
	.await
	.context("websocket handshake")?;

	let uri = request_uri.ok_or_else(|| anyhow!("handshake completed without a request uri"))?;

	let (sink, stream) = ws.split();
	let mut writer = WsFrameWriter::new(sink);
	let reader = WsFrameReader::new(stream);

	// Join validation happens on the already-upgraded socket so the
	// peer gets a structured event before the close.
	let join = match parse_join_request(&uri) {
		Ok(join) => join,
		Err(JoinReject::Malformed(reason)) => {
			metrics::counter!("banter_server_join_rejected_total").increment(1);
			debug!(conn_id, %reason, "rejecting malformed upgrade request");
			let _ = writer.close().await;
			return Ok(());
		}
		Err(JoinReject::Invalid { room_id, code, message }) => {
			metrics::counter!("banter_server_join_rejected_total").increment(1);
			debug!(conn_id, room = %room_id, code, "rejecting join");
			let event = Event::new(room_id, EventPayload::JoinError(ErrorInfo::new(code, message)));
			send_event(&mut writer, &settings, &event).await;
			let _ = writer.close().await;
			return Ok(());
		}
	};

	let room_id = join.room_id.clone();

	match rooms.get_by_id(&room_id).await.context("load room")? {
		Some(stored) => {
			if stored.join_code != join.join_code {
				metrics::counter!("banter_server_join_rejected_total").increment(1);
				debug!(conn_id, room = %room_id, "join code rejected");
				let event = Event::new(
					room_id,
					EventPayload::AuthError(ErrorInfo::new("invalid_join_code", "join code rejected")),
				);
				send_event(&mut writer, &settings, &event).await;
				let _ = writer.close().await;
				return Ok(());
			}
		}
		None if allow_open_rooms => {
			rooms
				.create(StoredRoom {
					id: room_id.clone(),
					join_code: join.join_code.clone(),
					created_at: Utc::now(),
					members: Vec::new(),
				})
				.await
				.context("create room")?;
			info!(conn_id, room = %room_id, "created room on first join");
		}
		None => {
			metrics::counter!("banter_server_join_rejected_total").increment(1);
			debug!(conn_id, room = %room_id, "join to unknown room rejected");
			let event = Event::new(
				room_id,
				EventPayload::JoinError(ErrorInfo::new("room_not_found", "no such room")),
			);
			send_event(&mut writer, &settings, &event).await;
			let _ = writer.close().await;
			return Ok(());
		}
	}

	let user_id = UserId::new_anonymous();
	let joined_at = Utc::now();
	rooms
		.add_member(
			&room_id,
			RoomMember {
				user_id: user_id.clone(),
				username: join.username.clone(),
				joined_at,
			},
		)
		.await
		.context("add room member")?;

	let (client, outbound_rx) = Client::new(
		room_id.clone(),
		user_id.clone(),
		join.username.clone(),
		settings.outbound_capacity,
	);

	info!(
		conn_id,
		room = %room_id,
		client_id = %client.client_id(),
		username = %join.username,
		"client joined"
	);

	hub.register(client.clone()).await;
	// Registration and broadcast travel on separate channels; wait for
	// the install so the join events below find the room.
	wait_installed(&hub, &client).await;

	hub.broadcast(Event::new(
		room_id.clone(),
		EventPayload::MemberJoined(MemberJoined {
			user_id: user_id.clone(),
			username: join.username.clone(),
			joined_at,
		}),
	))
	.await;
	broadcast_member_list(&hub, &rooms, &room_id).await;

	let writer_task = tokio::spawn(run_writer(client.clone(), outbound_rx, writer, settings.clone()));

	run_reader(client.clone(), reader, hub.handle(), Arc::clone(&messages), settings).await;

	if let Err(e) = rooms.remove_member(&room_id, &user_id).await {
		warn!(conn_id, room = %room_id, error = %e, "failed to remove room member");
	}
	hub.broadcast(Event::new(
		room_id.clone(),
		EventPayload::MemberLeft(MemberLeft {
			user_id: user_id.clone(),
			username: join.username.clone(),
		}),
	))
	.await;
	broadcast_member_list(&hub, &rooms, &room_id).await;

	let _ = writer_task.await;

	info!(conn_id, room = %room_id, client_id = %client.client_id(), "client left");
	Ok(())
}

async fn wait_installed(hub: &Hub, client: &Client) {
	let give_up = tokio::time::Instant::now() + Duration::from_secs(1);
	loop {
		if let Some(room) = hub.registry().get(client.room_id())
			&& room.contains_client(&client.client_id())
		{
			return;
		}
		if tokio::time::Instant::now() >= give_up {
			warn!(client_id = %client.client_id(), "client not installed within a second; proceeding");
			return;
		}
		tokio::time::sleep(Duration::from_millis(2)).await;
	}
}

async fn send_event<W: FrameWriter>(writer: &mut W, settings: &SessionSettings, event: &Event) {
	let text = match encode_event(event, settings.max_frame_bytes) {
		Ok(text) => text,
		Err(e) => {
			warn!(kind = %event.kind(), error = %e, "failed to encode handshake event");
			return;
		}
	};

	match timeout(settings.write_deadline, writer.send_text(text)).await {
		Ok(Ok(())) => {}
		Ok(Err(e)) => debug!(error = %e, "failed to send handshake event"),
		Err(_) => debug!("handshake event write deadline expired"),
	}
}

/// Push a fresh membership snapshot to the room.
async fn broadcast_member_list(hub: &Hub, rooms: &Arc<dyn RoomStore>, room_id: &RoomId) {
	match rooms.get_by_id(room_id).await {
		Ok(Some(room)) => {
			let members = room
				.members
				.iter()
				.map(|m| MemberEntry {
					user_id: m.user_id.clone(),
					username: m.username.clone(),
					joined_at: Some(m.joined_at),
				})
				.collect();

			hub.broadcast(Event::new(room_id.clone(), EventPayload::MemberList(MemberList { members })))
				.await;
		}
		Ok(None) => {}
		Err(e) => warn!(room = %room_id, error = %e, "failed to load member list"),
	}
}
