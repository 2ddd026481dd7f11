#![forbid(unsafe_code)]

use banter_domain::RoomId;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::event::{Event, EventKind, EventPayload};

/// Default maximum frame payload size.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 32 * 1024; // 32 KiB

#[derive(Debug, Error)]
pub enum CodecError {
	#[error("frame exceeds maximum size: len={len} max={max}")]
	FrameTooLarge {
		len: usize,
		max: usize,
	},

	#[error("empty frame")]
	EmptyFrame,

	#[error("empty roomId")]
	EmptyRoomId,

	#[error("unknown event type: {0}")]
	UnknownType(String),

	#[error("json error: {0}")]
	Json(#[from] serde_json::Error),
}

/// Serialized event shape: `{"type": ..., "roomId": ..., "data": ...}`.
#[derive(Debug, Serialize, Deserialize)]
struct WireEvent {
	#[serde(rename = "type")]
	kind: String,

	#[serde(rename = "roomId")]
	room_id: String,

	data: serde_json::Value,
}

/// Encode an event into a single UTF-8 JSON frame.
pub fn encode_event(event: &Event, max_frame_size: usize) -> Result<String, CodecError> {
	let data = match &event.payload {
		EventPayload::MessageReceived(p) => serde_json::to_value(p)?,
		EventPayload::MessageDeleted(p) => serde_json::to_value(p)?,
		EventPayload::MessageUpdated(p) => serde_json::to_value(p)?,
		EventPayload::MemberJoined(p) => serde_json::to_value(p)?,
		EventPayload::MemberLeft(p) => serde_json::to_value(p)?,
		EventPayload::MemberList(p) => serde_json::to_value(p)?,
		EventPayload::RoomDeleted(p) => serde_json::to_value(p)?,
		EventPayload::RoomUpdated(p) => serde_json::to_value(p)?,
		EventPayload::Error(p) | EventPayload::AuthError(p) | EventPayload::JoinError(p) | EventPayload::RateLimited(p) => {
			serde_json::to_value(p)?
		}
		EventPayload::Kicked(p) => serde_json::to_value(p)?,
	};

	let wire = WireEvent {
		kind: event.kind().as_str().to_string(),
		room_id: event.room_id.as_str().to_string(),
		data,
	};

	let text = serde_json::to_string(&wire)?;
	if text.len() > max_frame_size {
		return Err(CodecError::FrameTooLarge {
			len: text.len(),
			max: max_frame_size,
		});
	}
	Ok(text)
}

/// Encode a frame using `DEFAULT_MAX_FRAME_SIZE`.
pub fn encode_event_default(event: &Event) -> Result<String, CodecError> {
	encode_event(event, DEFAULT_MAX_FRAME_SIZE)
}

/// Decode a single JSON frame into an event.
///
/// Fields beyond `type`/`roomId`/`data` and unknown payload keys are
/// ignored; an unknown `type` is reported as `CodecError::UnknownType`
/// for the caller to drop.
pub fn decode_event(text: &str, max_frame_size: usize) -> Result<Event, CodecError> {
	if text.len() > max_frame_size {
		return Err(CodecError::FrameTooLarge {
			len: text.len(),
			max: max_frame_size,
		});
	}
	if text.trim().is_empty() {
		return Err(CodecError::EmptyFrame);
	}

	let wire: WireEvent = serde_json::from_str(text)?;

	let kind: EventKind = wire.kind.parse().map_err(|_| CodecError::UnknownType(wire.kind.clone()))?;
	let room_id = RoomId::new(wire.room_id).map_err(|_| CodecError::EmptyRoomId)?;

	let payload = match kind {
		EventKind::MessageReceived => EventPayload::MessageReceived(serde_json::from_value(wire.data)?),
		EventKind::MessageDeleted => EventPayload::MessageDeleted(serde_json::from_value(wire.data)?),
		EventKind::MessageUpdated => EventPayload::MessageUpdated(serde_json::from_value(wire.data)?),
		EventKind::MemberJoined => EventPayload::MemberJoined(serde_json::from_value(wire.data)?),
		EventKind::MemberLeft => EventPayload::MemberLeft(serde_json::from_value(wire.data)?),
		EventKind::MemberList => EventPayload::MemberList(serde_json::from_value(wire.data)?),
		EventKind::RoomDeleted => EventPayload::RoomDeleted(serde_json::from_value(wire.data)?),
		EventKind::RoomUpdated => EventPayload::RoomUpdated(serde_json::from_value(wire.data)?),
		EventKind::Error => EventPayload::Error(serde_json::from_value(wire.data)?),
		EventKind::AuthError => EventPayload::AuthError(serde_json::from_value(wire.data)?),
		EventKind::JoinError => EventPayload::JoinError(serde_json::from_value(wire.data)?),
		EventKind::RateLimited => EventPayload::RateLimited(serde_json::from_value(wire.data)?),
		EventKind::Kicked => EventPayload::Kicked(serde_json::from_value(wire.data)?),
	};

	Ok(Event { room_id, payload })
}

/// Decode a frame using `DEFAULT_MAX_FRAME_SIZE`.
pub fn decode_event_default(text: &str) -> Result<Event, CodecError> {
	decode_event(text, DEFAULT_MAX_FRAME_SIZE)
}
