#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;

use banter_domain::{JoinCode, MessageId, RoomId, UserId, Username};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Wire-level event discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
	MessageReceived,
	MessageDeleted,
	MessageUpdated,
	MemberJoined,
	MemberLeft,
	MemberList,
	RoomDeleted,
	RoomUpdated,
	Error,
	AuthError,
	JoinError,
	RateLimited,
	Kicked,
}

impl EventKind {
	/// Stable wire name.
	pub const fn as_str(self) -> &'static str {
		match self {
			EventKind::MessageReceived => "message.received",
			EventKind::MessageDeleted => "message.deleted",
			EventKind::MessageUpdated => "message.updated",
			EventKind::MemberJoined => "member.joined",
			EventKind::MemberLeft => "member.left",
			EventKind::MemberList => "member.list",
			EventKind::RoomDeleted => "room.deleted",
			EventKind::RoomUpdated => "room.updated",
			EventKind::Error => "error",
			EventKind::AuthError => "error.auth",
			EventKind::JoinError => "error.join",
			EventKind::RateLimited => "error.rate_limited",
			EventKind::Kicked => "error.kicked",
		}
	}
}

impl fmt::Display for EventKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Error for parsing an `EventKind` from its wire name.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("unknown event type: {0}")]
pub struct UnknownEventKind(pub String);

impl FromStr for EventKind {
	type Err = UnknownEventKind;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"message.received" => Ok(EventKind::MessageReceived),
			"message.deleted" => Ok(EventKind::MessageDeleted),
			"message.updated" => Ok(EventKind::MessageUpdated),
			"member.joined" => Ok(EventKind::MemberJoined),
			"member.left" => Ok(EventKind::MemberLeft),
			"member.list" => Ok(EventKind::MemberList),
			"room.deleted" => Ok(EventKind::RoomDeleted),
			"room.updated" => Ok(EventKind::RoomUpdated),
			"error" => Ok(EventKind::Error),
			"error.auth" => Ok(EventKind::AuthError),
			"error.join" => Ok(EventKind::JoinError),
			"error.rate_limited" => Ok(EventKind::RateLimited),
			"error.kicked" => Ok(EventKind::Kicked),
			other => Err(UnknownEventKind(other.to_string())),
		}
	}
}

/// Payload of `message.received`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageReceived {
	pub id: MessageId,
	pub content: String,
	pub user_id: UserId,
	pub username: Username,
	pub timestamp: DateTime<Utc>,
}

/// Payload of `message.deleted`. `room_id`/`timestamp` are optional so
/// the short `{id}` form decodes as well.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageDeleted {
	pub id: MessageId,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub room_id: Option<RoomId>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub timestamp: Option<DateTime<Utc>>,
}

/// Payload of `message.updated`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageUpdated {
	pub id: MessageId,
	pub content: String,
	pub room_id: RoomId,
	pub timestamp: DateTime<Utc>,
}

/// Payload of `member.joined`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberJoined {
	pub user_id: UserId,
	pub username: Username,
	pub joined_at: DateTime<Utc>,
}

/// Payload of `member.left`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberLeft {
	pub user_id: UserId,
	pub username: Username,
}

/// One entry of a `member.list` snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberEntry {
	pub user_id: UserId,
	pub username: Username,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub joined_at: Option<DateTime<Utc>>,
}

/// Payload of `member.list`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberList {
	pub members: Vec<MemberEntry>,
}

/// Payload of `room.deleted`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomDeleted {
	pub room_id: RoomId,
}

/// Payload of `room.updated`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomUpdated {
	pub room_id: RoomId,
	pub join_code: JoinCode,
}

/// Payload of `error`, `error.auth`, `error.join` and
/// `error.rate_limited`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorInfo {
	pub code: String,
	pub message: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub retry: Option<bool>,
}

impl ErrorInfo {
	pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
		Self {
			code: code.into(),
			message: message.into(),
			retry: None,
		}
	}
}

/// Payload of `error.kicked`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Kicked {
	pub user_id: UserId,
	pub username: Username,
	pub reason: String,
}

/// Typed event payload, one variant per wire type.
#[derive(Debug, Clone, PartialEq)]
pub enum EventPayload {
	MessageReceived(MessageReceived),
	MessageDeleted(MessageDeleted),
	MessageUpdated(MessageUpdated),
	MemberJoined(MemberJoined),
	MemberLeft(MemberLeft),
	MemberList(MemberList),
	RoomDeleted(RoomDeleted),
	RoomUpdated(RoomUpdated),
	Error(ErrorInfo),
	AuthError(ErrorInfo),
	JoinError(ErrorInfo),
	RateLimited(ErrorInfo),
	Kicked(Kicked),
}

impl EventPayload {
	/// Wire discriminant for this payload.
	pub const fn kind(&self) -> EventKind {
		match self {
			EventPayload::MessageReceived(_) => EventKind::MessageReceived,
			EventPayload::MessageDeleted(_) => EventKind::MessageDeleted,
			EventPayload::MessageUpdated(_) => EventKind::MessageUpdated,
			EventPayload::MemberJoined(_) => EventKind::MemberJoined,
			EventPayload::MemberLeft(_) => EventKind::MemberLeft,
			EventPayload::MemberList(_) => EventKind::MemberList,
			EventPayload::RoomDeleted(_) => EventKind::RoomDeleted,
			EventPayload::RoomUpdated(_) => EventKind::RoomUpdated,
			EventPayload::Error(_) => EventKind::Error,
			EventPayload::AuthError(_) => EventKind::AuthError,
			EventPayload::JoinError(_) => EventKind::JoinError,
			EventPayload::RateLimited(_) => EventKind::RateLimited,
			EventPayload::Kicked(_) => EventKind::Kicked,
		}
	}
}

/// Immutable in-core event: target room plus tagged payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
	pub room_id: RoomId,
	pub payload: EventPayload,
}

impl Event {
	pub fn new(room_id: RoomId, payload: EventPayload) -> Self {
		Self { room_id, payload }
	}

	pub fn kind(&self) -> EventKind {
		self.payload.kind()
	}
}
