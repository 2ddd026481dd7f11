#![forbid(unsafe_code)]

pub mod codec;
pub mod event;

pub use codec::{CodecError, DEFAULT_MAX_FRAME_SIZE, decode_event, decode_event_default, encode_event, encode_event_default};
pub use event::{
	ErrorInfo, Event, EventKind, EventPayload, Kicked, MemberEntry, MemberJoined, MemberLeft, MemberList, MessageDeleted,
	MessageReceived, MessageUpdated, RoomDeleted, RoomUpdated, UnknownEventKind,
};
