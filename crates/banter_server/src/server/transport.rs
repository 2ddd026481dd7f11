#![forbid(unsafe_code)]

use async_trait::async_trait;

/// Canonical frame model the core speaks. Any full-duplex transport
/// that reduces to this can carry a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
	Text(String),
	Ping,
	Pong,
	Close,
}

/// Read half of a session transport.
#[async_trait]
pub trait FrameReader: Send {
	/// Next inbound frame; `Ok(None)` on a clean EOF.
	async fn next_frame(&mut self) -> anyhow::Result<Option<Frame>>;
}

/// Write half of a session transport.
#[async_trait]
pub trait FrameWriter: Send {
	async fn send_text(&mut self, text: String) -> anyhow::Result<()>;

	async fn send_ping(&mut self) -> anyhow::Result<()>;

	/// Close the transport. Best-effort and safe to call after a failure.
	async fn close(&mut self) -> anyhow::Result<()>;
}
