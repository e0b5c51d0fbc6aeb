//! Broadcast hub for dashboard subscribers.
//!
//! A single control loop owns the subscriber set; register, unregister,
//! and broadcast requests reach it over a channel, so the set is never
//! locked. Each subscriber gets a bounded mailbox drained by its own
//! write pump. A subscriber whose mailbox is full when a broadcast
//! arrives is evicted rather than allowed to stall everyone else.

mod hub;
mod server;
mod session;

pub use hub::{Hub, HubConfig, HubHandle, Mailbox, Payload, SubscriberId};
pub use server::{ServerConfig, SubscriberServer};
pub use session::{SessionHandle, spawn_session};

/// Errors produced by the hub and its listener.
#[derive(Debug, thiserror::Error)]
pub enum HubError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("hub stopped")]
    Stopped,
}
