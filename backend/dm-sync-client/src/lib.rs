//! Client-side synchronization engine for DM threads.
//!
//! A [`SyncEngine`] keeps one conversation's timeline consistent across
//! optimistic sends, push events, history pages and reconnects. The
//! [`session`] module runs it as a task behind a cloneable handle.

pub mod config;
pub mod engine;
pub mod error;
pub mod model;
pub mod outbox;
pub mod reorder;
pub mod session;
pub mod timeline;
pub mod transport;

pub use config::SyncConfig;
pub use engine::SyncEngine;
pub use error::{OutboxError, SyncError, SyncResult, TransportError};
pub use model::{LocalMessage, MessageStatus, ThreadSnapshot};
pub use outbox::{FileOutboxStore, MemoryOutboxStore, OutboxItem, OutboxStore};
pub use session::{spawn_session, SessionHandle};
pub use transport::{
    HttpTransport, PushChannel, PushSender, PushSubscription, SyncTransport, WsPushChannel,
};
