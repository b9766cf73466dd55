//! Chat-facing transfer sessions on top of [`relay_engine`].
//!
//! This crate turns the engine's streaming primitives into per-user
//! transfers: a [`Dispatcher`] routes inbound chat messages, a
//! [`SessionRegistry`] enforces one active transfer per user, and a
//! [`TransferService`] drives the fetch, transcode, split and deliver
//! chain for each accepted link. Delivery itself goes through the
//! [`ChatSink`] trait so the concrete chat client stays outside.

pub mod chat;
pub mod dispatch;
pub mod error;
pub mod gate;
pub mod registry;
pub mod session;
pub mod state;

pub use chat::{ChatSink, MessageId, PartStream, UserId};
pub use dispatch::{CANCEL_COMMAND, Dispatcher};
pub use error::{SinkError, TransferError};
pub use gate::UserGate;
pub use registry::SessionRegistry;
pub use session::{StatusSnapshot, TransferConfig, TransferService, TransferSession};
pub use state::{SessionEvent, SessionState};
