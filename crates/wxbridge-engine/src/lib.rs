//! Stateful client for the WeChat file-transfer-assistant web protocol.
//!
//! One [`Engine`] owns the HTTP client, the authenticated [`session::Session`],
//! the bounded message caches, and the redaction-aware request tracer. Every
//! upstream request in the process goes through it.

pub mod download;
pub mod engine;
pub mod error;
pub mod hosts;
pub mod login;
pub mod send;
pub mod session;
pub mod sync;
pub mod trace;

pub use engine::{Engine, EngineOptions};
pub use error::{EngineError, Result};
pub use login::LoginPhase;
pub use sync::SyncStatus;
pub use trace::TraceRecorder;
