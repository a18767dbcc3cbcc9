//! Realtime session for one viewed chat channel: history backlog, a single
//! live connection, and the reconciled message view built from both.

pub mod config;
pub mod connection;
pub mod error;
pub mod history;
pub mod outbound;
pub mod reconciler;
mod session;

pub use config::{load_settings, SessionSettings};
pub use connection::{ConnectionState, LiveEvent};
pub use error::{HistoryError, SessionError};
pub use history::{HistorySource, HttpHistorySource, MissingHistorySource};
pub use session::{SessionController, SessionEvent, SessionIdentity};
