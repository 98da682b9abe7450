//! Realtime chat client core: hub session with transport negotiation,
//! reconnection and heartbeat, typed chat API and call signaling.

pub mod auth;
pub mod call;
pub mod chat;
pub mod config;
pub mod conversation;
pub mod error;
pub mod gif;
pub mod handlers;
mod heartbeat;
pub mod reconnect;
pub mod session;
pub mod transport;

pub use auth::{AuthStore, Credentials, FileTokenStore, MemoryTokenStore, TokenStore};
pub use call::{
    CallController, CallDependencies, CallEvent, CallRole, CallSession, CallSignaling, CallState,
    EndReason,
};
pub use chat::{ChatApi, ChatSubscription};
pub use config::{load_settings, Settings};
pub use conversation::ConversationLog;
pub use error::{CallError, ConfigurationError, ConnectError, InvokeError, TransportError};
pub use gif::{Gif, GifClient, GifError};
pub use handlers::Subscription;
pub use reconnect::ReconnectPolicy;
pub use session::{ConnectionState, HubSession, SessionEvent, SessionSettings};
pub use transport::{HubClient, Platform, TransportKind};

#[cfg(test)]
#[path = "tests/fakes.rs"]
pub(crate) mod fakes;
