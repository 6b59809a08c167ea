//! Real-time dispatch core: live connections, presence, room fan-out,
//! receipts and cursor-based resynchronisation.

pub mod connection;
pub mod dispatcher;
pub mod event;
pub mod notifier;
pub mod ports;
pub mod presence;
mod registry;
pub mod sync;

pub use connection::{serve_socket, ConnectionContext, DEFAULT_WRITE_TIMEOUT};
pub use dispatcher::{Dispatcher, DispatcherConfig};
pub use event::{ChatMessage, Event, FrameError, ReadReceipt, SavedMessage};
pub use notifier::{LogPushNotifier, NotifierConfig, OfflineNotifier, WebhookPushNotifier};
pub use ports::{ChatDirectory, MessageLog, MessageSaver, PresenceOracle, PushNotifier};
pub use presence::PeerPresence;
pub use registry::{ConnectionEntry, ConnectionId};
pub use sync::SyncResolver;
