/// Tether Sync
///
/// Long-lived, end-to-end encrypted update channel to the sync server:
/// - one transport per `SyncService`, opened with the bearer token in the URL
/// - receive + keepalive loops, exponential backoff reconnection
/// - subscription ledger replayed after every (re)connection
/// - typed fan-out of decrypted updates to any number of consumers

pub mod config;
pub mod connection;
pub mod credentials;
pub mod dispatcher;
pub mod error;
pub mod transport;

pub use config::{ReconnectPolicy, SyncConfig, transport_url};
pub use connection::SyncService;
pub use credentials::{CredentialStore, KeyMaterial, StaticCredentials};
pub use dispatcher::Dispatcher;
pub use error::SyncError;
pub use transport::{Connector, Frame, FrameSink, FrameStream, WebSocketConnector};
