//! quire sync server
//!
//! Multi-document sync server for quire. One WebSocket connection serves
//! all documents under a single location: the location's `"baseDoc"`
//! syncs automatically on connect, any other document syncs lazily when
//! either peer first references its guid, and presence deltas are
//! rebroadcast to the location's other connections.
//!
//! ## Environment Variables
//!
//! - `HOST`: server host (default: 0.0.0.0)
//! - `PORT`: server port (default: 3030)
//! - `DATA_DIR`: base directory for location databases (default: ./quire_data)
//! - `PING_INTERVAL_SECS`: keepalive probe interval (default: 30)

pub mod config;
pub mod connection;
pub mod handlers;
pub mod registry;

pub use config::Config;
pub use connection::Connection;
pub use registry::{ConnId, DocRegistry, LocationHub, OutboundFrame, SyncStats};
