pub mod api;
pub mod ws;

pub use api::{api_routes, ApiState};
pub use ws::{ws_handler, WsState};
