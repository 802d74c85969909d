//! Transport module - the WebSocket client side.
//!
//! - [`Transport`] - one reconnectable connection bound to a local router
//! - [`ReconnectSupervisor`] - reopens the transport after close or error
//! - [`PendingRequests`] - request id allocation and response correlation

mod client;
mod pending;
mod reconnect;
mod state;

pub use client::{
    Transport, TransportConfig, ABNORMAL_CLOSURE, DEFAULT_EVENT_CAPACITY, NORMAL_CLOSURE,
    NO_STATUS,
};
pub use pending::{PendingRequests, ResponseReceiver};
pub use reconnect::{
    ReconnectPolicy, ReconnectSupervisor, CLOSE_EVENT, DEFAULT_RECONNECT_DELAY, ERROR_EVENT,
    OPEN_EVENT,
};
pub use state::{ConnectionState, TransportEvent};
