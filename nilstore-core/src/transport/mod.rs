//! Retrieval transports
//!
//! Error taxonomy, the fallback router, the gateway reachability monitor,
//! the peer-to-peer client and its wire codec.

pub mod codec;
pub mod error;
pub mod gateway;
pub mod p2p;
pub mod router;

pub use codec::{FetchCodec, FetchRequest, FetchResponse, FramingError, FETCH_PROTOCOL};
pub use error::{classify_status, ErrorClass, TransportError};
pub use gateway::{
    ConnectionState, GatewayMonitor, GatewayStatusInfo, HttpStatusProbe, MonitorConfig,
    StatusProbe, TransportStatus,
};
pub use p2p::{parse_peer_addr, P2PError, P2pClient};
pub use router::{
    Backend, Candidate, DecisionTrace, RouteFailure, RoutePreference, Routed, RouterOptions,
    TransportRouter,
};
