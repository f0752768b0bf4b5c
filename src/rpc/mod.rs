//! Framed request/stream RPC over TCP.
//!
//! The reservation service answers greeting requests on this channel and the
//! edge consumes them. A connection starts with an optional `SETUP` frame
//! carrying credentials; every request then opens a stream identified by an
//! odd stream id chosen by the requester:
//!
//! ```text
//! requester                         responder
//!   SETUP {metadata}          ──►
//!   REQUEST_STREAM {id: 1}    ──►
//!                             ◄──   NEXT {id: 1}
//!                             ◄──   NEXT {id: 1}
//!   CANCEL {id: 1}            ──►
//!   REQUEST_RESPONSE {id: 3}  ──►
//!                             ◄──   NEXT {id: 3}
//!                             ◄──   COMPLETE {id: 3}
//! ```
//!
//! - [`frame`]: wire format
//! - [`router`]: route table on the responder side
//! - [`server`]: responder accepting connections
//! - [`client`]: requester with lazy connection and reconnection
//! - [`connection`]: requester connection state

pub mod client;
pub mod connection;
pub mod frame;
pub mod router;
pub mod server;

pub use client::{RequestSpec, RequesterOptions, RpcRequester, RpcStream};
pub use connection::ConnectionState;
pub use frame::{CONNECTION_STREAM_ID, ErrorCode, Frame, read_frame, write_frame};
pub use router::{
    GREETING_ONCE_ROUTE, GREETINGS_ROUTE, MessageRouter, ResponseStream, RouteRequest,
    greeting_routes,
};
pub use server::RpcServer;
