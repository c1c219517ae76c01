//! CoAP front end
//!
//! Devices publish with `POST` and stream channel traffic with `GET` +
//! Observe. Modules:
//! - `message`: RFC 7252 datagram codec
//! - `observe`: observation state machine, retransmission and delivery task
//! - `adapter`: request routing, authorization and replies
//! - `server`: UDP socket loop

pub mod adapter;
pub mod message;
pub mod observe;
pub mod server;

pub use adapter::{AdapterSettings, CoapAdapter, Route};
pub use message::{MessageType, Packet};
pub use observe::{ObserveState, RetryPolicy, Transport};
pub use server::{CoapServer, start_coap_server};
