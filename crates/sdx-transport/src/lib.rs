//! Transport contract consumed by the SDX node runtime.
//!
//! A transport supplies authenticated duplex byte streams and a best-effort
//! datagram lane between peer identifiers; all framing above that is owned
//! by the node.

pub mod memory;
pub mod stream;

pub use stream::{
    DuplexStream, InboundStream, StreamError, StreamTransport, TransportError,
};
