//! # lyssna-proto
//!
//! Wire protocol between the monitoring host and its out-of-process capture
//! workers. A worker converses over a duplex byte stream carrying framed
//! binary messages; this crate owns both the bit-exact codec and the
//! stream endpoint that turns partial reads into whole frames.
//!
//! ### Key Submodules:
//! - `frame`: message model (type tag, sequence, transaction id, keyed values)
//! - `codec`: encode/decode with magic resync and CRC-32 trailer
//! - `endpoint`: duplex ring-buffer endpoint with bounded outbound side

pub mod codec;
pub mod endpoint;
pub mod frame;

pub use codec::{decode, encode, DecodeError, Decoded, EncodeError};
pub use endpoint::{CloseReason, EndpointConfig, EndpointError, FramedEndpoint};
pub use frame::{Frame, KeyedValue};
