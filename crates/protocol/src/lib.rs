//! Wire frames and gateway message shapes.
//!
//! The chunk-upload request body and the download response body are
//! sequences of length-delimited binary frames; the subscription
//! gateway speaks JSON envelopes over a duplex channel. Both live here
//! so clients and server share one definition.

pub mod constants;
pub mod frame;
pub mod messages;

pub use constants::*;
pub use frame::{ChunkFrameHeader, DataFrameHeader, FrameError};
pub use messages::{GatewayError, GatewayMessage, MessageType};
