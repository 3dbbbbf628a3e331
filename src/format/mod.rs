/// MPEG transport stream demultiplexing
pub mod ts;

pub use self::ts::{StreamSink, TransportStreamDemux};
