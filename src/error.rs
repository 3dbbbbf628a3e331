use thiserror::Error;

/// Reasons the packet framing of a source could not be established.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FramingError {
    /// Fewer bytes than framing detection needs.
    #[error("source too short to determine framing: {len} bytes, need at least {required}")]
    SourceTooShort {
        /// Bytes available.
        len: usize,
        /// Bytes needed to confirm a sync run.
        required: usize,
    },

    /// No packet length gave a sync run inside the search window.
    #[error("no valid packet length found within the first {window} bytes")]
    NoSync {
        /// Bytes searched.
        window: usize,
    },

    /// Not one of 188, 192, 204 or 208.
    #[error("unsupported packet length: {0}")]
    InvalidPacketLength(usize),
}

/// Errors raised by this crate.
#[derive(Error, Debug)]
pub enum TsError {
    /// Reading the source failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The packet framing could not be established.
    #[error("framing error: {0}")]
    Framing(#[from] FramingError),

    /// A configuration or text input could not be parsed.
    #[error("parser error: {0}")]
    Parser(String),

    /// Stream data that does not decode.
    #[error("invalid data: {0}")]
    InvalidData(String),

    /// A random-access read past the indexed packets.
    #[error("packet {packet_no} out of range, stream holds {packet_count} packets")]
    PacketOutOfRange {
        /// Packet asked for.
        packet_no: u64,
        /// Packets in the index.
        packet_count: u64,
    },
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, TsError>;
