//! # MPEG Transport Stream (TS) Demultiplexing
//!
//! This module turns a byte source holding back-to-back transport stream
//! frames into the entities a stream analyzer works with:
//!
//! - packet framing at 188, 192 (AVCHD), 204 or 208 bytes, with resynchronization
//! - per-PID continuity counter and duplicate tracking
//! - adaptation field decoding, PCR/OPCR and private data records
//! - PSI section and PES packet reassembly across packet boundaries
//! - stream bitrate, zero time and AVCHD arrival time stamps
//! - random access to any packet after a pass
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use tsprobe::format::ts::{CancellationToken, CollectingSink, TransportStreamDemux};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut demux = TransportStreamDemux::default();
//! let mut sink = CollectingSink::new();
//! demux.parse_file("capture.ts", &mut sink, &CancellationToken::new())?;
//!
//! for pid in demux.statistics().pids {
//!     println!("pid 0x{:04x}: {} packets, {} continuity errors", pid.pid, pid.packets, pid.continuity_errors);
//! }
//! # Ok(())
//! # }
//! ```

/// Adaptation field decoding
pub mod adaptation;

/// AVCHD arrival time stamps
pub mod avchd;

/// Top-level demultiplexer
pub mod demuxer;

/// Tag/length descriptor loops and the decoder registry
pub mod descriptor;

/// Packet length detection and frame alignment
pub mod framing;

/// Transport packet header parsing
pub mod parser;

/// PES packet reassembly
pub mod pes;

/// Per-PID packet state
pub mod pid;

/// PAT/PMT decoding and section classification
pub mod psi;

/// Random-access packet reads
pub mod reader;

/// PSI section reassembly
pub mod section;

/// Consumers of reassembled payloads
pub mod sink;

/// Core TS types and constants
pub mod types;

pub use adaptation::{AdaptationField, ClockReference, PrivateDataRecord};
pub use avchd::ArrivalTimeTracker;
pub use demuxer::{
    BitrateSource, CancellationToken, ParseOutcome, StreamStatistics, StreamTimeModel, TimeSample,
    TransportStreamDemux,
};
pub use descriptor::{DecodedDescriptor, Descriptor, DescriptorRegistry};
pub use framing::{detect_packet_length, FrameLocator};
pub use parser::{parse_packet, TsPacket};
pub use pes::{PESHeader, PesPacket, PesReassembler};
pub use pid::{ContinuityError, PidChannel, PidKind, PidStatistics};
pub use psi::{ProgramRegistry, SectionKind, PMT};
pub use reader::{PacketIndex, PacketReader};
pub use section::{PsiSection, SectionReassembler};
pub use sink::{CollectingSink, NullSink, PesContext, SectionContext, StreamSink};
pub use types::{
    format_pcr, PacketLength, RawFrame, TSHeader, DEFAULT_SEARCH_WINDOW, PID_NULL, PID_PAT,
    TS_PACKET_SIZE,
};
