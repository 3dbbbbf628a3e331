#![doc(html_root_url = "https://docs.rs/tsprobe/0.1.0")]
#![cfg_attr(docsrs, feature(doc_cfg))]
#![deny(missing_docs)]
#![deny(rustdoc::missing_crate_level_docs)]

//! # tsprobe - MPEG-2 Transport Stream demultiplexer
//!
//! `tsprobe` is the demultiplexing and reassembly engine of a transport
//! stream analyzer. It reads a capture, works out its framing and hands
//! back what an analyzer needs to show: per-PID statistics, reassembled
//! PSI sections and PES packets, PCR timing and the stream bitrate.
//!
//! ## Features
//!
//! - 188, 192 (AVCHD / Blu-ray), 204 and 208 byte packets, detected or forced
//! - resynchronization after lost sync
//! - continuity counter, duplicate and PCR tracking per PID
//! - adaptation fields including private data and extension records
//! - section and PES reassembly, bounded and unbounded
//! - bitrate and zero-time estimation, AVCHD arrival time stamp rollover
//! - cooperative cancellation and random-access re-reads after a pass
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use tsprobe::config::DemuxConfig;
//! use tsprobe::format::ts::{CancellationToken, NullSink, TransportStreamDemux};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut demux = TransportStreamDemux::new(DemuxConfig::load());
//!     let outcome = demux.parse_file("capture.m2ts", &mut NullSink, &CancellationToken::new())?;
//!
//!     let stats = demux.statistics();
//!     println!("{} packets, bitrate {:?}", outcome.packets(), stats.bitrate);
//!     Ok(())
//! }
//! ```
//!
//! ## Module Overview
//!
//! - `format::ts`: framing, packet parsing, reassembly and the demultiplexer
//! - `config`: demultiplexing options from files and the environment
//! - `error`: error types and the `Result` alias
//! - `utils`: bit-level reading

/// Demultiplexing configuration
pub mod config;

/// Error types and utilities
pub mod error;

/// Container format implementations
pub mod format;

/// Common utilities and helper functions
pub mod utils;

pub use error::{FramingError, Result, TsError};
