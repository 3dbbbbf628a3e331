use crate::error::FramingError;
use bytes::Bytes;
use std::fmt;
use std::time::Duration;

// Sync
/// First byte of every transport packet.
pub const SYNC_BYTE: u8 = 0x47;
/// Fill byte after the last section of a packet.
pub const STUFFING_BYTE: u8 = 0xff;

// PIDs
/// PID of the PAT.
pub const PID_PAT: u16 = 0x0000;
/// PID of the CAT.
pub const PID_CAT: u16 = 0x0001;
/// PID of the TDT and TOT.
pub const PID_TDT: u16 = 0x0014;
/// The null PID.
pub const PID_NULL: u16 = 0x1fff;
/// Highest valid PID.
pub const MAX_PID: u16 = 0x1fff;
/// Number of PIDs.
pub const PID_COUNT: usize = 0x2000;

// Table IDs
/// table_id of a PAT.
pub const TABLE_ID_PAT: u8 = 0x00;
/// table_id of a CAT.
pub const TABLE_ID_CAT: u8 = 0x01;
/// table_id of a PMT.
pub const TABLE_ID_PMT: u8 = 0x02;
/// table_id of a TDT.
pub const TABLE_ID_TDT: u8 = 0x70;
/// table_id of a TOT.
pub const TABLE_ID_TOT: u8 = 0x73;

// Constants
/// Length of the transport packet inside every frame.
pub const TS_PACKET_SIZE: usize = 188;
/// Length of the fixed packet header.
pub const TS_HEADER_SIZE: usize = 4;
/// Length of the AVCHD arrival time prefix.
pub const AVCHD_PREFIX_SIZE: usize = 4;
/// Largest section_length accepted.
pub const MAX_SECTION_LENGTH: usize = 4093;
/// PTS/DTS clock rate.
pub const PTS_HZ: u64 = 90_000;
/// PCR clock rate.
pub const PCR_HZ: u64 = 27_000_000;

/// Number of consecutive sync bytes required to accept a packet length.
pub const SYNC_RUN: usize = 5;

/// Default number of bytes scanned for a sync run before giving up.
pub const DEFAULT_SEARCH_WINDOW: usize = 5000;

/// The frame sizes a transport stream can be stored with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketLength {
    /// Plain ISO/IEC 13818-1 packets.
    Ts188,
    /// AVCHD / Blu-ray packets: 4-byte arrival-time-stamp prefix + 188 bytes.
    Avchd192,
    /// DVB packets with 16 trailing Reed-Solomon bytes.
    Dvb204,
    /// ATSC packets with 20 trailing Reed-Solomon bytes.
    Atsc208,
}

impl PacketLength {
    /// Candidates in the order the frame locator tries them.
    pub const ALL: [PacketLength; 4] = [
        PacketLength::Ts188,
        PacketLength::Avchd192,
        PacketLength::Dvb204,
        PacketLength::Atsc208,
    ];

    /// Total frame size in bytes.
    pub fn bytes(self) -> usize {
        match self {
            PacketLength::Ts188 => 188,
            PacketLength::Avchd192 => 192,
            PacketLength::Dvb204 => 204,
            PacketLength::Atsc208 => 208,
        }
    }

    /// Offset of the sync byte within a frame.
    pub fn sync_offset(self) -> usize {
        match self {
            PacketLength::Avchd192 => AVCHD_PREFIX_SIZE,
            _ => 0,
        }
    }

    /// Whether frames carry an arrival-time-stamp prefix.
    pub fn is_avchd(self) -> bool {
        self == PacketLength::Avchd192
    }
}

impl TryFrom<usize> for PacketLength {
    type Error = FramingError;

    fn try_from(len: usize) -> std::result::Result<Self, Self::Error> {
        match len {
            188 => Ok(PacketLength::Ts188),
            192 => Ok(PacketLength::Avchd192),
            204 => Ok(PacketLength::Dvb204),
            208 => Ok(PacketLength::Atsc208),
            other => Err(FramingError::InvalidPacketLength(other)),
        }
    }
}

impl fmt::Display for PacketLength {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.bytes())
    }
}

/// One frame as read from the source.
#[derive(Debug, Clone)]
pub struct RawFrame {
    /// Complete frame bytes, including any prefix or trailer.
    pub data: Bytes,
    /// Byte offset of the frame start in the source.
    pub offset: u64,
    /// Sequential packet number, starting at 0.
    pub packet_no: u64,
    /// Framing the frame was read with.
    pub packet_length: PacketLength,
}

impl RawFrame {
    /// The 188-byte transport packet inside the frame.
    pub fn ts_packet(&self) -> &[u8] {
        let start = self.packet_length.sync_offset();
        &self.data[start..start + TS_PACKET_SIZE]
    }

    /// The 4-byte arrival-time-stamp prefix of AVCHD frames.
    pub fn avchd_prefix(&self) -> Option<[u8; 4]> {
        if self.packet_length.is_avchd() {
            Some([self.data[0], self.data[1], self.data[2], self.data[3]])
        } else {
            None
        }
    }
}

/// The fixed 4-byte header of a transport packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct TSHeader {
    pub sync_byte: u8, // Always 0x47
    pub transport_error: bool,
    pub payload_unit_start: bool,
    pub transport_priority: bool,
    pub pid: u16,
    pub scrambling_control: u8,
    pub adaptation_field_control: u8,
    pub continuity_counter: u8,
}

impl TSHeader {
    /// Whether adaptation_field_control announces an adaptation field.
    pub fn has_adaptation_field(&self) -> bool {
        self.adaptation_field_control & 0x02 != 0
    }

    /// Whether adaptation_field_control announces payload.
    pub fn has_payload(&self) -> bool {
        self.adaptation_field_control & 0x01 != 0
    }

    /// Whether transport_scrambling_control is non-zero.
    pub fn is_scrambled(&self) -> bool {
        self.scrambling_control != 0
    }
}

// Time conversion utilities. Clock values are 27 MHz ticks (base * 300 + extension).

/// Converts 27 MHz ticks.
pub fn pcr_to_duration(pcr: u64) -> Duration {
    Duration::from_nanos(((pcr as u128 * 1_000_000_000) / PCR_HZ as u128) as u64)
}

/// Converts 90 kHz ticks.
pub fn pts_to_duration(pts: u64) -> Duration {
    Duration::from_nanos(((pts as u128 * 1_000_000_000) / PTS_HZ as u128) as u64)
}

/// Formats a 27 MHz clock value as `hh:mm:ss.mmm`.
pub fn format_pcr(pcr: u64) -> String {
    let millis = pcr / (PCR_HZ / 1000);
    let hours = millis / 3_600_000;
    let minutes = (millis / 60_000) % 60;
    let seconds = (millis / 1000) % 60;
    format!("{:02}:{:02}:{:02}.{:03}", hours, minutes, seconds, millis % 1000)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_packet_length_offsets() {
        assert_eq!(PacketLength::Avchd192.sync_offset(), 4);
        assert_eq!(PacketLength::Dvb204.sync_offset(), 0);
        assert_eq!(PacketLength::try_from(208).unwrap(), PacketLength::Atsc208);
        assert!(PacketLength::try_from(190).is_err());
    }

    #[test]
    fn test_clock_conversions() {
        assert_eq!(pcr_to_duration(PCR_HZ), Duration::from_secs(1));
        assert_eq!(pts_to_duration(PTS_HZ * 2), Duration::from_secs(2));
        assert_eq!(format_pcr(PCR_HZ * 3661 + PCR_HZ / 2), "01:01:01.500");
    }
}
