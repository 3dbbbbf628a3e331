use bytes::{Bytes, BytesMut};
use std::ops::Range;
use std::sync::OnceLock;

/// Bytes before the PES_packet_length field ends: start code, stream id, length.
pub const PES_PREFIX_SIZE: usize = 6;

/// Initial buffer for unbounded (length 0) PES packets, which are nearly always video.
pub const DEFAULT_UNBOUNDED_CAPACITY: usize = 16 * 1024;

// Stream ids whose PES packets carry no optional header.
/// program_stream_map
pub const STREAM_ID_PROGRAM_STREAM_MAP: u8 = 0xbc;
/// padding_stream
pub const STREAM_ID_PADDING: u8 = 0xbe;
/// private_stream_2
pub const STREAM_ID_PRIVATE_STREAM_2: u8 = 0xbf;
/// ECM_stream
pub const STREAM_ID_ECM: u8 = 0xf0;
/// EMM_stream
pub const STREAM_ID_EMM: u8 = 0xf1;
/// DSMCC_stream
pub const STREAM_ID_DSMCC: u8 = 0xf2;
/// ITU-T H.222.1 type E
pub const STREAM_ID_H222_1_TYPE_E: u8 = 0xf8;
/// program_stream_directory
pub const STREAM_ID_PROGRAM_STREAM_DIRECTORY: u8 = 0xff;

/// Whether PES packets of this stream id carry the optional header with PTS/DTS.
pub fn has_optional_header(stream_id: u8) -> bool {
    !matches!(
        stream_id,
        STREAM_ID_PROGRAM_STREAM_MAP
            | STREAM_ID_PADDING
            | STREAM_ID_PRIVATE_STREAM_2
            | STREAM_ID_ECM
            | STREAM_ID_EMM
            | STREAM_ID_DSMCC
            | STREAM_ID_H222_1_TYPE_E
            | STREAM_ID_PROGRAM_STREAM_DIRECTORY
    )
}

/// Reads a 33-bit PTS/DTS from its 5-byte marker-bit layout.
pub fn parse_timestamp(b: &[u8]) -> u64 {
    ((((b[0] >> 1) & 0x07) as u64) << 30)
        | ((b[1] as u64) << 22)
        | (((b[2] >> 1) as u64) << 15)
        | ((b[3] as u64) << 7)
        | ((b[4] >> 1) as u64)
}

/// Packetized Elementary Stream (PES) header structure
///
/// Contains fields defined by ISO/IEC 13818-1 for PES headers,
/// including timing information and various control flags. Packets whose
/// stream id carries no optional header only fill the first three fields.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PESHeader {
    /// Stream identifier indicating content type (video/audio/etc.)
    pub stream_id: u8,
    /// PES_packet_length as declared; 0 means unbounded
    pub packet_length: u16,
    /// Whether the optional header (flags, PTS/DTS) is present
    pub has_optional_header: bool,
    /// Control field for scrambling mode
    pub scrambling_control: u8,
    /// Priority flag for the packet
    pub priority: bool,
    /// Data alignment indicator
    pub data_alignment: bool,
    /// Copyright indicator
    pub copyright: bool,
    /// Original/copy indicator
    pub original: bool,
    /// The two PTS_DTS_flags bits
    pub pts_dts_flags: u8,
    /// ESCR (Extended System Clock Reference) flag
    pub escr_flag: bool,
    /// Elementary Stream rate flag
    pub es_rate_flag: bool,
    /// DSM trick mode flag
    pub dsm_trick_mode_flag: bool,
    /// Additional copy info flag
    pub additional_copy_info_flag: bool,
    /// CRC flag
    pub crc_flag: bool,
    /// Extension flag
    pub extension_flag: bool,
    /// Length of the header data following this field
    pub header_data_length: u8,
    /// Presentation Time Stamp (33 bits)
    pub pts: Option<u64>,
    /// Decoding Time Stamp (33 bits)
    pub dts: Option<u64>,
}

impl PESHeader {
    /// Parses the header at the start of a PES packet.
    ///
    /// Returns `None` when the start code is missing or too few bytes are
    /// buffered for the fixed part of the header. PTS/DTS are left empty if
    /// their bytes are not present.
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < PES_PREFIX_SIZE || data[0..3] != [0x00, 0x00, 0x01] {
            return None;
        }

        let stream_id = data[3];
        let mut header = PESHeader {
            stream_id,
            packet_length: ((data[4] as u16) << 8) | data[5] as u16,
            ..Default::default()
        };
        if !has_optional_header(stream_id) {
            return Some(header);
        }
        if data.len() < 9 {
            return None;
        }

        let flags = data[6];
        header.has_optional_header = true;
        header.scrambling_control = (flags >> 4) & 0x03;
        header.priority = flags & 0x08 != 0;
        header.data_alignment = flags & 0x04 != 0;
        header.copyright = flags & 0x02 != 0;
        header.original = flags & 0x01 != 0;

        let flags2 = data[7];
        header.pts_dts_flags = flags2 >> 6;
        header.escr_flag = flags2 & 0x20 != 0;
        header.es_rate_flag = flags2 & 0x10 != 0;
        header.dsm_trick_mode_flag = flags2 & 0x08 != 0;
        header.additional_copy_info_flag = flags2 & 0x04 != 0;
        header.crc_flag = flags2 & 0x02 != 0;
        header.extension_flag = flags2 & 0x01 != 0;
        header.header_data_length = data[8];

        if header.pts_dts_flags & 0x02 != 0 && data.len() >= 14 {
            header.pts = Some(parse_timestamp(&data[9..14]));
        }
        if header.pts_dts_flags == 0x03 && data.len() >= 19 {
            header.dts = Some(parse_timestamp(&data[14..19]));
        }

        Some(header)
    }

    /// Offset of the elementary stream bytes within the PES packet.
    pub fn payload_offset(&self) -> usize {
        if self.has_optional_header {
            9 + self.header_data_length as usize
        } else {
            PES_PREFIX_SIZE
        }
    }
}

/// A reassembled PES packet.
///
/// The header is parsed on first access and cached, so a packet shared
/// between threads after the demux pass parses it exactly once.
#[derive(Debug, Clone)]
pub struct PesPacket {
    /// PID the packet was reassembled on.
    pub pid: u16,
    /// stream_id after the start code.
    pub stream_id: u8,
    /// PES_packet_length as declared; 0 for unbounded packets.
    pub declared_length: usize,
    /// Number of the transport packet that started this PES packet.
    pub packet_no: u64,
    data: Bytes,
    header: OnceLock<Option<PESHeader>>,
}

impl PesPacket {
    /// Wraps reassembled bytes; the header is parsed lazily.
    pub fn new(pid: u16, stream_id: u8, declared_length: usize, packet_no: u64, data: Bytes) -> Self {
        Self {
            pid,
            stream_id,
            declared_length,
            packet_no,
            data,
            header: OnceLock::new(),
        }
    }

    /// All bytes of the packet, starting with the `00 00 01` start code.
    pub fn data(&self) -> &Bytes {
        &self.data
    }

    /// False for unbounded (length 0) packets.
    pub fn is_bounded(&self) -> bool {
        self.declared_length != 0
    }

    /// The optional PES header, or `None` for stream ids without one or a header that does not decode.
    pub fn header(&self) -> Option<&PESHeader> {
        self.header.get_or_init(|| PESHeader::parse(&self.data)).as_ref()
    }

    /// PTS in 90 kHz units.
    pub fn pts(&self) -> Option<u64> {
        self.header().and_then(|h| h.pts)
    }

    /// DTS in 90 kHz units.
    pub fn dts(&self) -> Option<u64> {
        self.header().and_then(|h| h.dts)
    }

    /// Byte range of the elementary stream data within [`data`](Self::data).
    pub fn payload_range(&self) -> Range<usize> {
        let start = self
            .header()
            .map(|h| h.payload_offset())
            .unwrap_or(PES_PREFIX_SIZE)
            .min(self.data.len());
        start..self.data.len()
    }

    /// The elementary stream data.
    pub fn payload(&self) -> &[u8] {
        &self.data[self.payload_range()]
    }
}

#[derive(Debug)]
struct PesBuilder {
    stream_id: u8,
    declared_length: usize,
    packet_no: u64,
    buf: BytesMut,
}

impl PesBuilder {
    fn target_len(&self) -> Option<usize> {
        (self.declared_length != 0).then_some(self.declared_length + PES_PREFIX_SIZE)
    }
}

/// Accumulates the PES packets of one PID.
#[derive(Debug)]
pub struct PesReassembler {
    current: Option<PesBuilder>,
    unbounded_capacity: usize,
    length_mismatches: u64,
}

impl Default for PesReassembler {
    fn default() -> Self {
        Self::new()
    }
}

impl PesReassembler {
    /// A reassembler with the default unbounded capacity.
    pub fn new() -> Self {
        Self::with_unbounded_capacity(DEFAULT_UNBOUNDED_CAPACITY)
    }

    /// Uses `capacity` as the starting buffer size for unbounded packets.
    pub fn with_unbounded_capacity(capacity: usize) -> Self {
        Self {
            current: None,
            unbounded_capacity: capacity.max(PES_PREFIX_SIZE),
            length_mismatches: 0,
        }
    }

    /// Begins a new PES packet, dropping any packet still in flight.
    pub fn start(&mut self, stream_id: u8, declared_length: usize, packet_no: u64) {
        let capacity = if declared_length == 0 {
            self.unbounded_capacity
        } else {
            declared_length + PES_PREFIX_SIZE
        };
        self.current = Some(PesBuilder {
            stream_id,
            declared_length,
            packet_no,
            buf: BytesMut::with_capacity(capacity),
        });
    }

    /// Appends bytes to the packet in flight and returns how many were taken.
    ///
    /// Bounded packets never take more than their declared size; unbounded
    /// ones double their buffer whenever it runs out.
    pub fn feed(&mut self, bytes: &[u8]) -> usize {
        let Some(builder) = self.current.as_mut() else {
            return 0;
        };

        let take = match builder.target_len() {
            Some(target) => bytes.len().min(target.saturating_sub(builder.buf.len())),
            None => {
                let needed = builder.buf.len() + bytes.len();
                if needed > builder.buf.capacity() {
                    let grown = (builder.buf.capacity() * 2).max(needed);
                    builder.buf.reserve(grown - builder.buf.len());
                }
                bytes.len()
            }
        };
        builder.buf.extend_from_slice(&bytes[..take]);
        take
    }

    /// True once a bounded packet holds exactly `declared_length + 6` bytes.
    pub fn is_complete(&self) -> bool {
        self.current
            .as_ref()
            .and_then(|b| b.target_len().map(|target| b.buf.len() == target))
            .unwrap_or(false)
    }

    /// Whether a packet is being accumulated.
    pub fn in_progress(&self) -> bool {
        self.current.is_some()
    }

    /// Bytes buffered for the packet in flight.
    pub fn bytes_accumulated(&self) -> usize {
        self.current.as_ref().map_or(0, |b| b.buf.len())
    }

    /// Current buffer capacity.
    pub fn capacity(&self) -> usize {
        self.current.as_ref().map_or(0, |b| b.buf.capacity())
    }

    /// Bounded packets that ended with a length other than declared.
    pub fn length_mismatches(&self) -> u64 {
        self.length_mismatches
    }

    /// Hands out the packet in flight, whatever its state.
    pub fn finalize(&mut self, pid: u16) -> Option<PesPacket> {
        self.current.take().map(|b| {
            PesPacket::new(pid, b.stream_id, b.declared_length, b.packet_no, b.buf.freeze())
        })
    }

    /// Drops the packet in flight. Returns whether there was one.
    pub fn reset(&mut self) -> bool {
        self.current.take().is_some()
    }

    /// Routes one transport packet payload.
    ///
    /// A payload-unit-start closes the packet in flight: unbounded packets
    /// are delivered, bounded ones that fell short are dropped as a length
    /// mismatch.
    pub fn push(&mut self, pid: u16, unit_start: bool, payload: &[u8], packet_no: u64) -> Vec<PesPacket> {
        let mut done = Vec::new();

        if unit_start {
            if let Some(builder) = &self.current {
                if builder.declared_length == 0 {
                    done.extend(self.finalize(pid));
                } else {
                    log::warn!(
                        "pid 0x{:04x}: PES packet from packet {} ended after {} of {} bytes",
                        pid,
                        builder.packet_no,
                        builder.buf.len(),
                        builder.declared_length + PES_PREFIX_SIZE
                    );
                    self.length_mismatches += 1;
                    self.reset();
                }
            }

            if payload.len() < PES_PREFIX_SIZE || payload[0..3] != [0x00, 0x00, 0x01] {
                log::debug!("pid 0x{:04x}: packet {} does not start a PES packet", pid, packet_no);
                return done;
            }
            let declared = ((payload[4] as usize) << 8) | payload[5] as usize;
            self.start(payload[3], declared, packet_no);
        } else if self.current.is_none() {
            return done;
        }

        let taken = self.feed(payload);
        if taken < payload.len() && payload[taken..].iter().any(|&b| b != 0xff) {
            log::warn!(
                "pid 0x{:04x}: {} bytes past the declared PES length in packet {}",
                pid,
                payload.len() - taken,
                packet_no
            );
            self.length_mismatches += 1;
        }
        if self.is_complete() {
            done.extend(self.finalize(pid));
        }
        done
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn timestamp_bytes(marker: u8, ts: u64) -> [u8; 5] {
        [
            marker | (((ts >> 29) & 0x0e) as u8) | 0x01,
            (ts >> 22) as u8,
            (((ts >> 14) & 0xfe) as u8) | 0x01,
            (ts >> 7) as u8,
            (((ts << 1) & 0xfe) as u8) | 0x01,
        ]
    }

    fn pes_with_pts_dts(stream_id: u8, pts: u64, dts: u64, payload: &[u8]) -> Vec<u8> {
        let mut data = vec![0x00, 0x00, 0x01, stream_id, 0, 0, 0x80, 0xc0, 10];
        data.extend_from_slice(&timestamp_bytes(0x30, pts));
        data.extend_from_slice(&timestamp_bytes(0x10, dts));
        data.extend_from_slice(payload);
        let len = data.len() - PES_PREFIX_SIZE;
        data[4] = (len >> 8) as u8;
        data[5] = len as u8;
        data
    }

    #[test]
    fn test_header_pts_dts() {
        let data = pes_with_pts_dts(0xe0, 0x1_2345_6789, 0x0_0000_1234, b"abc");
        let header = PESHeader::parse(&data).unwrap();
        assert_eq!(header.stream_id, 0xe0);
        assert_eq!(header.pts_dts_flags, 0x03);
        assert_eq!(header.pts, Some(0x1_2345_6789));
        assert_eq!(header.dts, Some(0x1234));
        assert_eq!(header.payload_offset(), 19);
    }

    #[test]
    fn test_no_optional_header_for_padding() {
        let data = [0x00, 0x00, 0x01, STREAM_ID_PADDING, 0x00, 0x03, 0x80, 0xc0, 0x0a];
        let header = PESHeader::parse(&data).unwrap();
        assert!(!header.has_optional_header);
        assert_eq!(header.pts, None);
        assert_eq!(header.payload_offset(), 6);
        assert!(PESHeader::parse(&[0x00, 0x00, 0x02, 0xe0, 0, 0]).is_none());
    }

    #[test]
    fn test_bounded_packet_completes_exactly() {
        let data = pes_with_pts_dts(0xc0, 900, 900, &[7u8; 300]);
        let mut reassembler = PesReassembler::new();

        let mut out = reassembler.push(0x101, true, &data[..184], 0);
        assert!(out.is_empty());
        assert!(reassembler.in_progress());
        out.extend(reassembler.push(0x101, false, &data[184..], 1));

        assert_eq!(out.len(), 1);
        let packet = &out[0];
        assert_eq!(packet.data()[..], data[..]);
        assert_eq!(packet.pts(), Some(900));
        assert_eq!(packet.payload(), &[7u8; 300][..]);
        assert!(!reassembler.in_progress());
    }

    #[test]
    fn test_short_bounded_packet_dropped_on_next_start() {
        let data = pes_with_pts_dts(0xc0, 0, 0, &[1u8; 400]);
        let mut reassembler = PesReassembler::new();
        assert!(reassembler.push(0x101, true, &data[..184], 0).is_empty());
        // next unit starts before the first one is complete
        let next = pes_with_pts_dts(0xc0, 0, 0, &[2u8; 10]);
        let out = reassembler.push(0x101, true, &next, 1);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].packet_no, 1);
        assert_eq!(reassembler.length_mismatches(), 1);
    }

    #[test]
    fn test_unbounded_finalized_at_next_start() {
        let mut first = vec![0x00, 0x00, 0x01, 0xe0, 0x00, 0x00, 0x80, 0x00, 0x00];
        first.extend_from_slice(&[9u8; 100]);
        let mut reassembler = PesReassembler::new();
        assert!(reassembler.push(0x100, true, &first, 0).is_empty());
        assert!(reassembler.push(0x100, false, &[8u8; 184], 1).is_empty());
        assert!(!reassembler.is_complete());

        let out = reassembler.push(0x100, true, &first, 2);
        assert_eq!(out.len(), 1);
        assert!(!out[0].is_bounded());
        assert_eq!(out[0].data().len(), first.len() + 184);
        assert_eq!(out[0].payload_range(), 9..first.len() + 184);
        assert!(reassembler.in_progress());
    }

    #[test]
    fn test_unbounded_growth_keeps_bytes() {
        let reference: Vec<u8> = (0..25_000u32).map(|i| (i * 31 % 251) as u8).collect();
        let mut reassembler = PesReassembler::new();
        reassembler.start(0xe0, 0, 0);
        let initial = reassembler.capacity();

        for chunk in reference.chunks(184) {
            assert_eq!(reassembler.feed(chunk), chunk.len());
        }
        assert!(reassembler.capacity() > initial);
        assert_eq!(reassembler.bytes_accumulated(), reference.len());
        assert!(!reassembler.is_complete());

        let packet = reassembler.finalize(0x100).unwrap();
        assert_eq!(packet.data()[..], reference[..]);
    }

    #[test]
    fn test_header_memoized_across_threads() {
        let packet = std::sync::Arc::new(PesPacket::new(
            0x100,
            0xe0,
            0,
            0,
            Bytes::from(pes_with_pts_dts(0xe0, 42, 40, b"x")),
        ));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let packet = packet.clone();
                std::thread::spawn(move || (packet.pts(), packet.dts()))
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.join().unwrap(), (Some(42), Some(40)));
        }
    }
}
