use super::types::{MAX_SECTION_LENGTH, STUFFING_BYTE};
use bytes::{Bytes, BytesMut};

/// Bytes before the section body: table_id and the 12-bit section_length.
pub const SECTION_HEADER_SIZE: usize = 3;

/// A complete PSI section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PsiSection {
    /// table_id
    pub table_id: u8,
    /// section_syntax_indicator
    pub section_syntax_indicator: bool,
    /// section_length after clamping to 4093.
    pub section_length: usize,
    /// Present on long-form sections only.
    pub table_id_extension: Option<u16>,
    /// version_number
    pub version_number: Option<u8>,
    /// current_next_indicator
    pub current_next_indicator: Option<bool>,
    /// section_number
    pub section_number: Option<u8>,
    /// last_section_number
    pub last_section_number: Option<u8>,
    /// Number of the transport packet the section started in.
    pub packet_no: u64,
    data: Bytes,
}

impl PsiSection {
    fn from_bytes(data: Bytes, packet_no: u64) -> Self {
        let section_syntax_indicator = data[1] & 0x80 != 0;
        let long_form = section_syntax_indicator && data.len() >= 8;
        PsiSection {
            table_id: data[0],
            section_syntax_indicator,
            section_length: data.len() - SECTION_HEADER_SIZE,
            table_id_extension: long_form.then(|| ((data[3] as u16) << 8) | data[4] as u16),
            version_number: long_form.then(|| (data[5] >> 1) & 0x1f),
            current_next_indicator: long_form.then(|| data[5] & 0x01 != 0),
            section_number: long_form.then(|| data[6]),
            last_section_number: long_form.then(|| data[7]),
            packet_no,
            data,
        }
    }

    /// The whole section, starting with table_id.
    pub fn data(&self) -> &Bytes {
        &self.data
    }

    /// Bytes after the 3-byte section header.
    pub fn body(&self) -> &[u8] {
        &self.data[SECTION_HEADER_SIZE..]
    }

    /// Table body of a long-form section: after the 8-byte header, before the CRC.
    pub fn table_body(&self) -> &[u8] {
        if self.section_syntax_indicator && self.data.len() >= 12 {
            &self.data[8..self.data.len() - 4]
        } else {
            self.body()
        }
    }
}

#[derive(Debug)]
struct SectionBuilder {
    packet_no: u64,
    buf: BytesMut,
    target: Option<usize>,
}

impl SectionBuilder {
    fn new(packet_no: u64) -> Self {
        Self {
            packet_no,
            buf: BytesMut::with_capacity(SECTION_HEADER_SIZE),
            target: None,
        }
    }

    /// Takes as many bytes as the section still needs; returns the count.
    fn feed(&mut self, bytes: &[u8]) -> usize {
        let mut consumed = 0;

        if self.target.is_none() {
            let want = (SECTION_HEADER_SIZE - self.buf.len()).min(bytes.len());
            self.buf.extend_from_slice(&bytes[..want]);
            consumed = want;
            if self.buf.len() < SECTION_HEADER_SIZE {
                return consumed;
            }

            let declared = (((self.buf[1] & 0x0f) as usize) << 8) | self.buf[2] as usize;
            if declared > MAX_SECTION_LENGTH {
                log::warn!(
                    "section_length {} in packet {} clamped to {}",
                    declared,
                    self.packet_no,
                    MAX_SECTION_LENGTH
                );
            }
            let target = declared.min(MAX_SECTION_LENGTH) + SECTION_HEADER_SIZE;
            self.buf.reserve(target - self.buf.len());
            self.target = Some(target);
        }

        let target = self.target.unwrap_or(SECTION_HEADER_SIZE);
        let take = (target - self.buf.len()).min(bytes.len() - consumed);
        self.buf.extend_from_slice(&bytes[consumed..consumed + take]);
        consumed + take
    }

    fn is_complete(&self) -> bool {
        self.target == Some(self.buf.len())
    }

    fn into_section(self) -> PsiSection {
        PsiSection::from_bytes(self.buf.freeze(), self.packet_no)
    }
}

/// Reassembles the PSI sections of one PID.
///
/// Idle until a payload-unit-start packet arrives; then accumulating until
/// `section_length + 3` bytes are buffered. Partial sections are never
/// emitted: a continuity error or a unit start that arrives too early drops
/// them.
#[derive(Debug, Default)]
pub struct SectionReassembler {
    current: Option<SectionBuilder>,
    sections_dropped: u64,
}

impl SectionReassembler {
    /// An idle reassembler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a section is being accumulated.
    pub fn in_progress(&self) -> bool {
        self.current.is_some()
    }

    /// Bytes buffered for the section in flight.
    pub fn bytes_accumulated(&self) -> usize {
        self.current.as_ref().map_or(0, |b| b.buf.len())
    }

    /// Incomplete sections discarded so far.
    pub fn sections_dropped(&self) -> u64 {
        self.sections_dropped
    }

    /// Drops the section in flight. Returns whether there was one.
    pub fn reset(&mut self) -> bool {
        let dropped = self.current.take().is_some();
        if dropped {
            self.sections_dropped += 1;
        }
        dropped
    }

    /// Routes one transport packet payload and returns the sections it completes.
    pub fn push(&mut self, pid: u16, unit_start: bool, payload: &[u8], packet_no: u64) -> Vec<PsiSection> {
        let mut done = Vec::new();

        if !unit_start {
            if let Some(builder) = self.current.as_mut() {
                builder.feed(payload);
                if builder.is_complete() {
                    done.extend(self.current.take().map(SectionBuilder::into_section));
                }
            }
            return done;
        }

        if payload.len() <= 1 {
            return done;
        }
        let pointer = payload[0] as usize;
        let rest = &payload[1..];
        if pointer > rest.len() {
            log::warn!(
                "pid 0x{:04x}: pointer_field {} past end of packet {}",
                pid,
                pointer,
                packet_no
            );
            self.reset();
            return done;
        }

        if let Some(mut builder) = self.current.take() {
            builder.feed(&rest[..pointer]);
            if builder.is_complete() {
                done.push(builder.into_section());
            } else {
                log::debug!(
                    "pid 0x{:04x}: section from packet {} incomplete at packet {}, dropped",
                    pid,
                    builder.packet_no,
                    packet_no
                );
                self.sections_dropped += 1;
            }
        }

        let mut pos = pointer;
        while pos < rest.len() && rest[pos] != STUFFING_BYTE {
            let mut builder = SectionBuilder::new(packet_no);
            pos += builder.feed(&rest[pos..]);
            if builder.is_complete() {
                done.push(builder.into_section());
            } else {
                self.current = Some(builder);
                break;
            }
        }
        done
    }
}
