//! Packet framing: finds the frame size of a source and keeps reads aligned.

use super::types::*;
use crate::error::{FramingError, Result};
use bytes::{Buf, BytesMut};
use std::io::{ErrorKind, Read};

const READ_CHUNK: usize = 64 * 1024;

/// Smallest source that can prove a framing.
pub const MIN_DETECT_BYTES: usize = SYNC_RUN * TS_PACKET_SIZE;

fn longest_frame() -> usize {
    PacketLength::ALL.iter().map(|l| l.bytes()).max().unwrap_or(TS_PACKET_SIZE)
}

fn has_sync_run(data: &[u8], sync_pos: usize, length: PacketLength) -> bool {
    (1..SYNC_RUN).all(|k| data.get(sync_pos + k * length.bytes()) == Some(&SYNC_BYTE))
}

fn find_sync_run(data: &[u8], candidates: &[PacketLength], window: usize) -> Option<(PacketLength, usize)> {
    let limit = data.len().min(window);
    for pos in 0..limit {
        if data[pos] != SYNC_BYTE {
            continue;
        }
        for &length in candidates {
            if pos < length.sync_offset() {
                continue;
            }
            if has_sync_run(data, pos, length) {
                return Some((length, pos - length.sync_offset()));
            }
        }
    }
    None
}

/// Detects the packet length of `data`.
///
/// Returns the length together with the offset of the first frame. A
/// length is accepted once five sync bytes line up at its stride, starting
/// within the first `window` bytes.
pub fn detect_packet_length(
    data: &[u8],
    window: usize,
) -> std::result::Result<(PacketLength, usize), FramingError> {
    if data.len() < MIN_DETECT_BYTES {
        return Err(FramingError::SourceTooShort {
            len: data.len(),
            required: MIN_DETECT_BYTES,
        });
    }
    find_sync_run(data, &PacketLength::ALL, window).ok_or(FramingError::NoSync { window })
}

/// Finds the first frame of `data` for a packet length fixed by the caller.
pub fn locate_first_frame(
    data: &[u8],
    length: PacketLength,
    window: usize,
) -> std::result::Result<usize, FramingError> {
    let required = SYNC_RUN * length.bytes();
    if data.len() < required {
        return Err(FramingError::SourceTooShort {
            len: data.len(),
            required,
        });
    }
    find_sync_run(data, &[length], window)
        .map(|(_, start)| start)
        .ok_or(FramingError::NoSync { window })
}

/// Cuts a byte source into frames, resynchronizing on lost sync.
pub struct FrameLocator<R: Read> {
    reader: R,
    buf: BytesMut,
    eof: bool,
    packet_length: PacketLength,
    /// Source offset of `buf[0]`.
    offset: u64,
    packet_no: u64,
    sync_errors: u64,
    skipped_bytes: u64,
    resyncing: bool,
}

impl<R: Read> FrameLocator<R> {
    /// Reads enough of `reader` to establish the framing.
    ///
    /// With `forced` set the length is not detected, only the first frame
    /// is searched for at that stride.
    pub fn new(reader: R, forced: Option<PacketLength>, window: usize) -> Result<Self> {
        let mut locator = Self {
            reader,
            buf: BytesMut::with_capacity(READ_CHUNK),
            eof: false,
            packet_length: forced.unwrap_or(PacketLength::Ts188),
            offset: 0,
            packet_no: 0,
            sync_errors: 0,
            skipped_bytes: 0,
            resyncing: false,
        };
        locator.fill(window + SYNC_RUN * longest_frame())?;

        let (length, start) = match forced {
            Some(length) => (length, locate_first_frame(&locator.buf, length, window)?),
            None => detect_packet_length(&locator.buf, window)?,
        };
        if start > 0 {
            log::info!("skipping {} bytes before the first {}-byte frame", start, length);
        }
        log::debug!("packet length {} bytes, first frame at offset {}", length, start);

        locator.packet_length = length;
        locator.skip(start);
        Ok(locator)
    }

    /// Packet length in use, detected or forced.
    pub fn packet_length(&self) -> PacketLength {
        self.packet_length
    }

    /// Resynchronization events so far.
    pub fn sync_errors(&self) -> u64 {
        self.sync_errors
    }

    /// Bytes dropped outside any frame, including leading garbage.
    pub fn skipped_bytes(&self) -> u64 {
        self.skipped_bytes
    }

    /// Returns the next aligned frame, or `None` once the source is exhausted.
    pub fn next_frame(&mut self) -> Result<Option<RawFrame>> {
        let len = self.packet_length.bytes();
        let sync = self.packet_length.sync_offset();
        loop {
            self.fill(len * 2)?;
            if self.buf.len() < len {
                if !self.buf.is_empty() {
                    log::debug!(
                        "{} trailing bytes at offset {} do not form a frame",
                        self.buf.len(),
                        self.offset
                    );
                    self.skip(self.buf.len());
                }
                return Ok(None);
            }

            if self.is_aligned(len, sync) {
                if self.resyncing {
                    log::debug!("sync regained at offset {}", self.offset);
                    self.resyncing = false;
                }
                let frame = RawFrame {
                    data: self.buf.split_to(len).freeze(),
                    offset: self.offset,
                    packet_no: self.packet_no,
                    packet_length: self.packet_length,
                };
                self.offset += len as u64;
                self.packet_no += 1;
                return Ok(Some(frame));
            }

            if !self.resyncing {
                self.resyncing = true;
                self.sync_errors += 1;
                log::warn!(
                    "sync byte missing at offset {} (after packet {}), resynchronizing",
                    self.offset,
                    self.packet_no
                );
            }
            self.skip(1);
        }
    }

    fn is_aligned(&self, len: usize, sync: usize) -> bool {
        if self.buf[sync] != SYNC_BYTE {
            return false;
        }
        // while resynchronizing a lone 0x47 is not trusted; the next frame
        // must agree unless the source ends first
        !self.resyncing || self.buf.get(len + sync).map_or(true, |&b| b == SYNC_BYTE)
    }

    fn skip(&mut self, n: usize) {
        self.buf.advance(n);
        self.offset += n as u64;
        self.skipped_bytes += n as u64;
    }

    fn fill(&mut self, want: usize) -> Result<()> {
        while self.buf.len() < want && !self.eof {
            let start = self.buf.len();
            self.buf.resize(start + READ_CHUNK, 0);
            match self.reader.read(&mut self.buf[start..]) {
                Ok(0) => {
                    self.buf.truncate(start);
                    self.eof = true;
                }
                Ok(n) => self.buf.truncate(start + n),
                Err(e) if e.kind() == ErrorKind::Interrupted => self.buf.truncate(start),
                Err(e) => {
                    self.buf.truncate(start);
                    return Err(e.into());
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TsError;
    use pretty_assertions::assert_eq;
    use std::io::Cursor;

    fn frames(length: PacketLength, count: usize) -> Vec<u8> {
        let mut out = Vec::new();
        for i in 0..count {
            let mut frame = vec![0u8; length.bytes()];
            frame[length.sync_offset()] = SYNC_BYTE;
            frame[length.sync_offset() + 3] = 0x10 | (i as u8 & 0x0f);
            out.extend_from_slice(&frame);
        }
        out
    }

    #[test]
    fn test_detects_each_length() {
        for length in PacketLength::ALL {
            let data = frames(length, 8);
            assert_eq!(detect_packet_length(&data, DEFAULT_SEARCH_WINDOW), Ok((length, 0)));
        }
    }

    #[test]
    fn test_detect_after_garbage() {
        let mut data = vec![0x12u8; 77];
        data.extend(frames(PacketLength::Dvb204, 6));
        assert_eq!(
            detect_packet_length(&data, DEFAULT_SEARCH_WINDOW),
            Ok((PacketLength::Dvb204, 77))
        );
    }

    #[test]
    fn test_detect_failures() {
        let short = frames(PacketLength::Ts188, 4);
        assert_eq!(
            detect_packet_length(&short, DEFAULT_SEARCH_WINDOW),
            Err(FramingError::SourceTooShort { len: 752, required: 940 })
        );

        let noise = vec![0u8; 6000];
        assert_eq!(
            detect_packet_length(&noise, DEFAULT_SEARCH_WINDOW),
            Err(FramingError::NoSync { window: DEFAULT_SEARCH_WINDOW })
        );

        // a valid run starting past the window is not accepted
        let mut late = vec![0u8; 200];
        late.extend(frames(PacketLength::Ts188, 6));
        assert_eq!(
            detect_packet_length(&late, 100),
            Err(FramingError::NoSync { window: 100 })
        );
    }

    #[test]
    fn test_locator_yields_offsets() {
        let data = frames(PacketLength::Avchd192, 10);
        let mut locator = FrameLocator::new(Cursor::new(data), None, DEFAULT_SEARCH_WINDOW).unwrap();
        assert_eq!(locator.packet_length(), PacketLength::Avchd192);

        let mut offsets = Vec::new();
        while let Some(frame) = locator.next_frame().unwrap() {
            assert_eq!(frame.ts_packet()[0], SYNC_BYTE);
            assert_eq!(frame.packet_no as usize, offsets.len());
            offsets.push(frame.offset);
        }
        assert_eq!(offsets, (0..10).map(|i| i * 192).collect::<Vec<u64>>());
        assert_eq!(locator.sync_errors(), 0);
    }

    #[test]
    fn test_resync_after_inserted_bytes() {
        let mut data = frames(PacketLength::Ts188, 6);
        data.extend_from_slice(&[0xaa; 13]);
        data.extend(frames(PacketLength::Ts188, 4));

        let mut locator = FrameLocator::new(Cursor::new(data), None, DEFAULT_SEARCH_WINDOW).unwrap();
        let mut offsets = Vec::new();
        while let Some(frame) = locator.next_frame().unwrap() {
            offsets.push(frame.offset);
        }
        assert_eq!(offsets.len(), 10);
        assert_eq!(offsets[6], 6 * 188 + 13);
        assert_eq!(locator.sync_errors(), 1);
        assert_eq!(locator.skipped_bytes(), 13);
    }

    #[test]
    fn test_forced_length() {
        let data = frames(PacketLength::Ts188, 6);
        let locator =
            FrameLocator::new(Cursor::new(data.clone()), Some(PacketLength::Ts188), 5000).unwrap();
        assert_eq!(locator.packet_length(), PacketLength::Ts188);

        let err = FrameLocator::new(Cursor::new(data), Some(PacketLength::Atsc208), 5000).err();
        assert!(matches!(err, Some(TsError::Framing(FramingError::NoSync { .. }))));
    }

    #[test]
    fn test_trailing_partial_frame_is_ignored() {
        let mut data = frames(PacketLength::Ts188, 5);
        data.extend_from_slice(&[SYNC_BYTE, 0, 0]);
        let mut locator = FrameLocator::new(Cursor::new(data), None, DEFAULT_SEARCH_WINDOW).unwrap();
        let mut count = 0;
        while locator.next_frame().unwrap().is_some() {
            count += 1;
        }
        assert_eq!(count, 5);
    }
}
