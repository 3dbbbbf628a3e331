//! Random access to packets of an already parsed source.
//!
//! The offset index is frozen once a pass ends, so any number of readers
//! can share it. Blocking reads go through one file handle behind a lock;
//! async reads open their own handle per call.

use super::types::{PacketLength, RawFrame};
use crate::error::{Result, TsError};
use bytes::Bytes;
use parking_lot::Mutex;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

/// Byte offset of every packet, by packet number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketIndex {
    packet_length: PacketLength,
    offsets: Arc<[u64]>,
}

impl PacketIndex {
    /// Index over `offsets`, one per packet.
    pub fn new(packet_length: PacketLength, offsets: Vec<u64>) -> Self {
        Self {
            packet_length,
            offsets: offsets.into(),
        }
    }

    /// Framing of the indexed stream.
    pub fn packet_length(&self) -> PacketLength {
        self.packet_length
    }

    /// Packets in the index.
    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    /// Whether the index holds no packets.
    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    /// Byte offset of `packet_no`.
    pub fn offset(&self, packet_no: u64) -> Result<u64> {
        usize::try_from(packet_no)
            .ok()
            .and_then(|i| self.offsets.get(i).copied())
            .ok_or(TsError::PacketOutOfRange {
                packet_no,
                packet_count: self.offsets.len() as u64,
            })
    }
}

/// Re-reads single packets by number.
#[derive(Debug)]
pub struct PacketReader {
    path: PathBuf,
    file: Mutex<File>,
    index: PacketIndex,
}

impl PacketReader {
    /// Opens the source the index was built from.
    pub fn open<P: AsRef<Path>>(path: P, index: PacketIndex) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        Ok(Self {
            path,
            file: Mutex::new(file),
            index,
        })
    }

    /// The index in use.
    pub fn index(&self) -> &PacketIndex {
        &self.index
    }

    fn frame(&self, packet_no: u64, offset: u64, data: Vec<u8>) -> RawFrame {
        RawFrame {
            data: Bytes::from(data),
            offset,
            packet_no,
            packet_length: self.index.packet_length,
        }
    }

    /// Reads one frame, blocking.
    pub fn read_packet(&self, packet_no: u64) -> Result<RawFrame> {
        let offset = self.index.offset(packet_no)?;
        let mut data = vec![0u8; self.index.packet_length.bytes()];
        {
            let mut file = self.file.lock();
            file.seek(SeekFrom::Start(offset))?;
            file.read_exact(&mut data)?;
        }
        Ok(self.frame(packet_no, offset, data))
    }

    /// Reads one frame without blocking the async runtime.
    pub async fn read_packet_async(&self, packet_no: u64) -> Result<RawFrame> {
        let offset = self.index.offset(packet_no)?;
        let mut data = vec![0u8; self.index.packet_length.bytes()];
        let mut file = tokio::fs::File::open(&self.path).await?;
        file.seek(SeekFrom::Start(offset)).await?;
        file.read_exact(&mut data).await?;
        Ok(self.frame(packet_no, offset, data))
    }

    /// Reads several packets concurrently; fails if any read fails.
    pub async fn read_packets_async(&self, packet_nos: &[u64]) -> Result<Vec<RawFrame>> {
        futures::future::try_join_all(packet_nos.iter().map(|&n| self.read_packet_async(n))).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::ts::types::{SYNC_BYTE, TS_PACKET_SIZE};
    use pretty_assertions::assert_eq;
    use std::io::Write;
    use std::thread;

    fn write_packets(count: usize) -> (tempfile::NamedTempFile, PacketIndex) {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        for i in 0..count {
            let mut packet = vec![i as u8; TS_PACKET_SIZE];
            packet[0] = SYNC_BYTE;
            file.write_all(&packet).unwrap();
        }
        file.flush().unwrap();
        let offsets = (0..count as u64).map(|i| i * TS_PACKET_SIZE as u64).collect();
        (file, PacketIndex::new(PacketLength::Ts188, offsets))
    }

    #[test]
    fn test_read_packet() {
        let (file, index) = write_packets(4);
        let reader = PacketReader::open(file.path(), index).unwrap();

        let frame = reader.read_packet(2).unwrap();
        assert_eq!(frame.offset, 376);
        assert_eq!(frame.data[0], SYNC_BYTE);
        assert_eq!(frame.data[1], 2);

        assert!(matches!(
            reader.read_packet(4),
            Err(TsError::PacketOutOfRange { packet_no: 4, packet_count: 4 })
        ));
    }

    #[test]
    fn test_concurrent_reads() {
        let (file, index) = write_packets(16);
        let reader = Arc::new(PacketReader::open(file.path(), index).unwrap());

        let handles: Vec<_> = (0..8u64)
            .map(|t| {
                let reader = Arc::clone(&reader);
                thread::spawn(move || {
                    for n in (t..16).step_by(8) {
                        let frame = reader.read_packet(n).unwrap();
                        assert_eq!(frame.data[5], n as u8);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
    }

    #[tokio::test]
    async fn test_read_packets_async() {
        let (file, index) = write_packets(10);
        let reader = PacketReader::open(file.path(), index).unwrap();

        let frames = reader.read_packets_async(&[9, 0, 5]).await.unwrap();
        let numbers: Vec<u8> = frames.iter().map(|f| f.data[1]).collect();
        assert_eq!(numbers, vec![9, 0, 5]);

        assert!(reader.read_packet_async(10).await.is_err());
    }
}
