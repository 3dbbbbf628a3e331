use super::adaptation::{AdaptationField, MAX_ADAPTATION_FIELD_LENGTH};
use super::types::*;
use crate::error::{Result, TsError};

/// One transport packet split into header, adaptation field and payload.
#[derive(Debug, Clone)]
pub struct TsPacket<'a> {
    /// The fixed 4-byte header.
    pub header: TSHeader,
    /// `None` when absent or when it could not be decoded.
    pub adaptation: Option<AdaptationField>,
    /// Set when the header announced an adaptation field that failed to decode.
    pub adaptation_malformed: bool,
    /// Set when the header announced payload but its start could not be
    /// located, because the adaptation field length is out of range.
    pub payload_lost: bool,
    /// Payload bytes; empty when the packet carries none.
    pub payload: &'a [u8],
}

impl TsPacket<'_> {
    /// Whether the adaptation field sets discontinuity_indicator.
    pub fn discontinuity(&self) -> bool {
        self.adaptation.as_ref().is_some_and(|af| af.discontinuity)
    }

    /// The PCR in 27 MHz ticks, if present.
    pub fn pcr(&self) -> Option<u64> {
        self.adaptation.as_ref().and_then(|af| af.pcr_value())
    }
}

/// Decodes the 4-byte packet header.
pub fn parse_header(data: &[u8]) -> Result<TSHeader> {
    if data.len() < TS_HEADER_SIZE {
        return Err(TsError::InvalidData("TS packet too short".into()));
    }

    if data[0] != SYNC_BYTE {
        return Err(TsError::InvalidData(format!("invalid sync byte 0x{:02x}", data[0])));
    }

    Ok(TSHeader {
        sync_byte: data[0],
        transport_error: (data[1] & 0x80) != 0,
        payload_unit_start: (data[1] & 0x40) != 0,
        transport_priority: (data[1] & 0x20) != 0,
        pid: (((data[1] & 0x1F) as u16) << 8) | data[2] as u16,
        scrambling_control: (data[3] >> 6) & 0x03,
        adaptation_field_control: (data[3] >> 4) & 0x03,
        continuity_counter: data[3] & 0x0F,
    })
}

/// Splits a 188-byte packet. Only a bad header is an error. A broken
/// adaptation field leaves the packet without one; its payload is kept as
/// long as the declared field length still locates it.
pub fn parse_packet(data: &[u8]) -> Result<TsPacket<'_>> {
    let header = parse_header(data)?;
    let data = &data[..data.len().min(TS_PACKET_SIZE)];
    let mut packet = TsPacket {
        header,
        adaptation: None,
        adaptation_malformed: false,
        payload_lost: false,
        payload: &[],
    };

    let mut payload_offset = TS_HEADER_SIZE;
    if header.has_adaptation_field() {
        let af_data = &data[TS_HEADER_SIZE..];
        let declared = af_data.first().copied().unwrap_or(0) as usize;
        match AdaptationField::parse(af_data) {
            Ok(af) => packet.adaptation = Some(af),
            Err(e) => {
                log::debug!("pid 0x{:04x}: adaptation field treated as absent: {}", header.pid, e);
                packet.adaptation_malformed = true;
            }
        }
        if declared > MAX_ADAPTATION_FIELD_LENGTH {
            packet.payload_lost = header.has_payload();
            return Ok(packet);
        }
        payload_offset += 1 + declared;
    }

    if header.has_payload() && payload_offset < data.len() {
        packet.payload = &data[payload_offset..];
    }
    Ok(packet)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_ts_header() {
        let data = [
            0x47, // Sync byte
            0x41, // Payload unit start indicator set, PID high bits
            0x00, // PID low bits
            0x3a, // adaptation + payload, counter 10
        ];

        let header = parse_header(&data).unwrap();
        assert_eq!(header.sync_byte, 0x47);
        assert!(header.payload_unit_start);
        assert_eq!(header.pid, 0x100);
        assert!(header.has_adaptation_field());
        assert!(header.has_payload());
        assert_eq!(header.continuity_counter, 10);
        assert!(parse_header(&[0x46, 0, 0, 0]).is_err());
    }

    #[test]
    fn test_payload_after_adaptation_field() {
        let mut data = vec![0x47, 0x01, 0x00, 0x30, 0x03, 0x00, 0xff, 0xff];
        data.resize(TS_PACKET_SIZE, 0xaa);
        let packet = parse_packet(&data).unwrap();
        assert_eq!(packet.adaptation.as_ref().unwrap().stuffing_len, 2);
        assert_eq!(packet.payload.len(), TS_PACKET_SIZE - 8);
        assert!(packet.payload.iter().all(|&b| b == 0xaa));
    }

    #[test]
    fn test_adaptation_length_out_of_range_loses_payload() {
        let mut data = vec![0x47, 0x01, 0x00, 0x30, 0xc8];
        data.resize(TS_PACKET_SIZE, 0x00);
        let packet = parse_packet(&data).unwrap();
        assert!(packet.adaptation.is_none());
        assert!(packet.adaptation_malformed);
        assert!(packet.payload_lost);
        assert!(packet.payload.is_empty());
        assert!(!packet.discontinuity());
    }

    #[test]
    fn test_malformed_adaptation_field_keeps_payload() {
        // length 3, private data flag, private length 5 runs past the field
        let mut data = vec![0x47, 0x01, 0x00, 0x30, 0x03, 0x02, 0x05, 0x00];
        data.resize(TS_PACKET_SIZE, 0xaa);
        let packet = parse_packet(&data).unwrap();
        assert!(packet.adaptation.is_none());
        assert!(packet.adaptation_malformed);
        assert!(!packet.payload_lost);
        assert_eq!(packet.payload.len(), TS_PACKET_SIZE - 8);
        assert!(packet.payload.iter().all(|&b| b == 0xaa));
    }
}
