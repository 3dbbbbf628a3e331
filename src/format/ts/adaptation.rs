//! Adaptation field decoding.
//!
//! Captured streams often carry adaptation fields that are truncated or
//! internally inconsistent. [`AdaptationField::parse`] reports those as an
//! error and the packet parser turns the error into "no adaptation field";
//! nested records that fail to decode are kept as opaque bytes instead.

use super::descriptor::{parse_descriptors, Descriptor};
use super::pes::parse_timestamp;
use crate::error::{Result, TsError};
use crate::utils::BitReader;
use bytes::Bytes;

/// Largest adaptation field that fits a 188-byte packet.
pub const MAX_ADAPTATION_FIELD_LENGTH: usize = 183;

/// Private data tag of announcement switching records.
pub const PRIVATE_TAG_ANNOUNCEMENT_SWITCHING: u8 = 0x01;
/// Private data tag of AU information records.
pub const PRIVATE_TAG_AU_INFORMATION: u8 = 0x02;
/// Private data tag of EBP records.
pub const PRIVATE_TAG_EBP: u8 = 0xa9;

/// A PCR or OPCR sample: 33-bit base at 90 kHz and 9-bit extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockReference {
    /// 33-bit base at 90 kHz.
    pub base: u64,
    /// 9-bit extension at 27 MHz.
    pub extension: u16,
}

impl ClockReference {
    /// Parses the 6-byte on-wire layout; the 6 reserved bits are ignored.
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < 6 {
            return None;
        }
        let base = ((data[0] as u64) << 25)
            | ((data[1] as u64) << 17)
            | ((data[2] as u64) << 9)
            | ((data[3] as u64) << 1)
            | ((data[4] & 0x80) as u64 >> 7);
        let extension = (((data[4] & 0x01) as u16) << 8) | data[5] as u16;
        Some(Self { base, extension })
    }

    /// The clock value in 27 MHz ticks.
    pub fn value(&self) -> u64 {
        self.base * 300 + self.extension as u64
    }
}

/// Announcement switching data carried in transport private data.
#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct AnnouncementSwitching {
    pub switching_flag: bool,
    pub announcement_type: u8,
    pub reference_type: u8,
}

impl AnnouncementSwitching {
    fn parse(data: &[u8]) -> Result<Self> {
        let mut r = BitReader::new(data);
        let switching_flag = r.read_flag()?;
        r.skip_bits(3)?;
        let announcement_type = r.read_bits(4)? as u8;
        r.skip_bits(5)?;
        let reference_type = r.read_bits(3)? as u8;
        Ok(Self { switching_flag, announcement_type, reference_type })
    }
}

/// Profile and level of an AU information record.
#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct AuProfile {
    pub profile: u8,
    pub constraint_flags: u8,
    pub level: u8,
}

/// Access-unit information carried in transport private data.
#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct AuInformation {
    pub coding_format: u8,
    pub coding_type_information: u8,
    pub ref_pic_idc: u8,
    pub pic_struct: u8,
    pub pts_32: Option<u32>,
    pub frame_rate_code: Option<u8>,
    pub profile: Option<AuProfile>,
    pub frame_field_encoding: Option<u8>,
    pub reserved: Bytes,
}

impl AuInformation {
    fn parse(data: &[u8]) -> Result<Self> {
        let mut r = BitReader::new(data);
        let coding_format = r.read_bits(4)? as u8;
        let coding_type_information = r.read_bits(4)? as u8;
        let ref_pic_idc = r.read_bits(2)? as u8;
        let pic_struct = r.read_bits(2)? as u8;
        let pts_present = r.read_flag()?;
        let profile_info_present = r.read_flag()?;
        let stream_info_present = r.read_flag()?;
        let trick_mode_info_present = r.read_flag()?;

        let pts_32 = if pts_present { Some(r.read_bits(32)?) } else { None };
        let frame_rate_code = if stream_info_present {
            r.skip_bits(4)?;
            Some(r.read_bits(4)? as u8)
        } else {
            None
        };
        let profile = if profile_info_present {
            Some(AuProfile {
                profile: r.read_u8()?,
                constraint_flags: r.read_u8()?,
                level: r.read_u8()?,
            })
        } else {
            None
        };
        let frame_field_encoding = if trick_mode_info_present {
            let v = r.read_bits(2)? as u8;
            r.skip_bits(6)?;
            Some(v)
        } else {
            None
        };

        Ok(Self {
            coding_format,
            coding_type_information,
            ref_pic_idc,
            pic_struct,
            pts_32,
            frame_rate_code,
            profile,
            frame_field_encoding,
            reserved: Bytes::copy_from_slice(r.remaining_bytes()),
        })
    }
}

/// Encoder boundary point information.
#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct EbpInfo {
    pub fragment_flag: bool,
    pub segment_flag: bool,
    pub sap_flag: bool,
    pub grouping_flag: bool,
    pub time_flag: bool,
    pub concealment_flag: bool,
    pub extension_flag: bool,
    pub ext_partition_flag: bool,
    pub sap_type: Option<u8>,
    /// Grouping ids in chain order, without their continuation bits.
    pub grouping_ids: Vec<u8>,
    /// NTP-format acquisition time.
    pub acquisition_time: Option<u64>,
    pub ext_partitions: Option<u8>,
    pub reserved: Bytes,
}

impl EbpInfo {
    fn parse(data: &[u8]) -> Result<Self> {
        let mut r = BitReader::new(data);
        let fragment_flag = r.read_flag()?;
        let segment_flag = r.read_flag()?;
        let sap_flag = r.read_flag()?;
        let grouping_flag = r.read_flag()?;
        let time_flag = r.read_flag()?;
        let concealment_flag = r.read_flag()?;
        r.skip_bits(1)?;
        let extension_flag = r.read_flag()?;

        let mut ext_partition_flag = false;
        if extension_flag {
            ext_partition_flag = r.read_flag()?;
            r.skip_bits(7)?;
        }

        let sap_type = if sap_flag {
            let v = r.read_bits(3)? as u8;
            r.skip_bits(5)?;
            Some(v)
        } else {
            None
        };

        let mut grouping_ids = Vec::new();
        if grouping_flag {
            loop {
                let more = r.read_flag()?;
                grouping_ids.push(r.read_bits(7)? as u8);
                if !more {
                    break;
                }
            }
        }

        let acquisition_time = if time_flag { Some(r.read_bits_u64(64)?) } else { None };
        let ext_partitions = if ext_partition_flag { Some(r.read_u8()?) } else { None };

        Ok(Self {
            fragment_flag,
            segment_flag,
            sap_flag,
            grouping_flag,
            time_flag,
            concealment_flag,
            extension_flag,
            ext_partition_flag,
            sap_type,
            grouping_ids,
            acquisition_time,
            ext_partitions,
            reserved: Bytes::copy_from_slice(r.remaining_bytes()),
        })
    }
}

/// One tag/length framed record of transport private data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrivateDataRecord {
    /// Announcement switching data.
    AnnouncementSwitching(AnnouncementSwitching),
    /// Access-unit information.
    AuInformation(AuInformation),
    /// Encoder boundary point.
    EbpInfo(EbpInfo),
    /// Any other tag, kept as raw bytes.
    Unknown {
        /// Record tag.
        tag: u8,
        /// Record payload after the length byte.
        data: Bytes,
    },
}

impl PrivateDataRecord {
    /// The record tag.
    pub fn tag(&self) -> u8 {
        match self {
            PrivateDataRecord::AnnouncementSwitching(_) => PRIVATE_TAG_ANNOUNCEMENT_SWITCHING,
            PrivateDataRecord::AuInformation(_) => PRIVATE_TAG_AU_INFORMATION,
            PrivateDataRecord::EbpInfo(_) => PRIVATE_TAG_EBP,
            PrivateDataRecord::Unknown { tag, .. } => *tag,
        }
    }
}

/// Splits transport private data into its records.
///
/// Private data is not required to be tag/length framed; anything that does
/// not frame cleanly ends up in a trailing `Unknown` record.
pub fn parse_private_records(data: &[u8]) -> Vec<PrivateDataRecord> {
    let mut records = Vec::new();
    let mut pos = 0;

    while pos + 2 <= data.len() {
        let tag = data[pos];
        let length = data[pos + 1] as usize;
        let end = pos + 2 + length;
        if end > data.len() {
            records.push(PrivateDataRecord::Unknown {
                tag,
                data: Bytes::copy_from_slice(&data[pos + 2..]),
            });
            return records;
        }

        let body = &data[pos + 2..end];
        let decoded = match tag {
            PRIVATE_TAG_ANNOUNCEMENT_SWITCHING => {
                AnnouncementSwitching::parse(body).map(PrivateDataRecord::AnnouncementSwitching)
            }
            PRIVATE_TAG_AU_INFORMATION => {
                AuInformation::parse(body).map(PrivateDataRecord::AuInformation)
            }
            PRIVATE_TAG_EBP => EbpInfo::parse(body).map(PrivateDataRecord::EbpInfo),
            _ => Err(TsError::Parser("unknown private data tag".into())),
        };
        records.push(decoded.unwrap_or_else(|_| PrivateDataRecord::Unknown {
            tag,
            data: Bytes::copy_from_slice(body),
        }));
        pos = end;
    }

    if pos < data.len() {
        records.push(PrivateDataRecord::Unknown {
            tag: data[pos],
            data: Bytes::new(),
        });
    }
    records
}

/// Legal time window of the extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct LegalTimeWindow {
    pub valid: bool,
    pub offset: u16,
}

/// Seamless splice of the extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct SeamlessSplice {
    pub splice_type: u8,
    /// DTS of the access unit after the splice point, 90 kHz.
    pub dts_next_au: u64,
}

/// The adaptation field extension.
#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct AdaptationExtension {
    pub length: usize,
    pub ltw_flag: bool,
    pub piecewise_rate_flag: bool,
    pub seamless_splice_flag: bool,
    pub af_descriptor_not_present: bool,
    pub ltw: Option<LegalTimeWindow>,
    pub piecewise_rate: Option<u32>,
    pub seamless_splice: Option<SeamlessSplice>,
    pub descriptors: Vec<Descriptor>,
}

impl AdaptationExtension {
    /// `data` starts after the extension length byte.
    fn parse(length: usize, data: &[u8]) -> Result<Self> {
        let flags = *data
            .first()
            .ok_or_else(|| TsError::InvalidData("empty adaptation field extension".into()))?;
        let mut ext = Self {
            length,
            ltw_flag: flags & 0x80 != 0,
            piecewise_rate_flag: flags & 0x40 != 0,
            seamless_splice_flag: flags & 0x20 != 0,
            af_descriptor_not_present: flags & 0x10 != 0,
            ltw: None,
            piecewise_rate: None,
            seamless_splice: None,
            descriptors: Vec::new(),
        };
        let mut pos = 1;

        if ext.ltw_flag {
            let b = take(data, pos, 2, "legal time window")?;
            ext.ltw = Some(LegalTimeWindow {
                valid: b[0] & 0x80 != 0,
                offset: ((b[0] as u16 & 0x7f) << 8) | b[1] as u16,
            });
            pos += 2;
        }
        if ext.piecewise_rate_flag {
            let b = take(data, pos, 3, "piecewise rate")?;
            ext.piecewise_rate =
                Some(((b[0] as u32 & 0x3f) << 16) | ((b[1] as u32) << 8) | b[2] as u32);
            pos += 3;
        }
        if ext.seamless_splice_flag {
            let b = take(data, pos, 5, "seamless splice")?;
            ext.seamless_splice = Some(SeamlessSplice {
                splice_type: b[0] >> 4,
                dts_next_au: parse_timestamp(b),
            });
            pos += 5;
        }
        if !ext.af_descriptor_not_present && pos < data.len() {
            ext.descriptors = parse_descriptors(&data[pos..])?;
        }
        Ok(ext)
    }
}

fn take<'a>(data: &'a [u8], pos: usize, n: usize, what: &str) -> Result<&'a [u8]> {
    data.get(pos..pos + n)
        .ok_or_else(|| TsError::InvalidData(format!("{} runs past adaptation field", what)))
}

/// A decoded adaptation field.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[allow(missing_docs)]
pub struct AdaptationField {
    /// Declared length, excluding the length byte.
    pub length: usize,
    pub discontinuity: bool,
    pub random_access: bool,
    pub es_priority: bool,
    pub pcr_flag: bool,
    pub opcr_flag: bool,
    pub splicing_point_flag: bool,
    pub private_data_flag: bool,
    pub extension_flag: bool,
    pub pcr: Option<ClockReference>,
    pub opcr: Option<ClockReference>,
    pub splice_countdown: Option<i8>,
    pub private_data: Option<Bytes>,
    pub private_records: Vec<PrivateDataRecord>,
    pub extension: Option<AdaptationExtension>,
    pub stuffing_len: usize,
}

impl AdaptationField {
    /// Decodes an adaptation field. `data` starts at the length byte and may be
    /// cut short by the packet boundary.
    pub fn parse(data: &[u8]) -> Result<Self> {
        let length = *data
            .first()
            .ok_or_else(|| TsError::InvalidData("adaptation field length byte missing".into()))?
            as usize;
        if length > MAX_ADAPTATION_FIELD_LENGTH {
            return Err(TsError::InvalidData(format!(
                "adaptation field length {} exceeds {}",
                length, MAX_ADAPTATION_FIELD_LENGTH
            )));
        }
        if length == 0 {
            return Ok(Self::default());
        }

        let body = &data[1..data.len().min(1 + length)];
        let flags = *body
            .first()
            .ok_or_else(|| TsError::InvalidData("adaptation field truncated".into()))?;
        let mut field = AdaptationField {
            length,
            discontinuity: (flags & 0x80) != 0,
            random_access: (flags & 0x40) != 0,
            es_priority: (flags & 0x20) != 0,
            pcr_flag: (flags & 0x10) != 0,
            opcr_flag: (flags & 0x08) != 0,
            splicing_point_flag: (flags & 0x04) != 0,
            private_data_flag: (flags & 0x02) != 0,
            extension_flag: (flags & 0x01) != 0,
            ..Default::default()
        };

        let mut pos = 1;

        if field.pcr_flag {
            field.pcr = ClockReference::parse(take(body, pos, 6, "PCR")?);
            pos += 6;
        }

        if field.opcr_flag {
            field.opcr = ClockReference::parse(take(body, pos, 6, "OPCR")?);
            pos += 6;
        }

        if field.splicing_point_flag {
            field.splice_countdown = Some(take(body, pos, 1, "splice countdown")?[0] as i8);
            pos += 1;
        }

        if field.private_data_flag {
            let private_data_length = take(body, pos, 1, "private data length")?[0] as usize;
            pos += 1;
            let private = take(body, pos, private_data_length, "private data")?;
            field.private_records = parse_private_records(private);
            field.private_data = Some(Bytes::copy_from_slice(private));
            pos += private_data_length;
        }

        if field.extension_flag && body.len() >= pos + 2 {
            let ext_length = body[pos] as usize;
            let ext_end = (pos + 1 + ext_length).min(body.len());
            match AdaptationExtension::parse(ext_length, &body[pos + 1..ext_end]) {
                Ok(ext) => field.extension = Some(ext),
                Err(e) => log::debug!("dropping adaptation field extension: {}", e),
            }
            pos += 1 + ext_length;
        }

        if pos > length {
            return Err(TsError::InvalidData(format!(
                "adaptation field consumes {} bytes, declares {}",
                pos, length
            )));
        }
        field.stuffing_len = body.len().saturating_sub(pos);
        Ok(field)
    }

    /// The PCR in 27 MHz ticks.
    pub fn pcr_value(&self) -> Option<u64> {
        self.pcr.map(|pcr| pcr.value())
    }

    /// The OPCR in 27 MHz ticks.
    pub fn opcr_value(&self) -> Option<u64> {
        self.opcr.map(|opcr| opcr.value())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn pcr_bytes(base: u64, ext: u16) -> [u8; 6] {
        [
            (base >> 25) as u8,
            (base >> 17) as u8,
            (base >> 9) as u8,
            (base >> 1) as u8,
            ((base & 1) << 7) as u8 | 0x7e | (ext >> 8) as u8,
            ext as u8,
        ]
    }

    #[test]
    fn test_pcr_and_splice() {
        let mut data = vec![0x00, 0x80 | 0x10 | 0x04];
        data.extend_from_slice(&pcr_bytes(0x1_2345_6789, 0x123));
        data.push(0xfe); // splice countdown -2
        data[0] = (data.len() - 1) as u8;

        let field = AdaptationField::parse(&data).unwrap();
        assert!(field.discontinuity);
        assert_eq!(field.pcr.unwrap().base, 0x1_2345_6789);
        assert_eq!(field.pcr.unwrap().extension, 0x123);
        assert_eq!(field.pcr_value(), Some(0x1_2345_6789 * 300 + 0x123));
        assert_eq!(field.splice_countdown, Some(-2));
        assert_eq!(field.stuffing_len, 0);
    }

    #[test]
    fn test_zero_length_field() {
        let field = AdaptationField::parse(&[0x00]).unwrap();
        assert_eq!(field.length, 0);
        assert!(!field.discontinuity);
        assert!(field.pcr.is_none());
    }

    #[test]
    fn test_truncated_pcr_is_an_error() {
        // declares a PCR but the packet ends after two bytes of it
        let data = [0x07, 0x10, 0x00, 0x00];
        assert!(AdaptationField::parse(&data).is_err());
        assert!(AdaptationField::parse(&[0xb8]).is_err());
    }

    #[test]
    fn test_stuffing_counted() {
        let data = [0x05, 0x40, 0xff, 0xff, 0xff, 0xff];
        let field = AdaptationField::parse(&data).unwrap();
        assert!(field.random_access);
        assert_eq!(field.stuffing_len, 4);
    }

    #[test]
    fn test_private_data_records() {
        let private = [
            // AU information: H.264, PTS present, stream info present
            0x02, 0x07, 0x13, 0x0a, 0x00, 0x00, 0x10, 0x00, 0x05,
            // announcement switching
            0x01, 0x02, 0x85, 0x03,
            // unknown tag
            0x7f, 0x02, 0xaa, 0xbb,
        ];
        let mut data = vec![0x00, 0x02, private.len() as u8];
        data.extend_from_slice(&private);
        data[0] = (data.len() - 1) as u8;

        let field = AdaptationField::parse(&data).unwrap();
        assert_eq!(field.private_data.as_deref(), Some(&private[..]));
        assert_eq!(field.private_records.len(), 3);

        match &field.private_records[0] {
            PrivateDataRecord::AuInformation(au) => {
                assert_eq!(au.coding_format, 1);
                assert_eq!(au.coding_type_information, 3);
                assert_eq!(au.pts_32, Some(0x0000_1000));
                assert_eq!(au.frame_rate_code, Some(5));
                assert!(au.profile.is_none());
                assert!(au.frame_field_encoding.is_none());
            }
            other => panic!("unexpected record {:?}", other),
        }
        assert_eq!(
            field.private_records[1],
            PrivateDataRecord::AnnouncementSwitching(AnnouncementSwitching {
                switching_flag: true,
                announcement_type: 5,
                reference_type: 3,
            })
        );
        assert_eq!(
            field.private_records[2],
            PrivateDataRecord::Unknown { tag: 0x7f, data: Bytes::from_static(&[0xaa, 0xbb]) }
        );
    }

    #[test]
    fn test_ebp_grouping_chain_and_time() {
        // SAP + grouping + time flags, no extension
        let body = [
            0b0011_1000,
            0b0110_0000, // SAP type 3
            0x81,        // grouping id 1, more follow
            0x82,        // grouping id 2, more follow
            0x05,        // grouping id 5, last
            0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08,
        ];
        let mut private = vec![PRIVATE_TAG_EBP, body.len() as u8];
        private.extend_from_slice(&body);

        let records = parse_private_records(&private);
        match &records[0] {
            PrivateDataRecord::EbpInfo(ebp) => {
                assert!(ebp.sap_flag && ebp.grouping_flag && ebp.time_flag);
                assert!(!ebp.fragment_flag);
                assert_eq!(ebp.sap_type, Some(3));
                assert_eq!(ebp.grouping_ids, vec![1, 2, 5]);
                assert_eq!(ebp.acquisition_time, Some(0x0102_0304_0506_0708));
                assert!(ebp.reserved.is_empty());
            }
            other => panic!("unexpected record {:?}", other),
        }
    }

    #[test]
    fn test_truncated_ebp_kept_opaque() {
        // time flag set but only 2 bytes of timestamp
        let private = [PRIVATE_TAG_EBP, 0x03, 0b0000_1000, 0x01, 0x02];
        let records = parse_private_records(&private);
        assert_eq!(
            records,
            vec![PrivateDataRecord::Unknown {
                tag: PRIVATE_TAG_EBP,
                data: Bytes::from_static(&[0b0000_1000, 0x01, 0x02]),
            }]
        );
    }

    #[test]
    fn test_extension_fields() {
        let ext = [
            0xc0, // ltw + piecewise, descriptors present
            0x81, 0x00, // ltw valid, offset 0x100
            0xc0, 0x12, 0x34, // piecewise rate 0x1234
            0x52, 0x01, 0x07, // stream_identifier descriptor
        ];
        let mut data = vec![0x00, 0x01, ext.len() as u8];
        data.extend_from_slice(&ext);
        data[0] = (data.len() - 1) as u8;

        let field = AdaptationField::parse(&data).unwrap();
        let ext = field.extension.unwrap();
        assert_eq!(ext.ltw, Some(LegalTimeWindow { valid: true, offset: 0x100 }));
        assert_eq!(ext.piecewise_rate, Some(0x1234));
        assert!(ext.seamless_splice.is_none());
        assert_eq!(ext.descriptors.len(), 1);
        assert_eq!(ext.descriptors[0].tag, 0x52);
    }

    #[test]
    fn test_broken_extension_dropped() {
        // extension declares a seamless splice it does not carry
        let data = [0x04, 0x01, 0x02, 0x20, 0x00];
        let field = AdaptationField::parse(&data).unwrap();
        assert!(field.extension_flag);
        assert!(field.extension.is_none());
    }
}
