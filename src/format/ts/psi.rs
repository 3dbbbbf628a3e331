use super::descriptor::{parse_descriptors, Descriptor};
use super::section::PsiSection;
use super::types::*;
use crate::error::{Result, TsError};
use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, NaiveTime, Utc};
use std::collections::{BTreeMap, HashMap};

/// How a completed section relates to the programs of the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SectionKind {
    /// Program association table.
    Pat,
    /// Conditional access table.
    Cat,
    /// Program map table.
    Pmt,
    /// Time and date table.
    TimeDate,
    /// Time offset table.
    TimeOffset,
    /// Any other table on a reserved PID (0x0000-0x001F).
    Standard,
    /// A table on a PID the registry knows nothing about.
    Generic,
}

/// One program of a PAT.
#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct PATEntry {
    pub program_number: u16,
    pub network_pid: u16,
    pub program_map_pid: u16,
}

/// One elementary stream of a PMT.
#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct ElementaryStreamInfo {
    pub stream_type: u8,
    pub elementary_pid: u16,
    pub descriptors: Vec<Descriptor>,
}

/// A program map table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct PMT {
    pub program_number: u16,
    pub pcr_pid: u16,
    pub program_descriptors: Vec<Descriptor>,
    pub elementary_stream_infos: Vec<ElementaryStreamInfo>,
}

/// Reads the program loop of a PAT table body.
pub fn parse_pat(data: &[u8]) -> Vec<PATEntry> {
    data.chunks_exact(4)
        .map(|entry| {
            let program_number = ((entry[0] as u16) << 8) | entry[1] as u16;
            let pid = ((entry[2] as u16 & 0x1f) << 8) | entry[3] as u16;
            PATEntry {
                program_number,
                network_pid: if program_number == 0 { pid } else { 0 },
                program_map_pid: if program_number != 0 { pid } else { 0 },
            }
        })
        .collect()
}

/// Reads a PMT table body.
pub fn parse_pmt(program_number: u16, data: &[u8]) -> Result<PMT> {
    let mut pmt = PMT {
        program_number,
        ..Default::default()
    };
    let end = data.len();
    let mut pos = 0;

    if pos + 4 > end {
        return Err(TsError::InvalidData("PMT too short for PCR PID and program info length".into()));
    }

    pmt.pcr_pid = ((data[pos] as u16 & 0x1f) << 8) | data[pos + 1] as u16;
    let program_info_length = ((data[pos + 2] as usize & 0x0f) << 8) | data[pos + 3] as usize;
    pos += 4;

    if pos + program_info_length > end {
        return Err(TsError::InvalidData("program info data too short".into()));
    }
    pmt.program_descriptors = parse_descriptors(&data[pos..pos + program_info_length])?;
    pos += program_info_length;

    while pos + 5 <= end {
        let stream_type = data[pos];
        let elementary_pid = ((data[pos + 1] as u16 & 0x1f) << 8) | data[pos + 2] as u16;
        let es_info_length = ((data[pos + 3] as usize & 0x0f) << 8) | data[pos + 4] as usize;
        pos += 5;

        if pos + es_info_length > end {
            return Err(TsError::InvalidData("ES info data too short".into()));
        }

        let descriptors = parse_descriptors(&data[pos..pos + es_info_length])?;
        pos += es_info_length;

        pmt.elementary_stream_infos.push(ElementaryStreamInfo {
            stream_type,
            elementary_pid,
            descriptors,
        });
    }

    Ok(pmt)
}

/// Decodes a 40-bit UTC_time field: 16-bit MJD followed by 6 BCD digits.
pub fn decode_utc_time(data: &[u8]) -> Option<DateTime<Utc>> {
    if data.len() < 5 {
        return None;
    }
    let mjd = ((data[0] as i64) << 8) | data[1] as i64;
    let date = NaiveDate::from_ymd_opt(1858, 11, 17)?.checked_add_signed(ChronoDuration::days(mjd))?;

    let bcd = |b: u8| -> Option<u32> {
        let (hi, lo) = (b >> 4, b & 0x0f);
        (hi <= 9 && lo <= 9).then(|| (hi * 10 + lo) as u32)
    };
    let time = NaiveTime::from_hms_opt(bcd(data[2])?, bcd(data[3])?, bcd(data[4])?)?;
    Some(date.and_time(time).and_utc())
}

/// The PAT/PMT view of the stream, needed to tell what a section is.
#[derive(Debug, Default, Clone)]
pub struct ProgramRegistry {
    programs: BTreeMap<u16, u16>,
    pmt_pids: HashMap<u16, u16>,
    pmts: BTreeMap<u16, PMT>,
    stream_types: HashMap<u16, u8>,
    network_pid: Option<u16>,
}

impl ProgramRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Classifies a section by PID and table id.
    pub fn classify(&self, pid: u16, table_id: u8) -> SectionKind {
        match (pid, table_id) {
            (PID_PAT, TABLE_ID_PAT) => SectionKind::Pat,
            (PID_CAT, TABLE_ID_CAT) => SectionKind::Cat,
            (pid, TABLE_ID_PMT) if self.is_pmt_pid(pid) => SectionKind::Pmt,
            (PID_TDT, TABLE_ID_TDT) => SectionKind::TimeDate,
            (PID_TDT, TABLE_ID_TOT) => SectionKind::TimeOffset,
            (pid, _) if pid < 0x20 => SectionKind::Standard,
            _ => SectionKind::Generic,
        }
    }

    /// Learns from PAT and PMT sections; other kinds are ignored.
    pub fn update(&mut self, kind: SectionKind, section: &PsiSection) -> Result<()> {
        match kind {
            SectionKind::Pat => {
                for entry in parse_pat(section.table_body()) {
                    if entry.program_number == 0 {
                        self.network_pid = Some(entry.network_pid);
                    } else {
                        self.programs.insert(entry.program_number, entry.program_map_pid);
                        self.pmt_pids.insert(entry.program_map_pid, entry.program_number);
                    }
                }
            }
            SectionKind::Pmt => {
                let program_number = section.table_id_extension.ok_or_else(|| {
                    TsError::InvalidData("PMT section without table_id_extension".into())
                })?;
                let pmt = parse_pmt(program_number, section.table_body())?;
                for info in &pmt.elementary_stream_infos {
                    self.stream_types.insert(info.elementary_pid, info.stream_type);
                }
                self.pmts.insert(program_number, pmt);
            }
            _ => {}
        }
        Ok(())
    }

    /// Whether a PAT announced `pid` as a PMT PID.
    pub fn is_pmt_pid(&self, pid: u16) -> bool {
        self.pmt_pids.contains_key(&pid)
    }

    /// PMT PID of a program.
    pub fn pmt_pid(&self, program_number: u16) -> Option<u16> {
        self.programs.get(&program_number).copied()
    }

    /// Network PID from program 0, if announced.
    pub fn network_pid(&self) -> Option<u16> {
        self.network_pid
    }

    /// Latest PMT of a program.
    pub fn pmt(&self, program_number: u16) -> Option<&PMT> {
        self.pmts.get(&program_number)
    }

    /// stream_type a PMT announced for an elementary PID.
    pub fn stream_type(&self, pid: u16) -> Option<u8> {
        self.stream_types.get(&pid).copied()
    }

    /// Program numbers with their PMT PIDs, in program order.
    pub fn programs(&self) -> impl Iterator<Item = (u16, u16)> + '_ {
        self.programs.iter().map(|(p, pid)| (*p, *pid))
    }
}
