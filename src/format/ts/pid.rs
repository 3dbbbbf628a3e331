use super::parser::TsPacket;
use super::pes::{PesPacket, PesReassembler};
use super::section::{PsiSection, SectionReassembler};
use super::types::{PCR_HZ, PID_NULL};

/// What a PID has been found to carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PidKind {
    /// No payload-unit-start seen yet.
    #[default]
    Unclassified,
    /// Carries PSI sections.
    Psi,
    /// Carries PES packets.
    Pes,
    /// The null PID 0x1FFF.
    Null,
}

/// How a packet fits the PID's continuity counter sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketVerdict {
    /// Counter advanced as expected.
    Normal,
    /// Same counter repeated with payload.
    Duplicate,
    /// Any other counter jump.
    ContinuityError,
}

/// One continuity counter violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContinuityError {
    /// Packet number of the last good packet.
    pub last_packet_no: u64,
    /// Its counter.
    pub last_counter: u8,
    /// Packet number of the offending packet.
    pub packet_no: u64,
    /// Its counter.
    pub counter: u8,
}

/// A PCR together with the packet that carried it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PcrSample {
    /// 27 MHz ticks.
    pub pcr: u64,
    /// Packet that carried the PCR.
    pub packet_no: u64,
}

/// A payload completed by one of the PID's reassemblers.
#[derive(Debug, Clone)]
pub enum Reassembled {
    /// A complete PSI section.
    Section(PsiSection),
    /// A complete PES packet.
    Pes(PesPacket),
}

#[derive(Debug)]
enum Reassembler {
    None,
    Section(SectionReassembler),
    Pes(PesReassembler),
}

/// Counters of one PID at a point in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PidStatistics {
    /// PID number.
    pub pid: u16,
    /// What the PID carries.
    pub kind: PidKind,
    /// Packets seen.
    pub packets: u64,
    /// Packets judged normal.
    pub normal_packets: u64,
    /// Duplicate packets.
    pub duplicates: u64,
    /// Continuity errors.
    pub continuity_errors: u64,
    /// Whether any packet was scrambled.
    pub scrambled: bool,
    /// Start of the current PCR run.
    pub first_pcr: Option<PcrSample>,
    /// Latest PCR of the current run.
    pub last_pcr: Option<PcrSample>,
    /// Bits per second derived from the current PCR run.
    pub bitrate: Option<u64>,
    /// Sections delivered.
    pub sections: u64,
    /// PES packets delivered.
    pub pes_packets: u64,
    /// Sections or PES packets dropped incomplete or with a length mismatch.
    pub dropped_units: u64,
    /// The first continuity errors, up to the configured limit.
    pub continuity_error_log: Vec<ContinuityError>,
}

/// Per-PID packet state: continuity tracking, PCR history and payload routing.
#[derive(Debug)]
pub struct PidChannel {
    pid: u16,
    kind: PidKind,
    last_counter: Option<u8>,
    last_packet_no: Option<u64>,
    in_duplicate_run: bool,

    packets: u64,
    normal_packets: u64,
    duplicates: u64,
    continuity_errors: u64,
    error_log: Vec<ContinuityError>,
    error_log_limit: usize,
    scrambled: bool,

    pcr_restart: bool,
    first_pcr: Option<PcrSample>,
    last_pcr: Option<PcrSample>,
    bitrate: Option<u64>,

    sections: u64,
    pes_packets: u64,
    reassembler: Reassembler,
}

impl PidChannel {
    /// A fresh channel keeping at most `error_log_limit` continuity errors.
    pub fn new(pid: u16, error_log_limit: usize) -> Self {
        Self {
            pid,
            kind: PidKind::Unclassified,
            last_counter: None,
            last_packet_no: None,
            in_duplicate_run: false,
            packets: 0,
            normal_packets: 0,
            duplicates: 0,
            continuity_errors: 0,
            error_log: Vec::new(),
            error_log_limit,
            scrambled: false,
            pcr_restart: false,
            first_pcr: None,
            last_pcr: None,
            bitrate: None,
            sections: 0,
            pes_packets: 0,
            reassembler: Reassembler::None,
        }
    }

    /// PID number.
    pub fn pid(&self) -> u16 {
        self.pid
    }

    /// What the PID carries, once known.
    pub fn kind(&self) -> PidKind {
        self.kind
    }

    /// Packets seen.
    pub fn packets(&self) -> u64 {
        self.packets
    }

    /// Bits per second of the current PCR run.
    pub fn bitrate(&self) -> Option<u64> {
        self.bitrate
    }

    /// Recorded continuity errors.
    pub fn continuity_error_log(&self) -> &[ContinuityError] {
        &self.error_log
    }

    /// Updates the channel with one packet and returns any payloads it completes.
    pub fn process(&mut self, packet: &TsPacket<'_>, packet_no: u64, packet_length: usize) -> Vec<Reassembled> {
        self.packets += 1;
        self.classify(packet);
        self.track_pcr(packet, packet_no, packet_length);

        let verdict = self.verdict(packet);
        let counter = packet.header.continuity_counter;
        match verdict {
            PacketVerdict::Normal => {
                self.normal_packets += 1;
                self.in_duplicate_run = false;
            }
            PacketVerdict::Duplicate => {
                self.duplicates += 1;
                if self.in_duplicate_run {
                    log::warn!(
                        "pid 0x{:04x}: illegal repeated duplicate, packet {} counter {}",
                        self.pid,
                        packet_no,
                        counter
                    );
                }
                self.in_duplicate_run = true;
                return Vec::new();
            }
            PacketVerdict::ContinuityError => {
                self.record_continuity_error(packet_no, counter);
                self.in_duplicate_run = false;
                self.reset_reassembler();
            }
        }
        self.last_counter = Some(counter);
        self.last_packet_no = Some(packet_no);

        if packet.header.is_scrambled() {
            self.scrambled = true;
            return Vec::new();
        }
        if packet.payload_lost {
            // the next payload cannot be appended after a gap
            self.reset_reassembler();
            return Vec::new();
        }
        self.route(packet, packet_no)
    }

    fn classify(&mut self, packet: &TsPacket<'_>) {
        if self.kind != PidKind::Unclassified {
            return;
        }
        if self.pid == PID_NULL {
            self.kind = PidKind::Null;
            return;
        }
        if !packet.header.payload_unit_start || packet.payload.is_empty() {
            return;
        }

        if packet.payload.starts_with(&[0x00, 0x00, 0x01]) {
            self.kind = PidKind::Pes;
            self.reassembler = Reassembler::Pes(PesReassembler::new());
        } else {
            self.kind = PidKind::Psi;
            self.reassembler = Reassembler::Section(SectionReassembler::new());
        }
        log::debug!("pid 0x{:04x} classified as {:?}", self.pid, self.kind);
    }

    /// Decides whether a packet continues the PID's counter sequence.
    pub fn verdict(&self, packet: &TsPacket<'_>) -> PacketVerdict {
        let Some(last) = self.last_counter else {
            return PacketVerdict::Normal;
        };
        let counter = packet.header.continuity_counter;
        let has_payload = packet.header.has_payload();

        if self.pid == PID_NULL || packet.discontinuity() {
            PacketVerdict::Normal
        } else if has_payload && counter == (last + 1) % 16 {
            PacketVerdict::Normal
        } else if !has_payload && counter == last {
            // the counter only advances with payload
            PacketVerdict::Normal
        } else if has_payload && counter == last {
            PacketVerdict::Duplicate
        } else {
            PacketVerdict::ContinuityError
        }
    }

    fn record_continuity_error(&mut self, packet_no: u64, counter: u8) {
        self.continuity_errors += 1;
        let error = ContinuityError {
            last_packet_no: self.last_packet_no.unwrap_or(0),
            last_counter: self.last_counter.unwrap_or(0),
            packet_no,
            counter,
        };
        if self.error_log.len() < self.error_log_limit {
            log::warn!(
                "pid 0x{:04x}: continuity error, packet {} counter {} after packet {} counter {}",
                self.pid,
                error.packet_no,
                error.counter,
                error.last_packet_no,
                error.last_counter
            );
            self.error_log.push(error);
        }
    }

    fn track_pcr(&mut self, packet: &TsPacket<'_>, packet_no: u64, packet_length: usize) {
        if packet.discontinuity() {
            self.pcr_restart = true;
            return;
        }
        let Some(pcr) = packet.pcr() else {
            return;
        };
        let sample = PcrSample { pcr, packet_no };

        match self.first_pcr {
            Some(first) if !self.pcr_restart && pcr > first.pcr && packet_no > first.packet_no => {
                self.last_pcr = Some(sample);
                let bits = (packet_no - first.packet_no) as u128
                    * packet_length as u128
                    * PCR_HZ as u128
                    * 8;
                self.bitrate = Some((bits / (pcr - first.pcr) as u128) as u64);
            }
            Some(first) if !self.pcr_restart => {
                log::debug!(
                    "pid 0x{:04x}: PCR went from {} to {} at packet {}, starting a new run",
                    self.pid,
                    first.pcr,
                    pcr,
                    packet_no
                );
                self.first_pcr = Some(sample);
                self.last_pcr = None;
            }
            _ => {
                self.first_pcr = Some(sample);
                self.last_pcr = None;
                self.pcr_restart = false;
            }
        }
    }

    fn route(&mut self, packet: &TsPacket<'_>, packet_no: u64) -> Vec<Reassembled> {
        let unit_start = packet.header.payload_unit_start;
        let done: Vec<Reassembled> = match &mut self.reassembler {
            Reassembler::None => return Vec::new(),
            Reassembler::Section(r) => r
                .push(self.pid, unit_start, packet.payload, packet_no)
                .into_iter()
                .map(Reassembled::Section)
                .collect(),
            Reassembler::Pes(r) => r
                .push(self.pid, unit_start, packet.payload, packet_no)
                .into_iter()
                .map(Reassembled::Pes)
                .collect(),
        };
        for item in &done {
            match item {
                Reassembled::Section(_) => self.sections += 1,
                Reassembled::Pes(_) => self.pes_packets += 1,
            }
        }
        done
    }

    /// Drops whatever the reassembler has buffered.
    pub fn reset_reassembler(&mut self) {
        let dropped = match &mut self.reassembler {
            Reassembler::None => false,
            Reassembler::Section(r) => r.reset(),
            Reassembler::Pes(r) => r.reset(),
        };
        if dropped {
            log::debug!("pid 0x{:04x}: partial payload discarded", self.pid);
        }
    }

    /// Closes the channel at end of stream. An unbounded PES packet in
    /// flight is complete by definition; anything else is dropped.
    pub fn finish(&mut self) -> Option<PesPacket> {
        match &mut self.reassembler {
            Reassembler::Pes(r) if r.in_progress() && !r.is_complete() => {
                let packet = r.finalize(self.pid)?;
                if packet.is_bounded() {
                    log::warn!(
                        "pid 0x{:04x}: stream ended inside a PES packet ({} bytes buffered)",
                        self.pid,
                        packet.data().len()
                    );
                    None
                } else {
                    self.pes_packets += 1;
                    Some(packet)
                }
            }
            Reassembler::Section(r) => {
                if r.reset() {
                    log::debug!("pid 0x{:04x}: stream ended inside a section", self.pid);
                }
                None
            }
            _ => None,
        }
    }

    /// Snapshot of the channel counters.
    pub fn statistics(&self) -> PidStatistics {
        let dropped_units = match &self.reassembler {
            Reassembler::None => 0,
            Reassembler::Section(r) => r.sections_dropped(),
            Reassembler::Pes(r) => r.length_mismatches(),
        };
        PidStatistics {
            pid: self.pid,
            kind: self.kind,
            packets: self.packets,
            normal_packets: self.normal_packets,
            duplicates: self.duplicates,
            continuity_errors: self.continuity_errors,
            scrambled: self.scrambled,
            first_pcr: self.first_pcr,
            last_pcr: self.last_pcr,
            bitrate: self.bitrate,
            sections: self.sections,
            pes_packets: self.pes_packets,
            dropped_units,
            continuity_error_log: self.error_log.clone(),
        }
    }
}
