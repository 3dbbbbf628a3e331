use super::avchd::ArrivalTimeTracker;
use super::framing::FrameLocator;
use super::parser::parse_packet;
use super::pes::PesPacket;
use super::pid::{PidChannel, PidKind, PidStatistics, Reassembled};
use super::psi::{decode_utc_time, ProgramRegistry, SectionKind};
use super::reader::PacketIndex;
use super::section::PsiSection;
use super::sink::{PesContext, SectionContext, StreamSink};
use super::types::*;
use crate::config::DemuxConfig;
use crate::error::Result;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Stops a running parse between two packets.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    /// A token that has not been cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation; the running parse stops before its next packet.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether [`cancel`](Self::cancel) has been called on any clone.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// How a parse pass ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseOutcome {
    /// The source was read to its end.
    Completed {
        /// Packets processed.
        packets: u64,
    },
    /// Stopped by a [`CancellationToken`]. Everything delivered so far is valid.
    Cancelled {
        /// Packets processed before the stop.
        packets: u64,
    },
}

impl ParseOutcome {
    /// Packets processed before the pass ended.
    pub fn packets(&self) -> u64 {
        match self {
            ParseOutcome::Completed { packets } | ParseOutcome::Cancelled { packets } => *packets,
        }
    }

    /// Whether the pass was stopped by its token.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ParseOutcome::Cancelled { .. })
    }
}

/// An absolute time read from a TDT or TOT.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeSample {
    /// Packet that carried the table.
    pub packet_no: u64,
    /// UTC time the table announced.
    pub time: DateTime<Utc>,
}

/// Where the stream bitrate came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitrateSource {
    /// Mean of the per-PID PCR bitrates.
    Pcr,
    /// Packets between the first and last time table.
    TimeTable,
}

/// Stream-wide timing derived after a pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamTimeModel {
    /// Framing the timing was derived for.
    pub packet_length: PacketLength,
    /// Bits per second.
    pub bitrate: Option<u64>,
    /// `None` when no bitrate could be derived.
    pub bitrate_source: Option<BitrateSource>,
    /// Earliest TDT or TOT.
    pub first_time_table: Option<TimeSample>,
    /// Wall-clock time of packet 0, back-calculated from the first time table.
    pub zero_time: Option<DateTime<Utc>>,
}

impl StreamTimeModel {
    /// Milliseconds from packet 0 to `packet_no` at the stream bitrate.
    pub fn packet_offset_ms(&self, packet_no: u64) -> Option<u64> {
        let bitrate = self.bitrate.filter(|&b| b > 0)?;
        let bits = packet_no as u128 * self.packet_length.bytes() as u128 * 8 * 1000;
        Some((bits / bitrate as u128) as u64)
    }

    /// Wall-clock time of a packet, when both a bitrate and a time table exist.
    pub fn packet_time(&self, packet_no: u64) -> Option<DateTime<Utc>> {
        let zero = self.zero_time?;
        let ms = i64::try_from(self.packet_offset_ms(packet_no)?).ok()?;
        zero.checked_add_signed(ChronoDuration::milliseconds(ms))
    }
}

/// Stream-wide counters.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StreamStatistics {
    /// `None` when framing was never established.
    pub packet_length: Option<PacketLength>,
    /// Packets read, including those with transport errors.
    pub packets: u64,
    /// Packets with transport_error_indicator set; these are not dispatched.
    pub transport_errors: u64,
    /// Lost-sync events.
    pub sync_errors: u64,
    /// Bytes skipped while resynchronizing or before the first packet.
    pub skipped_bytes: u64,
    /// Sections or PES packets discarded because a decoder or the sink failed.
    pub handler_errors: u64,
    /// Sections on unknown PIDs withheld from the sink.
    pub generic_sections_skipped: u64,
    /// Stream bitrate in bits per second, see [`StreamTimeModel`].
    pub bitrate: Option<u64>,
    /// Present for AVCHD sources only.
    pub avchd_rollovers: Option<u32>,
    /// One entry per PID seen, in PID order.
    pub pids: Vec<PidStatistics>,
}

/// Demultiplexes one transport stream per pass.
///
/// Packets are processed strictly in stream order. Completed PSI sections
/// and PES packets go to a [`StreamSink`]; per-PID state, the packet offset
/// index and the time model stay here for inspection after the pass.
#[derive(Debug)]
pub struct TransportStreamDemux {
    config: DemuxConfig,
    channels: Vec<Option<PidChannel>>,
    registry: ProgramRegistry,
    offsets: Vec<u64>,
    packet_length: Option<PacketLength>,
    packets: u64,
    transport_errors: u64,
    sync_errors: u64,
    skipped_bytes: u64,
    handler_errors: u64,
    generic_sections_skipped: u64,
    time_tables: Vec<TimeSample>,
    arrival: Option<ArrivalTimeTracker>,
    time_model: Option<StreamTimeModel>,
}

impl Default for TransportStreamDemux {
    fn default() -> Self {
        Self::new(DemuxConfig::default())
    }
}

impl TransportStreamDemux {
    /// A demux with empty state and the given options.
    pub fn new(config: DemuxConfig) -> Self {
        Self {
            config,
            channels: Self::empty_channels(),
            registry: ProgramRegistry::new(),
            offsets: Vec::new(),
            packet_length: None,
            packets: 0,
            transport_errors: 0,
            sync_errors: 0,
            skipped_bytes: 0,
            handler_errors: 0,
            generic_sections_skipped: 0,
            time_tables: Vec::new(),
            arrival: None,
            time_model: None,
        }
    }

    fn empty_channels() -> Vec<Option<PidChannel>> {
        std::iter::repeat_with(|| None).take(PID_COUNT).collect()
    }

    /// Options this demux was built with.
    pub fn config(&self) -> &DemuxConfig {
        &self.config
    }

    /// Drops everything learned from the previous pass.
    pub fn reset(&mut self) {
        let config = self.config.clone();
        *self = Self::new(config);
    }

    /// Parses a whole source from the start.
    ///
    /// Only framing failures are returned as errors; everything wrong inside
    /// the stream is counted and the parse carries on.
    pub fn parse<R: Read, S: StreamSink>(
        &mut self,
        reader: R,
        sink: &mut S,
        cancel: &CancellationToken,
    ) -> Result<ParseOutcome> {
        self.reset();
        let mut locator = FrameLocator::new(reader, self.config.packet_length, self.config.search_window)?;
        let packet_length = locator.packet_length();
        self.packet_length = Some(packet_length);
        if packet_length.is_avchd() {
            self.arrival = Some(ArrivalTimeTracker::new(self.config.avchd_time_correction));
        }
        log::info!("demultiplexing {}-byte packets", packet_length);

        let outcome = loop {
            if cancel.is_cancelled() {
                log::info!("parse cancelled after {} packets", self.packets);
                break ParseOutcome::Cancelled { packets: self.packets };
            }
            let frame = match locator.next_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    self.finish(sink);
                    break ParseOutcome::Completed { packets: self.packets };
                }
                Err(e) => {
                    self.sync_errors = locator.sync_errors();
                    self.skipped_bytes = locator.skipped_bytes();
                    return Err(e);
                }
            };
            self.process_frame(&frame, sink);
        };

        self.sync_errors = locator.sync_errors();
        self.skipped_bytes = locator.skipped_bytes();
        self.time_model = Some(self.compute_time_model(packet_length));
        log::info!(
            "{} packets, {} sync errors, {} transport errors",
            self.packets,
            self.sync_errors,
            self.transport_errors
        );
        Ok(outcome)
    }

    /// Opens `path` and runs [`parse`](Self::parse) over it.
    pub fn parse_file<P: AsRef<Path>, S: StreamSink>(
        &mut self,
        path: P,
        sink: &mut S,
        cancel: &CancellationToken,
    ) -> Result<ParseOutcome> {
        let file = File::open(path.as_ref())?;
        log::debug!("opened {}", path.as_ref().display());
        self.parse(file, sink, cancel)
    }

    /// Handles one frame in stream order.
    pub fn process_frame<S: StreamSink>(&mut self, frame: &RawFrame, sink: &mut S) {
        self.offsets.push(frame.offset);
        self.packets += 1;
        if let (Some(tracker), Some(prefix)) = (self.arrival.as_mut(), frame.avchd_prefix()) {
            tracker.record(prefix);
        }

        let packet = match parse_packet(frame.ts_packet()) {
            Ok(packet) => packet,
            Err(e) => {
                log::warn!("packet {} at offset {}: {}", frame.packet_no, frame.offset, e);
                return;
            }
        };
        if packet.header.transport_error {
            self.transport_errors += 1;
            log::debug!(
                "packet {} on pid 0x{:04x} has transport_error_indicator set",
                frame.packet_no,
                packet.header.pid
            );
            return;
        }

        let pid = packet.header.pid;
        let history_limit = self.config.continuity_history_limit;
        let channel = self.channels[pid as usize].get_or_insert_with(|| PidChannel::new(pid, history_limit));
        let completed = channel.process(&packet, frame.packet_no, frame.packet_length.bytes());
        let kind = channel.kind();

        for item in completed {
            match item {
                Reassembled::Section(section) => self.deliver_section(pid, section, sink),
                Reassembled::Pes(pes) => self.deliver_pes(pid, kind, pes, sink),
            }
        }
    }

    fn deliver_section<S: StreamSink>(&mut self, pid: u16, section: PsiSection, sink: &mut S) {
        let kind = self.registry.classify(pid, section.table_id);
        match kind {
            SectionKind::Pat | SectionKind::Pmt => {
                if let Err(e) = self.registry.update(kind, &section) {
                    log::warn!("pid 0x{:04x}: {:?} section from packet {} discarded: {}", pid, kind, section.packet_no, e);
                    self.handler_errors += 1;
                    return;
                }
            }
            SectionKind::TimeDate | SectionKind::TimeOffset => match decode_utc_time(section.body()) {
                Some(time) => self.time_tables.push(TimeSample {
                    packet_no: section.packet_no,
                    time,
                }),
                None => {
                    log::warn!("pid 0x{:04x}: undecodable UTC time in packet {}", pid, section.packet_no);
                    self.handler_errors += 1;
                    return;
                }
            },
            SectionKind::Generic if !self.config.capture_generic_psi => {
                self.generic_sections_skipped += 1;
                return;
            }
            _ => {}
        }

        let ctx = SectionContext {
            pid,
            kind,
            registry: &self.registry,
        };
        if let Err(e) = sink.on_section(&ctx, section) {
            log::warn!("pid 0x{:04x}: section handler failed: {}", pid, e);
            self.handler_errors += 1;
        }
    }

    fn deliver_pes<S: StreamSink>(&mut self, pid: u16, kind: PidKind, packet: PesPacket, sink: &mut S) {
        let ctx = PesContext {
            pid,
            kind,
            stream_type: self.registry.stream_type(pid),
        };
        if let Err(e) = sink.on_pes(&ctx, packet) {
            log::warn!("pid 0x{:04x}: PES handler failed: {}", pid, e);
            self.handler_errors += 1;
        }
    }

    /// Flushes unbounded PES packets still open at end of stream.
    fn finish<S: StreamSink>(&mut self, sink: &mut S) {
        for pid in 0..PID_COUNT {
            let Some(channel) = self.channels[pid].as_mut() else {
                continue;
            };
            let kind = channel.kind();
            if let Some(packet) = channel.finish() {
                self.deliver_pes(pid as u16, kind, packet, sink);
            }
        }
    }

    fn compute_time_model(&self, packet_length: PacketLength) -> StreamTimeModel {
        let pcr_rates: Vec<u64> = self.channels().filter_map(PidChannel::bitrate).collect();
        let (bitrate, bitrate_source) = if !pcr_rates.is_empty() {
            let sum: u128 = pcr_rates.iter().map(|&r| r as u128).sum();
            (Some((sum / pcr_rates.len() as u128) as u64), Some(BitrateSource::Pcr))
        } else {
            match self.time_table_bitrate(packet_length) {
                Some(rate) => (Some(rate), Some(BitrateSource::TimeTable)),
                None => (None, None),
            }
        };

        let first_time_table = self.time_tables.first().copied();
        let mut model = StreamTimeModel {
            packet_length,
            bitrate,
            bitrate_source,
            first_time_table,
            zero_time: None,
        };
        if let Some(first) = first_time_table {
            model.zero_time = model.packet_offset_ms(first.packet_no).and_then(|ms| {
                first
                    .time
                    .checked_sub_signed(ChronoDuration::milliseconds(i64::try_from(ms).ok()?))
            });
        }
        if let Some(rate) = bitrate {
            log::debug!("stream bitrate {} bit/s from {:?}", rate, bitrate_source);
        }
        model
    }

    fn time_table_bitrate(&self, packet_length: PacketLength) -> Option<u64> {
        let first = self.time_tables.first()?;
        let last = self.time_tables.last()?;
        let ms = (last.time - first.time).num_milliseconds();
        if ms <= 0 || last.packet_no <= first.packet_no {
            return None;
        }
        let bits = (last.packet_no - first.packet_no) as u128 * packet_length.bytes() as u128 * 8 * 1000;
        Some((bits / ms as u128) as u64)
    }

    /// All channels created so far, in PID order.
    pub fn channels(&self) -> impl Iterator<Item = &PidChannel> + '_ {
        self.channels.iter().flatten()
    }

    /// The channel of `pid`, if any packet on it was seen.
    pub fn channel(&self, pid: u16) -> Option<&PidChannel> {
        self.channels.get(pid as usize)?.as_ref()
    }

    /// PAT and PMT state learned so far.
    pub fn registry(&self) -> &ProgramRegistry {
        &self.registry
    }

    /// Framing of the last pass.
    pub fn packet_length(&self) -> Option<PacketLength> {
        self.packet_length
    }

    /// Packets processed in the last pass.
    pub fn packet_count(&self) -> u64 {
        self.packets
    }

    /// Absolute times from every TDT and TOT, in stream order.
    pub fn time_tables(&self) -> &[TimeSample] {
        &self.time_tables
    }

    /// Present after a parse pass, cancelled or not.
    pub fn time_model(&self) -> Option<&StreamTimeModel> {
        self.time_model.as_ref()
    }

    /// Present for AVCHD sources only.
    pub fn arrival_times(&self) -> Option<&ArrivalTimeTracker> {
        self.arrival.as_ref()
    }

    /// Frozen copy of the packet offsets for random access.
    pub fn packet_index(&self) -> Option<PacketIndex> {
        Some(PacketIndex::new(self.packet_length?, self.offsets.clone()))
    }

    /// Snapshot of the stream and per-PID counters.
    pub fn statistics(&self) -> StreamStatistics {
        StreamStatistics {
            packet_length: self.packet_length,
            packets: self.packets,
            transport_errors: self.transport_errors,
            sync_errors: self.sync_errors,
            skipped_bytes: self.skipped_bytes,
            handler_errors: self.handler_errors,
            generic_sections_skipped: self.generic_sections_skipped,
            bitrate: self.time_model.as_ref().and_then(|m| m.bitrate),
            avchd_rollovers: self.arrival.as_ref().map(ArrivalTimeTracker::rollovers),
            pids: self.channels().map(PidChannel::statistics).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::ts::sink::{CollectingSink, NullSink};
    use pretty_assertions::assert_eq;
    use std::io::Cursor;

    fn packet(pid: u16, unit_start: bool, counter: u8, payload: &[u8]) -> Vec<u8> {
        let mut data = vec![
            SYNC_BYTE,
            ((unit_start as u8) << 6) | (pid >> 8) as u8,
            pid as u8,
            0x10 | (counter & 0x0f),
        ];
        data.extend_from_slice(payload);
        data.resize(TS_PACKET_SIZE, STUFFING_BYTE);
        data
    }

    fn tdt_packet(counter: u8, utc: [u8; 5]) -> Vec<u8> {
        let mut payload = vec![0x00, TABLE_ID_TDT, 0x70, 0x05];
        payload.extend_from_slice(&utc);
        packet(PID_TDT, true, counter, &payload)
    }

    #[test]
    fn test_transport_error_packets_are_not_dispatched() {
        let mut stream = Vec::new();
        for cc in 0..6u8 {
            let mut p = packet(0x100, false, cc, &[0x11]);
            if cc == 3 {
                p[1] |= 0x80;
            }
            stream.extend(p);
        }
        let mut demux = TransportStreamDemux::default();
        let outcome = demux
            .parse(Cursor::new(stream), &mut NullSink, &CancellationToken::new())
            .unwrap();
        assert_eq!(outcome, ParseOutcome::Completed { packets: 6 });

        let stats = demux.statistics();
        assert_eq!(stats.transport_errors, 1);
        assert_eq!(stats.pids[0].packets, 5);
        // the lost counter 3 shows up as a gap
        assert_eq!(stats.pids[0].continuity_errors, 1);
    }

    #[test]
    fn test_time_table_bitrate_and_zero_time() {
        // 12:00:00 and 12:00:01 on MJD 0xc079, 1000 packets apart
        let mut stream = tdt_packet(0, [0xc0, 0x79, 0x12, 0x00, 0x00]);
        for i in 0..999u32 {
            stream.extend(packet(0x100, false, (i % 16) as u8, &[0x22]));
        }
        stream.extend(tdt_packet(1, [0xc0, 0x79, 0x12, 0x00, 0x01]));

        let mut demux = TransportStreamDemux::default();
        demux
            .parse(Cursor::new(stream), &mut NullSink, &CancellationToken::new())
            .unwrap();

        assert_eq!(demux.time_tables().len(), 2);
        let model = demux.time_model().unwrap();
        assert_eq!(model.bitrate_source, Some(BitrateSource::TimeTable));
        assert_eq!(model.bitrate, Some(1000 * 188 * 8));
        assert_eq!(model.zero_time, Some(demux.time_tables()[0].time));
        assert_eq!(
            model.packet_time(1000),
            Some(demux.time_tables()[1].time)
        );
    }

    #[test]
    fn test_reset_clears_state() {
        let mut stream = Vec::new();
        for cc in 0..5u8 {
            stream.extend(packet(0x100, false, cc, &[0x11]));
        }
        let mut demux = TransportStreamDemux::default();
        let mut sink = CollectingSink::new();
        demux
            .parse(Cursor::new(stream), &mut sink, &CancellationToken::new())
            .unwrap();
        assert!(demux.channel(0x100).is_some());

        demux.reset();
        assert!(demux.channel(0x100).is_none());
        assert_eq!(demux.packet_count(), 0);
        assert!(demux.time_model().is_none());
        assert!(demux.packet_index().is_none());
    }
}
