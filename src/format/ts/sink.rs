use super::pes::PesPacket;
use super::pid::PidKind;
use super::psi::{ProgramRegistry, SectionKind};
use super::section::PsiSection;
use crate::error::Result;

/// What the demux knows about a section when it hands it over.
#[derive(Debug, Clone, Copy)]
pub struct SectionContext<'a> {
    /// PID the section arrived on.
    pub pid: u16,
    /// How the registry classified it.
    pub kind: SectionKind,
    /// PAT/PMT state as of this section, already updated if it is a PAT or PMT.
    pub registry: &'a ProgramRegistry,
}

/// What the demux knows about a PES packet when it hands it over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PesContext {
    /// PID the packet arrived on.
    pub pid: u16,
    /// What the PID carries.
    pub kind: PidKind,
    /// stream_type from the PMT, if one announced this PID.
    pub stream_type: Option<u8>,
}

/// Receives reassembled payloads from [`TransportStreamDemux`](super::TransportStreamDemux).
///
/// Errors returned here are logged and counted; the section or packet is
/// discarded and demultiplexing continues.
pub trait StreamSink {
    /// Called once per completed PSI section.
    fn on_section(&mut self, ctx: &SectionContext<'_>, section: PsiSection) -> Result<()> {
        let _ = (ctx, section);
        Ok(())
    }

    /// Called once per completed (or finalized unbounded) PES packet.
    fn on_pes(&mut self, ctx: &PesContext, packet: PesPacket) -> Result<()> {
        let _ = (ctx, packet);
        Ok(())
    }
}

/// Discards everything; useful when only statistics are wanted.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl StreamSink for NullSink {}

/// Keeps every section and PES packet in arrival order.
#[derive(Debug, Default)]
pub struct CollectingSink {
    /// PID, kind and section, in arrival order.
    pub sections: Vec<(u16, SectionKind, PsiSection)>,
    /// Context and packet, in arrival order.
    pub pes_packets: Vec<(PesContext, PesPacket)>,
}

impl CollectingSink {
    /// An empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sections that arrived on `pid`.
    pub fn sections_on(&self, pid: u16) -> impl Iterator<Item = &PsiSection> + '_ {
        self.sections
            .iter()
            .filter(move |(p, _, _)| *p == pid)
            .map(|(_, _, s)| s)
    }
}

impl StreamSink for CollectingSink {
    fn on_section(&mut self, ctx: &SectionContext<'_>, section: PsiSection) -> Result<()> {
        self.sections.push((ctx.pid, ctx.kind, section));
        Ok(())
    }

    fn on_pes(&mut self, ctx: &PesContext, packet: PesPacket) -> Result<()> {
        self.pes_packets.push((*ctx, packet));
        Ok(())
    }
}
