use std::env;
use tsprobe::config::DemuxConfig;
use tsprobe::error::TsError;
use tsprobe::format::ts::{
    format_pcr, CancellationToken, CollectingSink, DecodedDescriptor, DescriptorRegistry,
    PacketReader, TransportStreamDemux,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let path = env::args().nth(1).ok_or("usage: ts_stats <file.ts>")?;
    let config = DemuxConfig::load();

    // The demux pass is blocking and strictly sequential
    let parse_path = path.clone();
    let (demux, sink, outcome) = tokio::task::spawn_blocking(move || {
        let mut demux = TransportStreamDemux::new(config);
        let mut sink = CollectingSink::new();
        let outcome = demux.parse_file(&parse_path, &mut sink, &CancellationToken::new());
        outcome.map(|o| (demux, sink, o))
    })
    .await??;

    let stats = demux.statistics();
    println!("{}: {} packets", path, outcome.packets());
    if let Some(length) = stats.packet_length {
        println!("packet length: {} bytes", length);
    }
    println!(
        "sync errors: {}, transport errors: {}, bitrate: {:?} bit/s",
        stats.sync_errors, stats.transport_errors, stats.bitrate
    );
    if let Some(zero) = demux.time_model().and_then(|m| m.zero_time) {
        println!("zero time: {}", zero);
    }

    println!();
    println!("  pid   kind          packets  dups  cc-err  pcr range");
    for pid in &stats.pids {
        let pcr_range = match (pid.first_pcr, pid.last_pcr) {
            (Some(first), Some(last)) => format!("{} - {}", format_pcr(first.pcr), format_pcr(last.pcr)),
            _ => String::new(),
        };
        println!(
            "0x{:04x}  {:<12} {:>8} {:>5} {:>7}  {}",
            pid.pid,
            format!("{:?}", pid.kind),
            pid.packets,
            pid.duplicates,
            pid.continuity_errors,
            pcr_range
        );
    }

    let mut descriptors = DescriptorRegistry::new();
    descriptors.register(0x0a, "ISO_639_language", |data| {
        let code = data
            .get(..3)
            .ok_or_else(|| TsError::InvalidData("ISO_639_language descriptor too short".into()))?;
        Ok(vec![("language", String::from_utf8_lossy(code).into_owned())])
    });
    for (program, _) in demux.registry().programs() {
        let Some(pmt) = demux.registry().pmt(program) else {
            continue;
        };
        println!();
        println!("program {} (PCR pid 0x{:04x})", program, pmt.pcr_pid);
        for es in &pmt.elementary_stream_infos {
            println!("  pid 0x{:04x} stream_type 0x{:02x}", es.elementary_pid, es.stream_type);
            for descriptor in &es.descriptors {
                match descriptors.decode(descriptor) {
                    DecodedDescriptor::Fields { name, fields } => println!("    {}: {:?}", name, fields),
                    DecodedDescriptor::Opaque(d) => println!("    tag 0x{:02x}, {} bytes", d.tag, d.data.len()),
                }
            }
        }
    }
    println!();
    println!("{} sections, {} PES packets", sink.sections.len(), sink.pes_packets.len());

    if let Some(index) = demux.packet_index().filter(|i| !i.is_empty()) {
        let reader = PacketReader::open(&path, index)?;
        let first = reader.read_packet_async(0).await?;
        println!("first packet at offset {}: {:02x?}", first.offset, &first.ts_packet()[..4]);
    }

    Ok(())
}
