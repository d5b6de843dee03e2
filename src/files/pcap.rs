//! Legacy pcap processing: read, walk every packet, write the anonymized
//! capture and quarantine dropped packets in their original form.

use anyhow::{Context, Result};
use pcap_parser::traits::PcapReaderIterator;
use pcap_parser::*;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;
use tracing::{debug, info, warn};

use super::{create, log_drop, rendering_path};
use crate::error::Dropped;
use crate::packet::{build, parse, Phase, Walker};
use crate::report::{FileSummary, Finding, Source};
use crate::store::StoreRegistry;

// ─── pcap I/O ─────────────────────────────────────────────────────────────────

/// The global header fields carried over to every file written from an input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GlobalHeader {
    pub version_major: u16,
    pub version_minor: u16,
    pub thiszone: i32,
    pub sigfigs: u32,
    pub snaplen: u32,
    pub linktype: u32,
    pub nanosecond: bool,
}

impl GlobalHeader {
    fn from_pcap(hdr: &PcapHeader) -> Self {
        Self {
            version_major: hdr.version_major,
            version_minor: hdr.version_minor,
            thiszone: hdr.thiszone,
            sigfigs: hdr.sigfigs,
            snaplen: hdr.snaplen,
            linktype: hdr.network.0 as u32,
            nanosecond: matches!(hdr.magic_number, 0xa1b23c4d | 0x4d3cb2a1),
        }
    }
}

pub struct Record<'a> {
    pub ts_sec: u32,
    /// Microseconds or nanoseconds, as the global header says.
    pub ts_frac: u32,
    pub origlen: u32,
    pub data: &'a [u8],
}

pub enum Event<'a> {
    Header(GlobalHeader),
    Packet(Record<'a>),
}

/// Streams `path`: the global header first, then every packet in order.
pub fn read(path: &Path, mut f: impl FnMut(Event<'_>) -> Result<()>) -> Result<()> {
    let file = File::open(path).with_context(|| format!("Cannot open {:?}", path))?;
    let mut reader = LegacyPcapReader::new(65536, BufReader::new(file)).context("Not a valid legacy pcap file")?;
    loop {
        match reader.next() {
            Ok((offset, block)) => {
                match block {
                    PcapBlockOwned::LegacyHeader(ref hdr) => f(Event::Header(GlobalHeader::from_pcap(hdr)))?,
                    PcapBlockOwned::Legacy(ref pkt) => f(Event::Packet(Record {
                        ts_sec: pkt.ts_sec,
                        ts_frac: pkt.ts_usec,
                        origlen: pkt.origlen,
                        data: pkt.data,
                    }))?,
                    PcapBlockOwned::NG(_) => warn!("pcapng block encountered – only legacy pcap supported"),
                }
                drop(block);
                reader.consume(offset);
            }
            Err(PcapError::Eof) => break,
            Err(PcapError::Incomplete) => {
                if let Err(e) = reader.refill() {
                    return Err(anyhow::anyhow!("refill error: {:?}", e));
                }
            }
            Err(e) => return Err(anyhow::anyhow!("pcap parse error in {:?}: {:?}", path, e)),
        }
    }
    Ok(())
}

fn write_global_header(w: &mut impl Write, hdr: &GlobalHeader) -> Result<()> {
    let magic: u32 = if hdr.nanosecond { 0xa1b23c4d } else { 0xa1b2c3d4 };
    w.write_all(&magic.to_le_bytes())?;
    w.write_all(&hdr.version_major.to_le_bytes())?;
    w.write_all(&hdr.version_minor.to_le_bytes())?;
    w.write_all(&hdr.thiszone.to_le_bytes())?;
    w.write_all(&hdr.sigfigs.to_le_bytes())?;
    w.write_all(&hdr.snaplen.to_le_bytes())?;
    w.write_all(&hdr.linktype.to_le_bytes())?;
    Ok(())
}

fn write_packet(w: &mut impl Write, ts_sec: u32, ts_frac: u32, origlen: u32, data: &[u8]) -> Result<()> {
    let len = data.len() as u32;
    w.write_all(&ts_sec.to_le_bytes())?;
    w.write_all(&ts_frac.to_le_bytes())?;
    w.write_all(&len.to_le_bytes())?;
    w.write_all(&origlen.max(len).to_le_bytes())?;
    w.write_all(data)?;
    Ok(())
}

pub struct PcapWriter {
    out: BufWriter<File>,
}

impl PcapWriter {
    pub fn create(root: &Path, rel: &Path, hdr: &GlobalHeader) -> Result<Self> {
        let mut out = BufWriter::new(create(root, rel)?);
        write_global_header(&mut out, hdr)?;
        Ok(Self { out })
    }

    pub fn write(&mut self, rec: &Record<'_>, data: &[u8]) -> Result<()> {
        // Untruncated packets stay untruncated when their length changes.
        let origlen = (rec.origlen as usize).saturating_sub(rec.data.len()) + data.len();
        write_packet(&mut self.out, rec.ts_sec, rec.ts_frac, origlen as u32, data)
    }

    pub fn finish(mut self) -> Result<()> {
        self.out.flush()?;
        Ok(())
    }
}

// ─── Phases ───────────────────────────────────────────────────────────────────

fn no_header() -> anyhow::Error {
    anyhow::anyhow!("packet record before the global header")
}

fn fatal(path: &Path, d: Dropped) -> anyhow::Error {
    anyhow::Error::new(d).context(format!("Aborting on {:?}", path))
}

pub fn discover(input: &Path, walker: &mut Walker, stores: &mut StoreRegistry, summary: &mut FileSummary) -> Result<()> {
    let mut linktype = None;
    read(input, |event| {
        let rec = match event {
            Event::Header(hdr) => {
                linktype = Some(hdr.linktype);
                return Ok(());
            }
            Event::Packet(rec) => rec,
        };
        summary.records += 1;
        let mut packet = parse(linktype.ok_or_else(no_header)?, rec.data);
        if let Err(d) = walker.walk(Phase::Discover, summary.records, &mut packet, stores) {
            if d.is_fatal() {
                return Err(fatal(input, d));
            }
            debug!("{:?}: {}", input, d);
            summary.count_drop(&d);
        }
        Ok(())
    })
}

/// Writes `out/<rel>` and, when any packet is dropped, `trash/<rel>`.
pub fn anonymize(
    input: &Path,
    rel: &Path,
    out_root: &Path,
    trash_root: &Path,
    walker: &mut Walker,
    stores: &mut StoreRegistry,
    summary: &mut FileSummary,
) -> Result<()> {
    let mut header: Option<GlobalHeader> = None;
    let mut out: Option<PcapWriter> = None;
    let mut trash: Option<PcapWriter> = None;
    read(input, |event| {
        let rec = match event {
            Event::Header(hdr) => {
                out = Some(PcapWriter::create(out_root, rel, &hdr)?);
                header = Some(hdr);
                return Ok(());
            }
            Event::Packet(rec) => rec,
        };
        let hdr = header.ok_or_else(no_header)?;
        summary.records += 1;
        let id = summary.records;
        let mut packet = parse(hdr.linktype, rec.data);
        let outcome = walker
            .walk(Phase::Anonymize, id, &mut packet, stores)
            .and_then(|()| build(&packet).map_err(|e| Dropped::from(e).within(format!("packet = {}", id))));
        match outcome {
            Ok(bytes) => {
                out.as_mut().ok_or_else(no_header)?.write(&rec, &bytes)?;
                summary.written += 1;
            }
            Err(d) if d.is_fatal() => return Err(fatal(input, d)),
            Err(d) => {
                log_drop(rel, &d);
                summary.count_drop(&d);
                if trash.is_none() {
                    trash = Some(PcapWriter::create(trash_root, rel, &hdr)?);
                }
                if let Some(t) = trash.as_mut() {
                    t.write(&rec, rec.data)?;
                }
                summary.quarantined += 1;
            }
        }
        Ok(())
    })?;
    if let Some(w) = out {
        w.finish()?;
    }
    if let Some(w) = trash {
        w.finish()?;
    }
    info!("{:?}: {} packets written, {} quarantined", rel, summary.written, summary.quarantined);
    Ok(())
}

/// Re-reads an anonymized capture: any original value left in it is a
/// finding, and a clean-mode rendering is written to `validation/<rel>.txt`.
pub fn validate(
    rel: &Path,
    out_root: &Path,
    validation_root: &Path,
    walker: &mut Walker,
    stores: &mut StoreRegistry,
    summary: &mut FileSummary,
    findings: &mut Vec<Finding>,
) -> Result<()> {
    let mut rendering = BufWriter::new(create(validation_root, &rendering_path(rel))?);
    let mut linktype = None;
    let file = rel.display().to_string();
    read(&out_root.join(rel), |event| {
        let rec = match event {
            Event::Header(hdr) => {
                linktype = Some(hdr.linktype);
                return Ok(());
            }
            Event::Packet(rec) => rec,
        };
        summary.records += 1;
        let id = summary.records;
        let location = format!("packet {}", id);
        let mut packet = parse(linktype.ok_or_else(no_header)?, rec.data);
        for (store, value) in stores.residuals(&packet.to_string()) {
            findings.push(Finding { file: file.clone(), location: location.clone(), store, value, source: Source::Output });
        }
        match walker.walk(Phase::Validate, id, &mut packet, stores) {
            Ok(()) => {
                let text = walker.render(&packet);
                for (store, value) in stores.residuals(&text) {
                    findings.push(Finding { file: file.clone(), location: location.clone(), store, value, source: Source::Rendering });
                }
                writeln!(rendering, "# {}", location)?;
                rendering.write_all(text.as_bytes())?;
            }
            Err(d) if d.is_fatal() => return Err(fatal(rel, d)),
            Err(d) => {
                log_drop(rel, &d);
                summary.count_drop(&d);
            }
        }
        Ok(())
    })?;
    rendering.flush()?;
    summary.residuals = findings.iter().filter(|f| f.file == file).count() as u64;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::dissect::tests::{eth_ipv4, icmp};

    fn header() -> GlobalHeader {
        GlobalHeader {
            version_major: 2,
            version_minor: 4,
            thiszone: 0,
            sigfigs: 0,
            snaplen: 65535,
            linktype: 1,
            nanosecond: false,
        }
    }

    #[test]
    fn written_capture_reads_back() {
        let dir = tempfile::tempdir().unwrap();
        let frame = eth_ipv4(1, [10, 0, 0, 1], [10, 0, 0, 2], &icmp(8, b"ping"));
        let rec = Record { ts_sec: 100, ts_frac: 250, origlen: frame.len() as u32, data: &frame };
        let mut w = PcapWriter::create(dir.path(), Path::new("a/b.pcap"), &header()).unwrap();
        w.write(&rec, &frame).unwrap();
        w.write(&rec, &frame[..20]).unwrap();
        w.finish().unwrap();

        let mut seen_header = None;
        let mut records = Vec::new();
        read(&dir.path().join("a/b.pcap"), |event| {
            match event {
                Event::Header(h) => seen_header = Some(h),
                Event::Packet(r) => records.push((r.ts_sec, r.ts_frac, r.origlen, r.data.to_vec())),
            }
            Ok(())
        })
        .unwrap();
        assert_eq!(seen_header, Some(header()));
        assert_eq!(records.len(), 2);
        assert_eq!(records[0], (100, 250, frame.len() as u32, frame.clone()));
        assert_eq!(records[1].2, 20);
    }

    #[test]
    fn nanosecond_magic_is_kept() {
        let mut buf = Vec::new();
        write_global_header(&mut buf, &GlobalHeader { nanosecond: true, ..header() }).unwrap();
        assert_eq!(&buf[..4], &0xa1b23c4du32.to_le_bytes());
        assert_eq!(buf.len(), 24);
    }
}
