use std::fs;
use std::path::Path;

use tracemask::files::pcap::{self, Event, GlobalHeader, PcapWriter, Record};
use tracemask::packet::dissect::checksum;
use tracemask::{Pipeline, Project};

// ─── Frame builders ───────────────────────────────────────────────────────────

fn eth_ipv4(proto: u8, src: [u8; 4], dst: [u8; 4], payload: &[u8]) -> Vec<u8> {
    let mut p = vec![0x00, 0x1a, 0x2b, 0xaa, 0xbb, 0xcc, 0x00, 0x1a, 0x2b, 0x11, 0x22, 0x33, 0x08, 0x00];
    let mut ip = vec![0x45, 0, 0, 0, 0x12, 0x34, 0x40, 0, 64, proto, 0, 0];
    ip[2..4].copy_from_slice(&((20 + payload.len()) as u16).to_be_bytes());
    ip.extend_from_slice(&src);
    ip.extend_from_slice(&dst);
    let sum = checksum(&ip);
    ip[10..12].copy_from_slice(&sum.to_be_bytes());
    p.extend(ip);
    p.extend_from_slice(payload);
    p
}

fn icmp(kind: u8, payload: &[u8]) -> Vec<u8> {
    let mut i = vec![kind, 0, 0, 0, 0, 1, 0, 1];
    i.extend_from_slice(payload);
    let sum = checksum(&i);
    i[2..4].copy_from_slice(&sum.to_be_bytes());
    i
}

fn udp(sport: u16, dport: u16, payload: &[u8]) -> Vec<u8> {
    let mut u = Vec::new();
    u.extend_from_slice(&sport.to_be_bytes());
    u.extend_from_slice(&dport.to_be_bytes());
    u.extend_from_slice(&((8 + payload.len()) as u16).to_be_bytes());
    u.extend_from_slice(&[0, 0]);
    u.extend_from_slice(payload);
    u
}

fn dns_response() -> Vec<u8> {
    let mut d = vec![0xab, 0xcd, 0x81, 0x80, 0, 1, 0, 1, 0, 0, 0, 0];
    d.extend_from_slice(b"\x03www\x07example\x03com\x00\x00\x01\x00\x01");
    d.extend_from_slice(&[0xc0, 0x0c, 0, 1, 0, 1, 0, 0, 0x0e, 0x10, 0, 4, 192, 168, 1, 20]);
    d
}

fn header() -> GlobalHeader {
    GlobalHeader { version_major: 2, version_minor: 4, thiszone: 0, sigfigs: 0, snaplen: 65535, linktype: 1, nanosecond: false }
}

fn write_capture(root: &Path, rel: &str, frames: &[Vec<u8>]) {
    let mut w = PcapWriter::create(root, Path::new(rel), &header()).unwrap();
    for (i, frame) in frames.iter().enumerate() {
        let rec = Record { ts_sec: 1000 + i as u32, ts_frac: 0, origlen: frame.len() as u32, data: frame };
        w.write(&rec, frame).unwrap();
    }
    w.finish().unwrap();
}

fn read_capture(path: &Path) -> Vec<Vec<u8>> {
    let mut frames = Vec::new();
    pcap::read(path, |event| {
        if let Event::Packet(rec) = event {
            frames.push(rec.data.to_vec());
        }
        Ok(())
    })
    .unwrap();
    frames
}

// ─── End to end ───────────────────────────────────────────────────────────────

#[test]
fn run_anonymizes_quarantines_and_validates() {
    let dir = tempfile::tempdir().unwrap();
    let project = Project::new(dir.path());
    project.init().unwrap();

    let echo = eth_ipv4(1, [172, 16, 67, 128], [192, 168, 1, 1], &icmp(8, b"ping"));
    let redirect = eth_ipv4(1, [192, 168, 1, 1], [172, 16, 67, 128], &icmp(5, b"x"));
    let dns = eth_ipv4(17, [192, 168, 1, 1], [172, 16, 67, 128], &udp(53, 53000, &dns_response()));
    write_capture(&project.input(), "site/capture.pcap", &[echo.clone(), redirect.clone(), dns]);
    fs::write(project.input().join("proxy.log"), "INVITE from 172.16.67.128 for www.example.com\n").unwrap();

    let mut pipeline = Pipeline::open(project.clone(), Some(7)).unwrap();
    pipeline.run().unwrap();

    // The forbidden ICMP type is quarantined untouched and left out of the output.
    let out = read_capture(&project.output().join("site/capture.pcap"));
    let trash = read_capture(&project.trash().join("site/capture.pcap"));
    assert_eq!(out.len(), 2);
    assert_eq!(trash, vec![redirect]);

    // Addresses come from the configured block and MACs keep their vendor prefix.
    let fake = pipeline.stores().get_replacement(tracemask::store::Kind::Ip, "172.16.67.128").unwrap();
    assert!(fake.starts_with("10."), "{}", fake);
    let fake_bytes: Vec<u8> = fake.split('.').map(|b| b.parse().unwrap()).collect();
    assert_eq!(&out[0][26..30], &fake_bytes[..]);
    assert_eq!(&out[0][..3], &echo[..3]);
    assert_ne!(&out[0][..6], &echo[..6]);
    assert!(!out[1].windows(9).any(|w| w == b"\x07example\x03"));

    // The same address gets the same replacement in every file.
    let log = fs::read_to_string(project.output().join("proxy.log")).unwrap();
    assert!(log.contains(&fake));
    assert!(!log.contains("172.16.67.128"));
    assert!(!log.contains("example.com"));

    let report = pipeline.report();
    assert!(report.findings.is_empty());
    let anonymize = &report.phases[1];
    assert_eq!((anonymize.written(), anonymize.quarantined()), (3, 1));
    assert_eq!(anonymize.layers["ICMP"].explicit_drop, 1);
    assert_eq!(fs::read_to_string(project.findings_path()).unwrap(), "file,location,store,value,source\n");
    assert!(project.validation().join("site/capture.pcap.txt").exists());

    let json: serde_json::Value = serde_json::from_str(&fs::read_to_string(project.report_path()).unwrap()).unwrap();
    assert_eq!(json["seed"], 7);
    assert_eq!(json["phases"].as_array().unwrap().len(), 3);
}

#[test]
fn clean_removes_outputs_and_keeps_stores() {
    use tracemask::store::Kind;

    let dir = tempfile::tempdir().unwrap();
    let project = Project::new(dir.path());
    project.init().unwrap();
    fs::write(project.input().join("a.log"), "peer 192.168.7.7\n").unwrap();
    let mut first = Pipeline::open(project.clone(), Some(3)).unwrap();
    first.run().unwrap();
    let fake = first.stores().get_replacement(Kind::Ip, "192.168.7.7").unwrap();

    project.clean().unwrap();
    assert!(!project.output().exists());
    assert!(!project.validation().exists());
    assert!(project.data().join("ip.yml").exists());

    // A rerun with another seed keeps the persisted replacement.
    let mut again = Pipeline::open(project.clone(), Some(99)).unwrap();
    again.run().unwrap();
    assert_eq!(again.stores().get_replacement(Kind::Ip, "192.168.7.7").unwrap(), fake);
    assert_eq!(fs::read_to_string(project.output().join("a.log")).unwrap(), format!("peer {}\n", fake));
}
