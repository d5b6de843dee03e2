//! Byte-level dissection and re-serialization.
//!
//! `parse` never fails: anything it cannot decode becomes a `Raw` layer, so
//! every capture byte is kept. `build` writes the layers back, recomputing
//! lengths, checksums, DNS counts and SIP `Content-Length`.

use super::{FieldValue, Layer, Packet};
use crate::error::{Error, Result};
use crate::store::ip::{fmt_ipv4, parse_ipv4};
use crate::store::mac::{fmt_mac, parse_mac, MacStyle};

pub const LINKTYPE_ETHERNET: u32 = 1;
pub const LINKTYPE_RAW: u32 = 101;
pub const LINKTYPE_IPV4: u32 = 228;

const SIP_METHODS: [&str; 14] = [
    "INVITE", "ACK", "BYE", "CANCEL", "REGISTER", "OPTIONS", "PRACK", "SUBSCRIBE", "NOTIFY", "PUBLISH", "INFO",
    "REFER", "MESSAGE", "UPDATE",
];

// ─── Helpers ──────────────────────────────────────────────────────────────────

fn be16(d: &[u8], off: usize) -> u64 {
    u16::from_be_bytes([d[off], d[off + 1]]) as u64
}

fn be32(d: &[u8], off: usize) -> u64 {
    u32::from_be_bytes([d[off], d[off + 1], d[off + 2], d[off + 3]]) as u64
}

fn mac_at(d: &[u8], off: usize) -> String {
    let mut b = [0u8; 6];
    b.copy_from_slice(&d[off..off + 6]);
    fmt_mac(&b, MacStyle::default())
}

fn ip_at(d: &[u8], off: usize) -> String {
    fmt_ipv4(&[d[off], d[off + 1], d[off + 2], d[off + 3]])
}

/// RFC 1071 Internet checksum.
pub fn checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    for chunk in data.chunks(2) {
        let word = if chunk.len() == 2 { u16::from_be_bytes([chunk[0], chunk[1]]) } else { u16::from_be_bytes([chunk[0], 0]) };
        sum += word as u32;
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

fn raw(data: &[u8], out: &mut Vec<Layer>) {
    if !data.is_empty() {
        out.push(Layer::new("Raw").bytes("load", data));
    }
}

fn padding(data: &[u8], out: &mut Vec<Layer>) {
    if !data.is_empty() {
        out.push(Layer::new("Padding").bytes("load", data));
    }
}

// ─── Parse ────────────────────────────────────────────────────────────────────

pub fn parse(linktype: u32, data: &[u8]) -> Packet {
    let mut layers = Vec::new();
    match linktype {
        LINKTYPE_ETHERNET => parse_ethernet(data, &mut layers),
        LINKTYPE_RAW | LINKTYPE_IPV4 | 12 | 14 => parse_ip(data, &mut layers),
        _ => raw(data, &mut layers),
    }
    Packet::new(layers)
}

fn parse_ethernet(data: &[u8], out: &mut Vec<Layer>) {
    if data.len() < 14 {
        return raw(data, out);
    }
    let ethertype = be16(data, 12);
    out.push(Layer::new("Ethernet").str("dst", mac_at(data, 0)).str("src", mac_at(data, 6)).int("type", ethertype));
    parse_ethertype(ethertype, &data[14..], out);
}

fn parse_ethertype(ethertype: u64, data: &[u8], out: &mut Vec<Layer>) {
    match ethertype {
        0x8100 if data.len() >= 4 => {
            let tci = be16(data, 0);
            let inner = be16(data, 2);
            out.push(
                Layer::new("Dot1Q").int("prio", tci >> 13).int("id", (tci >> 12) & 1).int("vlan", tci & 0x0fff).int("type", inner),
            );
            parse_ethertype(inner, &data[4..], out);
        }
        0x0806 => parse_arp(data, out),
        0x0800 => parse_ip(data, out),
        _ => raw(data, out),
    }
}

fn parse_arp(data: &[u8], out: &mut Vec<Layer>) {
    if data.len() < 28 || data[4] != 6 || data[5] != 4 {
        return raw(data, out);
    }
    out.push(
        Layer::new("ARP")
            .int("hwtype", be16(data, 0))
            .int("ptype", be16(data, 2))
            .int("hwlen", 6)
            .int("plen", 4)
            .int("op", be16(data, 6))
            .str("hwsrc", mac_at(data, 8))
            .str("psrc", ip_at(data, 14))
            .str("hwdst", mac_at(data, 18))
            .str("pdst", ip_at(data, 24)),
    );
    padding(&data[28..], out);
}

fn ip_layer(name: &str, data: &[u8], ihl: usize) -> Layer {
    let frag = be16(data, 6);
    Layer::new(name)
        .int("version", 4)
        .int("ihl", (ihl / 4) as u64)
        .int("tos", data[1] as u64)
        .int("len", be16(data, 2))
        .int("id", be16(data, 4))
        .int("flags", frag >> 13)
        .int("frag", frag & 0x1fff)
        .int("ttl", data[8] as u64)
        .int("proto", data[9] as u64)
        .int("chksum", be16(data, 10))
        .str("src", ip_at(data, 12))
        .str("dst", ip_at(data, 16))
        .bytes("options", &data[20..ihl])
}

fn parse_ip(data: &[u8], out: &mut Vec<Layer>) {
    if data.len() < 20 || data[0] >> 4 != 4 {
        return raw(data, out);
    }
    let ihl = (data[0] & 0x0f) as usize * 4;
    if ihl < 20 || data.len() < ihl {
        return raw(data, out);
    }
    let total = match be16(data, 2) as usize {
        n if n >= ihl && n <= data.len() => n,
        _ => data.len(),
    };
    out.push(ip_layer("IP", data, ihl));
    let payload = &data[ihl..total];
    if be16(data, 6) & 0x3fff != 0 {
        // Fragments are not reassembled.
        raw(payload, out);
    } else {
        match data[9] {
            1 => parse_icmp(payload, out),
            6 => parse_tcp(payload, out),
            17 => parse_udp(payload, out),
            _ => raw(payload, out),
        }
    }
    padding(&data[total..], out);
}

fn parse_icmp(data: &[u8], out: &mut Vec<Layer>) {
    if data.len() < 8 {
        return raw(data, out);
    }
    out.push(
        Layer::new("ICMP")
            .int("type", data[0] as u64)
            .int("code", data[1] as u64)
            .int("chksum", be16(data, 2))
            .int("id", be16(data, 4))
            .int("seq", be16(data, 6)),
    );
    let rest = &data[8..];
    // Error messages quote the offending datagram's header.
    if matches!(data[0], 3 | 4 | 5 | 11 | 12) && rest.len() >= 20 && rest[0] >> 4 == 4 {
        let ihl = (rest[0] & 0x0f) as usize * 4;
        if ihl >= 20 && rest.len() >= ihl {
            out.push(ip_layer("IPerror", rest, ihl));
            return raw(&rest[ihl..], out);
        }
    }
    raw(rest, out);
}

fn parse_udp(data: &[u8], out: &mut Vec<Layer>) {
    if data.len() < 8 {
        return raw(data, out);
    }
    let (sport, dport) = (be16(data, 0), be16(data, 2));
    let end = match be16(data, 4) as usize {
        n if n >= 8 && n <= data.len() => n,
        _ => data.len(),
    };
    out.push(Layer::new("UDP").int("sport", sport).int("dport", dport).int("len", be16(data, 4)).int("chksum", be16(data, 6)));
    parse_application(sport, dport, &data[8..end], true, out);
    padding(&data[end..], out);
}

fn parse_tcp(data: &[u8], out: &mut Vec<Layer>) {
    if data.len() < 20 {
        return raw(data, out);
    }
    let dataofs = (data[12] >> 4) as usize * 4;
    if dataofs < 20 || data.len() < dataofs {
        return raw(data, out);
    }
    let (sport, dport) = (be16(data, 0), be16(data, 2));
    out.push(
        Layer::new("TCP")
            .int("sport", sport)
            .int("dport", dport)
            .int("seq", be32(data, 4))
            .int("ack", be32(data, 8))
            .int("dataofs", (dataofs / 4) as u64)
            .int("flags", be16(data, 12) & 0x0fff)
            .int("window", be16(data, 14))
            .int("chksum", be16(data, 16))
            .int("urgptr", be16(data, 18))
            .bytes("options", &data[20..dataofs]),
    );
    parse_application(sport, dport, &data[dataofs..], false, out);
}

fn parse_application(sport: u64, dport: u64, payload: &[u8], udp: bool, out: &mut Vec<Layer>) {
    if payload.is_empty() {
        return;
    }
    let port = |p: u64| sport == p || dport == p;
    if udp && (port(53) || port(5353)) {
        if let Some(dns) = parse_dns(payload) {
            out.push(dns);
            return;
        }
    }
    if (looks_like_sip(payload) || port(5060) || port(5061)) && parse_sip(payload, out) {
        return;
    }
    raw(payload, out);
}

// ─── DNS ──────────────────────────────────────────────────────────────────────

/// Reads a possibly compressed name at `start_pos`. Returns the dotted name
/// with a trailing dot (`.` for the root) and the bytes it occupies in place.
fn read_dns_name(data: &[u8], start_pos: usize) -> Option<(String, usize)> {
    let mut parts: Vec<String> = Vec::new();
    let mut pos = start_pos;
    let mut bytes_consumed = 0;
    let mut followed_pointer = false;
    let mut jumps = 0;

    loop {
        let len = *data.get(pos)? as usize;
        if len == 0 {
            if !followed_pointer { bytes_consumed += 1; }
            break;
        }
        if len & 0xc0 == 0xc0 {
            let low = *data.get(pos + 1)? as usize;
            if !followed_pointer {
                bytes_consumed += 2;
                followed_pointer = true;
            }
            jumps += 1;
            if jumps > 64 { return None; }
            pos = ((len & 0x3f) << 8) | low;
            continue;
        }
        if len & 0xc0 != 0 || pos + 1 + len > data.len() {
            return None;
        }
        // Labels must survive the dotted form unchanged.
        let label = std::str::from_utf8(&data[pos + 1..pos + 1 + len]).ok().filter(|l| !l.contains('.'))?;
        parts.push(label.to_string());
        if !followed_pointer { bytes_consumed += 1 + len; }
        pos += 1 + len;
    }

    let name = if parts.is_empty() { ".".to_string() } else { format!("{}.", parts.join(".")) };
    Some((name, bytes_consumed))
}

fn rr_layer(name: &str, rrname: String, rtype: u64, rclass: u64, ttl: u64, rdlen: usize) -> Layer {
    Layer::new(name).str("rrname", rrname).int("type", rtype).int("rclass", rclass).int("ttl", ttl).int("rdlen", rdlen as u64)
}

fn read_rr(data: &[u8], pos: usize) -> Option<(Layer, usize)> {
    let (rrname, used) = read_dns_name(data, pos)?;
    let p = pos + used;
    if p + 10 > data.len() {
        return None;
    }
    let (rtype, rclass, ttl) = (be16(data, p), be16(data, p + 2), be32(data, p + 4));
    let rdlen = be16(data, p + 8) as usize;
    let p = p + 10;
    if p + rdlen > data.len() {
        return None;
    }
    let rd = &data[p..p + rdlen];
    let layer = match rtype {
        1 if rdlen == 4 => rr_layer("DNSRR", rrname, rtype, rclass, ttl, rdlen).str("rdata", ip_at(rd, 0)),
        2 | 5 | 12 => {
            let (target, used) = read_dns_name(data, p)?;
            if used != rdlen { return None; }
            rr_layer("DNSRR", rrname, rtype, rclass, ttl, rdlen).str("rdata", target)
        }
        15 if rdlen >= 3 => {
            let (exchange, used) = read_dns_name(data, p + 2)?;
            if used + 2 != rdlen { return None; }
            rr_layer("DNSRRMX", rrname, rtype, rclass, ttl, rdlen).int("preference", be16(rd, 0)).str("exchange", exchange)
        }
        33 if rdlen >= 7 => {
            let (target, used) = read_dns_name(data, p + 6)?;
            if used + 6 != rdlen { return None; }
            rr_layer("DNSRRSRV", rrname, rtype, rclass, ttl, rdlen)
                .int("priority", be16(rd, 0))
                .int("weight", be16(rd, 2))
                .int("port", be16(rd, 4))
                .str("target", target)
        }
        _ => rr_layer("DNSRR", rrname, rtype, rclass, ttl, rdlen).bytes("rdata", rd),
    };
    Some((layer, p + rdlen))
}

fn parse_dns(data: &[u8]) -> Option<Layer> {
    if data.len() < 12 {
        return None;
    }
    let mut pos = 12;
    let mut qd = Vec::new();
    for _ in 0..be16(data, 4) {
        let (qname, used) = read_dns_name(data, pos)?;
        pos += used;
        if pos + 4 > data.len() {
            return None;
        }
        let q = Layer::new("DNSQR").str("qname", qname).int("qtype", be16(data, pos)).int("qclass", be16(data, pos + 2));
        qd.push(FieldValue::Packet(Packet::new(vec![q])));
        pos += 4;
    }
    let mut sections = Vec::new();
    for count_off in [6, 8, 10] {
        let mut records = Vec::new();
        for _ in 0..be16(data, count_off) {
            let (rr, next) = read_rr(data, pos)?;
            records.push(FieldValue::Packet(Packet::new(vec![rr])));
            pos = next;
        }
        sections.push(records);
    }
    // Trailing bytes would not survive a rebuild.
    if pos != data.len() {
        return None;
    }
    let mut sections = sections.into_iter();
    let mut section = || FieldValue::List(sections.next().unwrap_or_default());
    Some(
        Layer::new("DNS")
            .int("id", be16(data, 0))
            .int("flags", be16(data, 2))
            .int("qdcount", be16(data, 4))
            .int("ancount", be16(data, 6))
            .int("nscount", be16(data, 8))
            .int("arcount", be16(data, 10))
            .with("qd", FieldValue::List(qd))
            .with("an", section())
            .with("ns", section())
            .with("ar", section()),
    )
}

// ─── SIP / SDP ────────────────────────────────────────────────────────────────

fn looks_like_sip(payload: &[u8]) -> bool {
    payload.starts_with(b"SIP/2.0 ")
        || SIP_METHODS.iter().any(|m| payload.starts_with(m.as_bytes()) && payload.get(m.len()) == Some(&b' '))
}

/// Pushes `SIP` (and `SDP` or `Raw` for the body). False when the payload
/// is not a well-formed SIP message.
fn parse_sip(payload: &[u8], out: &mut Vec<Layer>) -> bool {
    let Ok(text) = std::str::from_utf8(payload) else { return false };
    let Some(split) = text.find("\r\n\r\n") else { return false };
    let (head, body) = (&text[..split], &text[split + 4..]);
    let mut lines = head.split("\r\n");
    let first: Vec<&str> = lines.next().unwrap_or_default().splitn(3, ' ').collect();
    if first.len() != 3 {
        return false;
    }
    let mut layer = if first[0] == "SIP/2.0" {
        Layer::new("SIP").str("SIP-Version", first[0]).str("Status-Code", first[1]).str("Reason-Phrase", first[2])
    } else if first[2].starts_with("SIP/") {
        Layer::new("SIP").str("Method", first[0]).str("Request-URI", first[1]).str("SIP-Version", first[2])
    } else {
        return false;
    };
    for line in lines {
        let Some((name, value)) = line.split_once(':') else { return false };
        layer.push(name.trim_end(), FieldValue::Str(value.trim_start().to_string()));
    }
    let is_sdp = layer
        .get_str("Content-Type")
        .or_else(|| layer.get_str("c"))
        .map(|ct| ct.to_ascii_lowercase().contains("application/sdp"))
        .unwrap_or(false);
    out.push(layer);
    if is_sdp {
        if let Some(sdp) = parse_sdp(body) {
            out.push(sdp);
            return true;
        }
    }
    raw(body.as_bytes(), out);
    true
}

fn parse_sdp(body: &str) -> Option<Layer> {
    let lines = body.strip_suffix("\r\n")?;
    let mut layer = Layer::new("SDP");
    for line in lines.split("\r\n") {
        let (t, v) = line.split_once('=')?;
        if t.len() != 1 || !t.as_bytes()[0].is_ascii_lowercase() {
            return None;
        }
        layer.push(t, FieldValue::Str(v.to_string()));
    }
    Some(layer)
}

// ─── Build ────────────────────────────────────────────────────────────────────

fn missing(layer: &Layer, name: &str) -> Error {
    Error::Build(format!("layer '{}' has no usable field '{}'", layer.name, name))
}

fn int(layer: &Layer, name: &str) -> Result<u64> {
    layer.get_int(name).ok_or_else(|| missing(layer, name))
}

fn u8f(layer: &Layer, name: &str) -> Result<u8> {
    u8::try_from(int(layer, name)?).map_err(|_| missing(layer, name))
}

fn u16f(layer: &Layer, name: &str) -> Result<u16> {
    u16::try_from(int(layer, name)?).map_err(|_| missing(layer, name))
}

fn u32f(layer: &Layer, name: &str) -> Result<u32> {
    u32::try_from(int(layer, name)?).map_err(|_| missing(layer, name))
}

fn text<'a>(layer: &'a Layer, name: &str) -> Result<&'a str> {
    layer.get_str(name).ok_or_else(|| missing(layer, name))
}

fn bytes<'a>(layer: &'a Layer, name: &str) -> Result<&'a [u8]> {
    layer.get_bytes(name).ok_or_else(|| missing(layer, name))
}

fn ipf(layer: &Layer, name: &str) -> Result<[u8; 4]> {
    let v = text(layer, name)?;
    parse_ipv4(v).ok_or_else(|| Error::Build(format!("invalid IPv4 address '{}' in {}.{}", v, layer.name, name)))
}

fn macf(layer: &Layer, name: &str) -> Result<[u8; 6]> {
    let v = text(layer, name)?;
    parse_mac(v).map(|(b, _)| b).ok_or_else(|| Error::Build(format!("invalid MAC address '{}' in {}.{}", v, layer.name, name)))
}

fn padded(options: &[u8]) -> Vec<u8> {
    let mut o = options.to_vec();
    while o.len() % 4 != 0 {
        o.push(0);
    }
    o
}

pub fn build(packet: &Packet) -> Result<Vec<u8>> {
    let mut end = packet.layers.len();
    while end > 0 && packet.layers[end - 1].name == "Padding" {
        end -= 1;
    }
    let mut out = build_layers(&packet.layers[..end], None)?;
    for layer in &packet.layers[end..] {
        out.extend_from_slice(bytes(layer, "load")?);
    }
    Ok(out)
}

type Pseudo = ([u8; 4], [u8; 4]);

fn build_layers(layers: &[Layer], pseudo: Option<Pseudo>) -> Result<Vec<u8>> {
    let Some((layer, rest)) = layers.split_first() else { return Ok(Vec::new()) };
    let mut out = Vec::new();
    match layer.name.as_str() {
        "Ethernet" => {
            out.extend_from_slice(&macf(layer, "dst")?);
            out.extend_from_slice(&macf(layer, "src")?);
            out.extend_from_slice(&u16f(layer, "type")?.to_be_bytes());
            out.extend(build_layers(rest, None)?);
        }
        "Dot1Q" => {
            let tci = (u16f(layer, "prio")? << 13) | ((u16f(layer, "id")? & 1) << 12) | (u16f(layer, "vlan")? & 0x0fff);
            out.extend_from_slice(&tci.to_be_bytes());
            out.extend_from_slice(&u16f(layer, "type")?.to_be_bytes());
            out.extend(build_layers(rest, None)?);
        }
        "ARP" => {
            out.extend_from_slice(&u16f(layer, "hwtype")?.to_be_bytes());
            out.extend_from_slice(&u16f(layer, "ptype")?.to_be_bytes());
            out.extend_from_slice(&[6, 4]);
            out.extend_from_slice(&u16f(layer, "op")?.to_be_bytes());
            out.extend_from_slice(&macf(layer, "hwsrc")?);
            out.extend_from_slice(&ipf(layer, "psrc")?);
            out.extend_from_slice(&macf(layer, "hwdst")?);
            out.extend_from_slice(&ipf(layer, "pdst")?);
            out.extend(build_layers(rest, None)?);
        }
        "IP" | "IPerror" => {
            let (src, dst) = (ipf(layer, "src")?, ipf(layer, "dst")?);
            let payload = build_layers(rest, Some((src, dst)))?;
            let options = padded(bytes(layer, "options")?);
            let ihl = 20 + options.len();
            // A quoted header keeps the length of the datagram it describes.
            let len = if layer.name == "IP" { (ihl + payload.len()) as u16 } else { u16f(layer, "len")? };
            let mut hdr = Vec::with_capacity(ihl);
            hdr.push(0x40 | (ihl / 4) as u8);
            hdr.push(u8f(layer, "tos")?);
            hdr.extend_from_slice(&len.to_be_bytes());
            hdr.extend_from_slice(&u16f(layer, "id")?.to_be_bytes());
            let frag = (u16f(layer, "flags")? << 13) | (u16f(layer, "frag")? & 0x1fff);
            hdr.extend_from_slice(&frag.to_be_bytes());
            hdr.push(u8f(layer, "ttl")?);
            hdr.push(u8f(layer, "proto")?);
            hdr.extend_from_slice(&[0, 0]);
            hdr.extend_from_slice(&src);
            hdr.extend_from_slice(&dst);
            hdr.extend_from_slice(&options);
            let sum = checksum(&hdr);
            hdr[10..12].copy_from_slice(&sum.to_be_bytes());
            out.extend(hdr);
            out.extend(payload);
        }
        "ICMP" => {
            out.push(u8f(layer, "type")?);
            out.push(u8f(layer, "code")?);
            out.extend_from_slice(&[0, 0]);
            out.extend_from_slice(&u16f(layer, "id")?.to_be_bytes());
            out.extend_from_slice(&u16f(layer, "seq")?.to_be_bytes());
            out.extend(build_layers(rest, None)?);
            let sum = checksum(&out);
            out[2..4].copy_from_slice(&sum.to_be_bytes());
        }
        "UDP" => {
            let payload = build_layers(rest, None)?;
            let len = (8 + payload.len()) as u16;
            out.extend_from_slice(&u16f(layer, "sport")?.to_be_bytes());
            out.extend_from_slice(&u16f(layer, "dport")?.to_be_bytes());
            out.extend_from_slice(&len.to_be_bytes());
            out.extend_from_slice(&[0, 0]);
            out.extend(payload);
            // A zero checksum means "not computed" and stays that way.
            if let (Some(p), true) = (pseudo, u16f(layer, "chksum")? != 0) {
                let sum = match transport_checksum(p, 17, &out) { 0 => 0xffff, s => s };
                out[6..8].copy_from_slice(&sum.to_be_bytes());
            }
        }
        "TCP" => {
            let options = padded(bytes(layer, "options")?);
            let dataofs = (20 + options.len()) / 4;
            out.extend_from_slice(&u16f(layer, "sport")?.to_be_bytes());
            out.extend_from_slice(&u16f(layer, "dport")?.to_be_bytes());
            out.extend_from_slice(&u32f(layer, "seq")?.to_be_bytes());
            out.extend_from_slice(&u32f(layer, "ack")?.to_be_bytes());
            let flags = ((dataofs as u16) << 12) | (u16f(layer, "flags")? & 0x0fff);
            out.extend_from_slice(&flags.to_be_bytes());
            out.extend_from_slice(&u16f(layer, "window")?.to_be_bytes());
            out.extend_from_slice(&[0, 0]);
            out.extend_from_slice(&u16f(layer, "urgptr")?.to_be_bytes());
            out.extend_from_slice(&options);
            out.extend(build_layers(rest, None)?);
            if let Some(p) = pseudo {
                let sum = transport_checksum(p, 6, &out);
                out[16..18].copy_from_slice(&sum.to_be_bytes());
            }
        }
        "DNS" => {
            out.extend(build_dns(layer)?);
            out.extend(build_layers(rest, None)?);
        }
        "SIP" => {
            let body = build_layers(rest, None)?;
            out.extend(build_sip(layer, body.len())?);
            out.extend(body);
        }
        "SDP" => {
            for f in &layer.fields {
                match &f.value {
                    FieldValue::Str(v) => out.extend(format!("{}={}\r\n", f.name, v).into_bytes()),
                    _ => return Err(missing(layer, &f.name)),
                }
            }
            out.extend(build_layers(rest, None)?);
        }
        "Raw" | "Padding" => {
            out.extend_from_slice(bytes(layer, "load")?);
            out.extend(build_layers(rest, None)?);
        }
        other => return Err(Error::Build(format!("unknown layer '{}'", other))),
    }
    Ok(out)
}

fn transport_checksum((src, dst): Pseudo, proto: u8, segment: &[u8]) -> u16 {
    let mut buf = Vec::with_capacity(12 + segment.len());
    buf.extend_from_slice(&src);
    buf.extend_from_slice(&dst);
    buf.extend_from_slice(&[0, proto]);
    buf.extend_from_slice(&(segment.len() as u16).to_be_bytes());
    buf.extend_from_slice(segment);
    checksum(&buf)
}

fn encode_name(name: &str, out: &mut Vec<u8>) -> Result<()> {
    let trimmed = name.strip_suffix('.').unwrap_or(name);
    if !trimmed.is_empty() {
        for label in trimmed.split('.') {
            if label.is_empty() || label.len() > 63 {
                return Err(Error::Build(format!("invalid DNS name '{}'", name)));
            }
            out.push(label.len() as u8);
            out.extend_from_slice(label.as_bytes());
        }
    }
    out.push(0);
    Ok(())
}

fn records<'a>(layer: &'a Layer, name: &str) -> Result<Vec<&'a Layer>> {
    match layer.get(name) {
        Some(FieldValue::List(items)) => items
            .iter()
            .map(|i| match i {
                FieldValue::Packet(p) => p.layers.first().ok_or_else(|| missing(layer, name)),
                _ => Err(missing(layer, name)),
            })
            .collect(),
        _ => Err(missing(layer, name)),
    }
}

fn build_rr(rr: &Layer, out: &mut Vec<u8>) -> Result<()> {
    encode_name(text(rr, "rrname")?, out)?;
    let rtype = u16f(rr, "type")?;
    out.extend_from_slice(&rtype.to_be_bytes());
    out.extend_from_slice(&u16f(rr, "rclass")?.to_be_bytes());
    out.extend_from_slice(&u32f(rr, "ttl")?.to_be_bytes());
    let mut rdata = Vec::new();
    match rr.name.as_str() {
        "DNSRRMX" => {
            rdata.extend_from_slice(&u16f(rr, "preference")?.to_be_bytes());
            encode_name(text(rr, "exchange")?, &mut rdata)?;
        }
        "DNSRRSRV" => {
            rdata.extend_from_slice(&u16f(rr, "priority")?.to_be_bytes());
            rdata.extend_from_slice(&u16f(rr, "weight")?.to_be_bytes());
            rdata.extend_from_slice(&u16f(rr, "port")?.to_be_bytes());
            encode_name(text(rr, "target")?, &mut rdata)?;
        }
        _ => match rr.get("rdata") {
            Some(FieldValue::Str(_)) if rtype == 1 => rdata.extend_from_slice(&ipf(rr, "rdata")?),
            Some(FieldValue::Str(v)) => encode_name(v, &mut rdata)?,
            Some(FieldValue::Bytes(b)) => rdata.extend_from_slice(b),
            _ => return Err(missing(rr, "rdata")),
        },
    }
    out.extend_from_slice(&(rdata.len() as u16).to_be_bytes());
    out.extend(rdata);
    Ok(())
}

fn build_dns(layer: &Layer) -> Result<Vec<u8>> {
    let qd = records(layer, "qd")?;
    let sections = [records(layer, "an")?, records(layer, "ns")?, records(layer, "ar")?];
    let mut out = Vec::new();
    out.extend_from_slice(&u16f(layer, "id")?.to_be_bytes());
    out.extend_from_slice(&u16f(layer, "flags")?.to_be_bytes());
    out.extend_from_slice(&(qd.len() as u16).to_be_bytes());
    for s in &sections {
        out.extend_from_slice(&(s.len() as u16).to_be_bytes());
    }
    for q in qd {
        encode_name(text(q, "qname")?, &mut out)?;
        out.extend_from_slice(&u16f(q, "qtype")?.to_be_bytes());
        out.extend_from_slice(&u16f(q, "qclass")?.to_be_bytes());
    }
    for rr in sections.iter().flatten() {
        build_rr(rr, &mut out)?;
    }
    Ok(out)
}

fn build_sip(layer: &Layer, body_len: usize) -> Result<Vec<u8>> {
    if layer.fields.len() < 3 {
        return Err(missing(layer, "SIP-Version"));
    }
    let mut head = String::new();
    let start: Vec<&str> = layer.fields[..3]
        .iter()
        .map(|f| match &f.value {
            FieldValue::Str(s) => Ok(s.as_str()),
            _ => Err(missing(layer, &f.name)),
        })
        .collect::<Result<_>>()?;
    head.push_str(&start.join(" "));
    head.push_str("\r\n");
    for f in &layer.fields[3..] {
        let value = match &f.value {
            _ if f.name.eq_ignore_ascii_case("Content-Length") || f.name.eq_ignore_ascii_case("l") => body_len.to_string(),
            FieldValue::Str(s) => s.clone(),
            _ => return Err(missing(layer, &f.name)),
        };
        head.push_str(&format!("{}: {}\r\n", f.name, value));
    }
    head.push_str("\r\n");
    Ok(head.into_bytes())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Ethernet + IPv4 frame around `payload`, with a valid header checksum.
    pub fn eth_ipv4(proto: u8, src: [u8; 4], dst: [u8; 4], payload: &[u8]) -> Vec<u8> {
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

    pub fn udp(sport: u16, dport: u16, payload: &[u8]) -> Vec<u8> {
        let mut u = Vec::new();
        u.extend_from_slice(&sport.to_be_bytes());
        u.extend_from_slice(&dport.to_be_bytes());
        u.extend_from_slice(&((8 + payload.len()) as u16).to_be_bytes());
        u.extend_from_slice(&[0, 0]);
        u.extend_from_slice(payload);
        u
    }

    pub fn icmp(kind: u8, payload: &[u8]) -> Vec<u8> {
        let mut i = vec![kind, 0, 0, 0, 0, 1, 0, 1];
        i.extend_from_slice(payload);
        let sum = checksum(&i);
        i[2..4].copy_from_slice(&sum.to_be_bytes());
        i
    }

    pub fn dns_response() -> Vec<u8> {
        let mut d = vec![0xab, 0xcd, 0x81, 0x80, 0, 1, 0, 1, 0, 0, 0, 0];
        d.extend_from_slice(b"\x03www\x07example\x03com\x00\x00\x01\x00\x01");
        d.extend_from_slice(&[0xc0, 0x0c, 0, 1, 0, 1, 0, 0, 0x0e, 0x10, 0, 4, 192, 168, 1, 20]);
        d
    }

    pub const SIP_INVITE: &str = "INVITE sip:+41261234567@pbx.example.com SIP/2.0\r\n\
        Via: SIP/2.0/UDP 192.168.1.10:5060;branch=z9hG4bK776asdhds\r\n\
        From: \"Alice\" <sip:alice@example.com>;tag=1928301774\r\n\
        To: <sip:+41261234567@pbx.example.com>\r\n\
        Call-ID: a84b4c76e66710@192.168.1.10\r\n\
        Content-Type: application/sdp\r\n\
        Content-Length: 56\r\n\r\n\
        v=0\r\n\
        o=alice 2890844526 2890844526 IN IP4 192.168.1.10\r\n";

    #[test]
    fn ethernet_ip_udp_dns() {
        let frame = eth_ipv4(17, [192, 168, 1, 10], [192, 168, 1, 1], &udp(53000, 53, &dns_response()));
        let p = parse(LINKTYPE_ETHERNET, &frame);
        assert_eq!(p.names(), vec!["Ethernet", "IP", "UDP", "DNS"]);
        assert_eq!(p.layer("Ethernet").unwrap().get_str("src"), Some("00:1a:2b:11:22:33"));
        assert_eq!(p.layer("IP").unwrap().get_str("dst"), Some("192.168.1.1"));
        let dns = p.layer("DNS").unwrap();
        let Some(FieldValue::List(an)) = dns.get("an") else { panic!("no answers") };
        let FieldValue::Packet(rr) = &an[0] else { panic!("not a record") };
        assert_eq!(rr.layers[0].get_str("rrname"), Some("www.example.com."));
        assert_eq!(rr.layers[0].get_str("rdata"), Some("192.168.1.20"));

        // Names are written back uncompressed; the DNS content is unchanged.
        let rebuilt = parse(LINKTYPE_ETHERNET, &build(&p).unwrap());
        assert_eq!(rebuilt.layer("DNS"), p.layer("DNS"));
    }

    #[test]
    fn rebuild_is_identical_without_edits() {
        let frame = eth_ipv4(1, [10, 0, 0, 1], [10, 0, 0, 2], &icmp(8, b"ping-data"));
        assert_eq!(build(&parse(LINKTYPE_ETHERNET, &frame)).unwrap(), frame);
    }

    #[test]
    fn checksums_follow_edits() {
        let frame = eth_ipv4(1, [10, 0, 0, 1], [10, 0, 0, 2], &icmp(8, b"abc"));
        let mut p = parse(LINKTYPE_ETHERNET, &frame);
        *p.layer_mut("IP").unwrap().get_mut("src").unwrap() = FieldValue::Str("10.9.9.9".into());
        let out = build(&p).unwrap();
        assert_eq!(&out[26..30], &[10, 9, 9, 9]);
        assert_eq!(checksum(&out[14..34]), 0);
    }

    #[test]
    fn icmp_error_quotes_header() {
        let inner = {
            let f = eth_ipv4(17, [192, 168, 1, 10], [8, 8, 8, 8], &udp(5060, 5060, b"x"));
            f[14..].to_vec()
        };
        let frame = eth_ipv4(1, [192, 168, 1, 1], [192, 168, 1, 10], &icmp(3, &inner));
        let p = parse(LINKTYPE_ETHERNET, &frame);
        assert_eq!(p.names(), vec!["Ethernet", "IP", "ICMP", "IPerror", "Raw"]);
        assert_eq!(p.layer("IPerror").unwrap().get_str("dst"), Some("8.8.8.8"));
        assert_eq!(build(&p).unwrap(), frame);
    }

    #[test]
    fn sip_with_sdp() {
        let frame = eth_ipv4(17, [192, 168, 1, 10], [192, 168, 1, 1], &udp(5060, 5060, SIP_INVITE.as_bytes()));
        let p = parse(LINKTYPE_ETHERNET, &frame);
        assert_eq!(p.names(), vec!["Ethernet", "IP", "UDP", "SIP", "SDP"]);
        let sip = p.layer("SIP").unwrap();
        assert_eq!(sip.get_str("Method"), Some("INVITE"));
        assert_eq!(sip.get_str("call-id"), Some("a84b4c76e66710@192.168.1.10"));
        assert_eq!(p.layer("SDP").unwrap().get_str("o"), Some("alice 2890844526 2890844526 IN IP4 192.168.1.10"));
        assert_eq!(build(&p).unwrap(), frame);
    }

    #[test]
    fn content_length_follows_body() {
        let frame = eth_ipv4(17, [192, 168, 1, 10], [192, 168, 1, 1], &udp(5060, 5060, SIP_INVITE.as_bytes()));
        let mut p = parse(LINKTYPE_ETHERNET, &frame);
        *p.layer_mut("SDP").unwrap().get_mut("o").unwrap() = FieldValue::Str("bob 1 1 IN IP4 10.0.0.1".into());
        let out = build(&p).unwrap();
        let text = String::from_utf8_lossy(&out[42..]).to_string();
        assert!(text.contains("Content-Length: 32\r\n"), "{}", text);
    }

    #[test]
    fn short_or_unknown_data_is_raw() {
        assert_eq!(parse(LINKTYPE_ETHERNET, &[1, 2, 3]).names(), vec!["Raw"]);
        assert_eq!(parse(999, &[0u8; 40]).names(), vec!["Raw"]);
        let mut v6 = vec![0u8; 14];
        v6[12] = 0x86;
        v6[13] = 0xdd;
        v6.extend_from_slice(&[0x60; 40]);
        assert_eq!(parse(LINKTYPE_ETHERNET, &v6).names(), vec!["Ethernet", "Raw"]);
    }

    #[test]
    fn ethernet_padding_is_kept() {
        let mut frame = eth_ipv4(1, [10, 0, 0, 1], [10, 0, 0, 2], &icmp(0, b""));
        frame.extend_from_slice(&[0u8; 18]);
        let p = parse(LINKTYPE_ETHERNET, &frame);
        assert_eq!(p.names(), vec!["Ethernet", "IP", "ICMP", "Padding"]);
        assert_eq!(build(&p).unwrap(), frame);
    }

    #[test]
    fn dns_labels_that_cannot_round_trip_stay_raw() {
        for label in [&b"\x03a\xffb"[..], &b"\x03a.b"[..]] {
            let mut d = vec![0xab, 0xcd, 0x01, 0x00, 0, 1, 0, 0, 0, 0, 0, 0];
            d.extend_from_slice(label);
            d.extend_from_slice(b"\x03com\x00\x00\x01\x00\x01");
            let frame = eth_ipv4(17, [192, 168, 1, 10], [192, 168, 1, 1], &udp(53000, 53, &d));
            let p = parse(LINKTYPE_ETHERNET, &frame);
            assert_eq!(p.names(), vec!["Ethernet", "IP", "UDP", "Raw"]);
            assert_eq!(build(&p).unwrap(), frame);
        }
    }

    #[test]
    fn dns_name_pointer_loop_is_rejected() {
        let data = [0xc0, 0x00];
        assert!(read_dns_name(&data, 0).is_none());
    }
}
