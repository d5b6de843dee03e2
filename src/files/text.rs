//! Line-oriented text logs: every line goes through the free-text scan.

use anyhow::{Context, Result};
use regex::Regex;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;
use std::sync::OnceLock;
use tracing::{debug, info};

use super::{create, log_drop, rendering_path};
use crate::actions::{pattern, Action};
use crate::error::{Dropped, Error};
use crate::report::{FileSummary, Finding, Source};
use crate::store::StoreRegistry;

pub const HEXDUMP_MARKER: &str = "[hexdump removed]";

static HEXDUMP: OnceLock<Option<Regex>> = OnceLock::new();

/// `0000: 45 00 00 3c ...` or `0x0010:  4500 003c ...`
fn is_hexdump(line: &str) -> Result<bool, Error> {
    let re = pattern(&HEXDUMP, r"^\s*(?:0x)?[0-9a-fA-F]{4,8}:?\s+(?:[0-9a-fA-F]{2,4}\s+){2,}")?;
    Ok(re.is_match(line))
}

/// Splits a line read with its terminator into content and terminator.
fn split_eol(line: &[u8]) -> (&[u8], &[u8]) {
    let mut end = line.len();
    if line[..end].ends_with(b"\n") {
        end -= 1;
        if line[..end].ends_with(b"\r") {
            end -= 1;
        }
    }
    line.split_at(end)
}

/// Calls `f(line number, raw line)` for every line, terminator included.
fn read_lines(path: &Path, mut f: impl FnMut(u64, &[u8]) -> Result<()>) -> Result<()> {
    let mut reader = BufReader::new(File::open(path).with_context(|| format!("Cannot open {:?}", path))?);
    let mut buf = Vec::new();
    let mut n = 0;
    loop {
        buf.clear();
        if reader.read_until(b'\n', &mut buf).with_context(|| format!("Cannot read {:?}", path))? == 0 {
            break;
        }
        n += 1;
        f(n, &buf)?;
    }
    Ok(())
}

fn decode(line: &[u8]) -> Result<&str, Error> {
    std::str::from_utf8(line).map_err(|e| Error::UnsupportedFormat(format!("line is not UTF-8: {}", e)))
}

pub fn discover(input: &Path, stores: &mut StoreRegistry, summary: &mut FileSummary) -> Result<()> {
    read_lines(input, |_, raw| {
        summary.records += 1;
        let (content, _) = split_eol(raw);
        let text = match decode(content) {
            Ok(text) => text,
            Err(e) => {
                debug!("{:?}: {}", input, e);
                return Ok(());
            }
        };
        if is_hexdump(text)? {
            return Ok(());
        }
        Action::Auto.discover_text(text, stores)?;
        Ok(())
    })
}

fn anonymize_line(raw: &[u8], stores: &StoreRegistry) -> Result<Vec<u8>, Error> {
    let (content, eol) = split_eol(raw);
    let text = decode(content)?;
    let mut out = if is_hexdump(text)? {
        HEXDUMP_MARKER.to_string()
    } else {
        Action::Auto.anonymize_text(text, stores)?
    }
    .into_bytes();
    out.extend_from_slice(eol);
    Ok(out)
}

/// Writes `out/<rel>`; lines that cannot be anonymized go to `trash/<rel>`.
pub fn anonymize(
    input: &Path,
    rel: &Path,
    out_root: &Path,
    trash_root: &Path,
    stores: &StoreRegistry,
    summary: &mut FileSummary,
) -> Result<()> {
    let mut out = BufWriter::new(create(out_root, rel)?);
    let mut trash: Option<BufWriter<File>> = None;
    read_lines(input, |n, raw| {
        summary.records += 1;
        match anonymize_line(raw, stores) {
            Ok(line) => {
                out.write_all(&line)?;
                summary.written += 1;
            }
            Err(e) => {
                let d = Dropped::from(e).within(format!("line = {}", n));
                if d.is_fatal() {
                    return Err(anyhow::Error::new(d).context(format!("Aborting on {:?}", input)));
                }
                log_drop(rel, &d);
                summary.count_drop(&d);
                if trash.is_none() {
                    trash = Some(BufWriter::new(create(trash_root, rel)?));
                }
                if let Some(t) = trash.as_mut() {
                    t.write_all(raw)?;
                }
                summary.quarantined += 1;
            }
        }
        Ok(())
    })?;
    out.flush()?;
    if let Some(mut t) = trash {
        t.flush()?;
    }
    info!("{:?}: {} lines written, {} quarantined", rel, summary.written, summary.quarantined);
    Ok(())
}

/// Searches `out/<rel>` for original values line by line and writes the
/// clean-mode rendering to `validation/<rel>.txt`.
pub fn validate(
    rel: &Path,
    out_root: &Path,
    validation_root: &Path,
    stores: &mut StoreRegistry,
    summary: &mut FileSummary,
    findings: &mut Vec<Finding>,
) -> Result<()> {
    let mut rendering = BufWriter::new(create(validation_root, &rendering_path(rel))?);
    let file = rel.display().to_string();
    let was_clean = stores.is_clean();
    read_lines(&out_root.join(rel), |n, raw| {
        summary.records += 1;
        let (content, eol) = split_eol(raw);
        let location = format!("line {}", n);
        let text = match decode(content) {
            Ok(text) => text,
            Err(e) => {
                let d = Dropped::from(e).within(format!("line = {}", n));
                log_drop(rel, &d);
                summary.count_drop(&d);
                return Ok(());
            }
        };
        for (store, value) in stores.residuals(text) {
            findings.push(Finding { file: file.clone(), location: location.clone(), store, value, source: Source::Output });
        }
        stores.set_clean_mode(true);
        let clean = Action::Auto.anonymize_text(text, stores);
        stores.set_clean_mode(was_clean);
        rendering.write_all(clean?.as_bytes())?;
        rendering.write_all(eol)?;
        Ok(())
    })?;
    rendering.flush()?;
    summary.residuals = findings.iter().filter(|f| f.file == file).count() as u64;
    Ok(())
}
