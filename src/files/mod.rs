//! Input discovery and the per-format processors.

pub mod pcap;
pub mod text;

use anyhow::{Context, Result};
use serde::Serialize;
use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

use crate::config::FileConfig;
use crate::error::{DropKind, Dropped};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    Pcap,
    Text,
}

const PCAP_MAGIC: [u32; 2] = [0xa1b2c3d4, 0xa1b23c4d];
const PCAPNG_MAGIC: u32 = 0x0a0d0d0a;

impl FileKind {
    /// Classifies a file by its first bytes: a legacy capture header, or text.
    pub fn detect(path: &Path) -> Result<Option<FileKind>> {
        let mut head = Vec::with_capacity(512);
        File::open(path)
            .with_context(|| format!("Cannot open {:?}", path))?
            .take(512)
            .read_to_end(&mut head)
            .with_context(|| format!("Cannot read {:?}", path))?;
        if head.len() >= 4 {
            let le = u32::from_le_bytes([head[0], head[1], head[2], head[3]]);
            let be = u32::from_be_bytes([head[0], head[1], head[2], head[3]]);
            if PCAP_MAGIC.contains(&le) || PCAP_MAGIC.contains(&be) {
                return Ok(Some(FileKind::Pcap));
            }
            if le == PCAPNG_MAGIC {
                warn!("pcapng file {:?} skipped – only legacy pcap supported", path);
                return Ok(None);
            }
        }
        let text = match std::str::from_utf8(&head) {
            Ok(_) => true,
            // A multi-byte character cut at the sample boundary.
            Err(e) => e.error_len().is_none(),
        };
        Ok(text.then_some(FileKind::Text))
    }

    pub fn priority(self, conf: &FileConfig) -> u32 {
        match self {
            FileKind::Pcap => conf.pcap.priority,
            FileKind::Text => conf.text.priority,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InputFile {
    /// Path relative to the scanned directory; outputs mirror it.
    pub path: PathBuf,
    pub kind: FileKind,
}

fn walk(root: &Path, dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    for entry in fs::read_dir(dir).with_context(|| format!("Cannot list {:?}", dir))? {
        let path = entry?.path();
        if path.is_dir() {
            walk(root, &path, out)?;
        } else if let Ok(rel) = path.strip_prefix(root) {
            out.push(rel.to_path_buf());
        }
    }
    Ok(())
}

/// Every processable file under `dir`, by priority and then path.
pub fn collect(dir: &Path, conf: &FileConfig) -> Result<Vec<InputFile>> {
    let mut paths = Vec::new();
    if dir.is_dir() {
        walk(dir, dir, &mut paths)?;
    }
    let mut files = Vec::new();
    for path in paths {
        match FileKind::detect(&dir.join(&path))? {
            Some(kind) => files.push(InputFile { path, kind }),
            None => warn!("Unsupported file {:?} skipped", path),
        }
    }
    files.sort_by(|a, b| (a.kind.priority(conf), &a.path).cmp(&(b.kind.priority(conf), &b.path)));
    debug!("{} input files in {:?}", files.len(), dir);
    Ok(files)
}

/// Opens `root/rel` for writing, creating parent directories.
pub fn create(root: &Path, rel: &Path) -> Result<File> {
    let path = root.join(rel);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("Cannot create {:?}", parent))?;
    }
    File::create(&path).with_context(|| format!("Cannot create {:?}", path))
}

/// `validation/<rel>.txt`, keeping the original extension in the name.
pub fn rendering_path(rel: &Path) -> PathBuf {
    let mut name = rel.as_os_str().to_owned();
    name.push(".txt");
    PathBuf::from(name)
}

/// Explicit drops are expected; implicit drops and errors need a look.
pub fn log_drop(rel: &Path, d: &Dropped) {
    match d.kind {
        DropKind::Explicit => info!("{}: {}", rel.display(), d),
        DropKind::Implicit => warn!("{}: {}", rel.display(), d),
        DropKind::Error => error!("{}: {}", rel.display(), d),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_and_orders_inputs() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("a.log"), "10.0.0.1 up\n").unwrap();
        fs::write(dir.path().join("sub/z.pcap"), 0xa1b2c3d4u32.to_le_bytes()).unwrap();
        fs::write(dir.path().join("b.pcapng"), 0x0a0d0d0au32.to_le_bytes()).unwrap();
        fs::write(dir.path().join("c.bin"), [0xffu8, 0xfe, 0x00, 0x81]).unwrap();

        let files = collect(dir.path(), &FileConfig::default()).unwrap();
        assert_eq!(
            files,
            vec![
                InputFile { path: PathBuf::from("sub/z.pcap"), kind: FileKind::Pcap },
                InputFile { path: PathBuf::from("a.log"), kind: FileKind::Text },
            ]
        );
    }

    #[test]
    fn renderings_do_not_collide() {
        assert_eq!(rendering_path(Path::new("a/call.pcap")), PathBuf::from("a/call.pcap.txt"));
        assert_ne!(rendering_path(Path::new("call.log")), rendering_path(Path::new("call.pcap")));
    }

    #[test]
    fn missing_directory_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(collect(&dir.path().join("nope"), &FileConfig::default()).unwrap().is_empty());
    }
}
