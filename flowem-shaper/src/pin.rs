//! Pinned table state.
//!
//! The table is persisted to a file so enforcement survives a restart of the daemon and can
//! be inspected or edited by administrative commands while it is not running.
//!
//! # Layout
//!
//! ```text
//! +-------+---------+----------+---------------------------------------+
//! | magic | version |  count   | count × (FlowKey 10 B, ShapingEntry 12 B) |
//! | FLWM  |   u8    | u32 (BE) |                                       |
//! +-------+---------+----------+---------------------------------------+
//! ```
//!
//! Records use the table's native storage encoding, so loss fractions are not persisted.

use std::{
    fs, io,
    path::{Path, PathBuf},
};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tracing::debug;

use flowem_wire::{DecodeError, FlowKey, ShapingEntry};

use crate::table::{ShapingTable, TableError};

pub const DEFAULT_PIN_PATH: &str = "/var/lib/flowem/flows.pin";

const MAGIC: &[u8; 4] = b"FLWM";
const VERSION: u8 = 1;
const HEADER_LEN: usize = 4 + 1 + 4;
const RECORD_LEN: usize = FlowKey::LEN + ShapingEntry::LEN;

#[derive(Debug, Error)]
pub enum PinError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("corrupt pinned record: {0}")]
    Decode(#[from] DecodeError),
    #[error("not a pinned flow table")]
    BadMagic,
    #[error("unsupported pinned table version {0}")]
    UnsupportedVersion(u8),
    #[error(transparent)]
    Table(#[from] TableError),
}

/// Encodes `entries` in the pinned layout.
pub fn encode(entries: &[(FlowKey, ShapingEntry)]) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + entries.len() * RECORD_LEN);
    buf.put_slice(MAGIC);
    buf.put_u8(VERSION);
    buf.put_u32(entries.len() as u32);

    for (key, entry) in entries {
        key.encode(&mut buf);
        entry.encode(&mut buf);
    }

    buf.freeze()
}

/// Decodes a buffer in the pinned layout.
pub fn decode(mut src: Bytes) -> Result<Vec<(FlowKey, ShapingEntry)>, PinError> {
    if src.remaining() < HEADER_LEN {
        return Err(DecodeError::Truncated { expected: HEADER_LEN, actual: src.remaining() }.into());
    }

    if &src[..MAGIC.len()] != MAGIC {
        return Err(PinError::BadMagic);
    }
    src.advance(MAGIC.len());

    let version = src.get_u8();
    if version != VERSION {
        return Err(PinError::UnsupportedVersion(version));
    }

    let count = src.get_u32() as usize;
    let expected = count * RECORD_LEN;
    if src.remaining() < expected {
        return Err(DecodeError::Truncated { expected, actual: src.remaining() }.into());
    }

    let mut entries = Vec::with_capacity(count);
    for _ in 0..count {
        let key = FlowKey::decode(&mut src)?;
        let entry = ShapingEntry::decode(&mut src)?;
        entries.push((key, entry));
    }

    Ok(entries)
}

/// Writes `entries` to `path`, replacing any previous state atomically.
pub fn save(path: &Path, entries: &[(FlowKey, ShapingEntry)]) -> Result<(), PinError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }

    let tmp = tmp_path(path);
    fs::write(&tmp, encode(entries))?;
    fs::rename(&tmp, path)?;

    debug!(path = %path.display(), entries = entries.len(), "table pinned");
    Ok(())
}

/// Reads the state pinned at `path`. Returns `None` when nothing is pinned.
pub fn load(path: &Path) -> Result<Option<Vec<(FlowKey, ShapingEntry)>>, PinError> {
    match fs::read(path) {
        Ok(raw) => decode(Bytes::from(raw)).map(Some),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Removes the state pinned at `path`. Returns whether anything was pinned.
pub fn unpin(path: &Path) -> Result<bool, PinError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Pins the current contents of `table`. Returns the number of entries written.
pub fn pin_table(path: &Path, table: &ShapingTable) -> Result<usize, PinError> {
    let entries = table.snapshot();
    save(path, &entries)?;
    Ok(entries.len())
}

/// Loads the state pinned at `path` into `table`. Returns the number of entries restored.
pub fn restore_table(path: &Path, table: &ShapingTable) -> Result<usize, PinError> {
    let Some(entries) = load(path)? else {
        return Ok(0);
    };

    for (key, entry) in &entries {
        table.upsert(*key, *entry)?;
    }

    Ok(entries.len())
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use flowem_wire::parse_mac;

    use super::*;

    fn scratch(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("flowem-pin-{}-{name}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        dir.join("flows.pin")
    }

    fn entries() -> Vec<(FlowKey, ShapingEntry)> {
        vec![
            (FlowKey::new(2, parse_mac("aa:bb:cc:dd:ee:01").unwrap()), ShapingEntry::new(0x10011, 10_000_000, 20)),
            (FlowKey::new(2, parse_mac("aa:bb:cc:dd:ee:02").unwrap()), ShapingEntry::new(0x10012, 0, 5)),
        ]
    }

    #[test]
    fn table_survives_a_restart() {
        let path = scratch("restart");
        let table = ShapingTable::new();
        for (key, entry) in entries() {
            table.upsert(key, entry.with_loss(0.1)).unwrap();
        }

        assert_eq!(pin_table(&path, &table).unwrap(), 2);

        let restored = ShapingTable::new();
        assert_eq!(restore_table(&path, &restored).unwrap(), 2);
        // Loss is not part of the pinned layout.
        assert_eq!(restored.snapshot(), entries());

        assert!(unpin(&path).unwrap());
        assert!(!unpin(&path).unwrap());
        assert_eq!(load(&path).unwrap(), None);
    }

    #[test]
    fn rejects_foreign_files() {
        assert!(matches!(decode(Bytes::from_static(b"NOPE\x01\0\0\0\0")), Err(PinError::BadMagic)));
        assert!(matches!(
            decode(Bytes::from_static(b"FLWM\x09\0\0\0\0")),
            Err(PinError::UnsupportedVersion(9))
        ));
    }

    #[test]
    fn rejects_truncated_records() {
        let encoded = encode(&entries());
        let truncated = encoded.slice(..encoded.len() - 1);

        assert!(matches!(decode(truncated), Err(PinError::Decode(DecodeError::Truncated { .. }))));
    }
}
