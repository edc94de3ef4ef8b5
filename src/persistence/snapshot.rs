//! Point-in-time snapshot (RDB) writer and loader.
//!
//! ## On-disk layout
//!
//! ```text
//! ┌──────────────────────────────────┐
//! │ key | size | bytes               │
//! │ key | size | bytes               │
//! │ ...                              │
//! ├──────────────────────────────────┤
//! │ crc32c(payload) LE (4 bytes)     │
//! └──────────────────────────────────┘
//! ```
//!
//! Same record triples as the AOF, but one trailing checksum over the whole
//! payload instead of per-record footers. No length prefix; the trailer is
//! the last four bytes of the file.
//!
//! A dump streams a frozen view of the index (captured under a brief read
//! lock, the portable stand-in for fork's copy-on-write page table) to a
//! `.tmp` sibling and promotes it with an atomic rename. The canonical file
//! is replaced whole or not at all.

use crate::checksum::crc32c;
use crate::index::Index;
use crate::persistence::record::{put_triple, MAX_VALUE_LEN};
use crate::persistence::{PersistError, SharedIndex};
use bytes::BytesMut;
use std::fs::OpenOptions;
use std::io::{BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::info;

/// Load and verify the snapshot at `path` into `index`. Missing and empty
/// files are both a valid cold start; anything else must parse end to end
/// with a matching trailer.
pub fn load(path: &Path, index: &mut Index) -> Result<usize, PersistError> {
    let data = match std::fs::read(path) {
        Ok(d) => d,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };
    if data.is_empty() {
        return Ok(0);
    }
    if data.len() < 4 {
        return Err(PersistError::Corruption(
            "RDB shorter than its own trailer".to_string(),
        ));
    }

    let payload = &data[..data.len() - 4];
    let trailer = u32::from_le_bytes(data[data.len() - 4..].try_into().expect("4-byte slice"));

    let mut crc = 0u32;
    let mut offset = 0usize;
    let mut count = 0usize;
    while offset < payload.len() {
        if payload.len() - offset < 8 {
            return Err(corrupt(offset, "truncated record header"));
        }
        let key = i32::from_le_bytes(payload[offset..offset + 4].try_into().expect("4 bytes"));
        let size =
            u32::from_le_bytes(payload[offset + 4..offset + 8].try_into().expect("4 bytes"))
                as usize;
        if size > MAX_VALUE_LEN {
            return Err(corrupt(offset, "implausible record size"));
        }
        let end = offset + 8 + size;
        if end > payload.len() {
            return Err(corrupt(offset, "truncated record value"));
        }

        crc = crc32c(crc, &payload[offset..end]);
        index.save(key, &payload[offset + 8..end]);
        count += 1;
        offset = end;
    }

    if crc != trailer {
        return Err(PersistError::Corruption(format!(
            "RDB checksum mismatch (computed {:#010x}, trailer {:#010x})",
            crc, trailer
        )));
    }
    Ok(count)
}

fn corrupt(offset: usize, what: &str) -> PersistError {
    PersistError::Corruption(format!("RDB record at offset {:#x}: {}", offset, what))
}

/// Write `entries` to `path` via its `.tmp` sibling: payload, CRC trailer,
/// flush, fsync, atomic rename.
pub async fn dump(path: &Path, entries: Vec<(i32, Vec<u8>)>) -> Result<(), PersistError> {
    let path = path.to_path_buf();
    let count = entries.len();
    tokio::task::spawn_blocking(move || dump_blocking(&path, &entries))
        .await
        .map_err(|_| PersistError::WriterClosed)??;
    info!(records = count, "snapshot written");
    Ok(())
}

/// Capture a frozen view of the shared index and dump it.
pub async fn dump_index(path: &Path, index: &SharedIndex) -> Result<(), PersistError> {
    let entries = index.read().await.entries();
    dump(path, entries).await
}

fn dump_blocking(path: &Path, entries: &[(i32, Vec<u8>)]) -> Result<(), PersistError> {
    let tmp = tmp_path(path);
    let file = OpenOptions::new()
        .create(true)
        .truncate(true)
        .write(true)
        .open(&tmp)?;
    let mut w = BufWriter::new(file);

    let mut crc = 0u32;
    let mut buf = BytesMut::new();
    for (key, value) in entries {
        buf.clear();
        put_triple(&mut buf, *key, value);
        crc = crc32c(crc, &buf);
        w.write_all(&buf)?;
    }
    w.write_all(&crc.to_le_bytes())?;
    w.flush()?;
    w.get_ref().sync_all()?;
    drop(w);

    std::fs::rename(&tmp, path)?;
    Ok(())
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_owned();
    os.push(".tmp");
    PathBuf::from(os)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_entries() -> Vec<(i32, Vec<u8>)> {
        (0..100)
            .map(|k| (k, format!("value-{}", k).into_bytes()))
            .collect()
    }

    #[tokio::test]
    async fn dump_then_load_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dump.rdb");

        dump(&path, sample_entries()).await.unwrap();

        let mut index = Index::new();
        let count = load(&path, &mut index).unwrap();
        assert_eq!(count, 100);
        for k in 0..100 {
            assert_eq!(index.get(k), Some(format!("value-{}", k).as_bytes()));
        }
    }

    #[tokio::test]
    async fn missing_and_empty_files_are_cold_starts() {
        let dir = tempdir().unwrap();
        let mut index = Index::new();

        assert_eq!(load(&dir.path().join("nope.rdb"), &mut index).unwrap(), 0);

        let empty = dir.path().join("empty.rdb");
        std::fs::write(&empty, b"").unwrap();
        assert_eq!(load(&empty, &mut index).unwrap(), 0);
    }

    #[tokio::test]
    async fn short_file_is_corruption() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dump.rdb");
        std::fs::write(&path, b"\x01\x02").unwrap();

        let mut index = Index::new();
        assert!(load(&path, &mut index).unwrap_err().is_corruption());
    }

    #[tokio::test]
    async fn any_payload_flip_is_detected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dump.rdb");
        dump(&path, sample_entries()).await.unwrap();

        let bytes = std::fs::read(&path).unwrap();
        // Flip a selection of payload bytes (headers, values) one at a time.
        for i in (0..bytes.len() - 4).step_by(7) {
            let mut copy = bytes.clone();
            copy[i] ^= 0xFF;
            std::fs::write(&path, &copy).unwrap();

            let mut index = Index::new();
            assert!(
                load(&path, &mut index).unwrap_err().is_corruption(),
                "flip at byte {} went undetected",
                i
            );
        }
    }

    #[tokio::test]
    async fn truncated_tail_is_detected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dump.rdb");
        dump(&path, sample_entries()).await.unwrap();

        let bytes = std::fs::read(&path).unwrap();
        std::fs::write(&path, &bytes[..bytes.len() - 1]).unwrap();

        let mut index = Index::new();
        assert!(load(&path, &mut index).unwrap_err().is_corruption());
    }

    #[tokio::test]
    async fn dump_replaces_atomically_via_tmp_sibling() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dump.rdb");

        dump(&path, vec![(1, b"first".to_vec())]).await.unwrap();
        dump(&path, vec![(1, b"second".to_vec())]).await.unwrap();

        assert!(!tmp_path(&path).exists(), "tmp sibling must not survive");
        let mut index = Index::new();
        load(&path, &mut index).unwrap();
        assert_eq!(index.get(1), Some(&b"second"[..]));
    }

    #[tokio::test]
    async fn zero_length_values_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dump.rdb");
        dump(&path, vec![(5, Vec::new())]).await.unwrap();

        let mut index = Index::new();
        assert_eq!(load(&path, &mut index).unwrap(), 1);
        assert_eq!(index.get(5), Some(&b""[..]));
    }
}
