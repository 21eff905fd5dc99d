//! Append-only durable log of length-prefixed MessagePack records.

use std::fmt;
use std::io::SeekFrom;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use crate::utils::RiverError;

use serde::{de::DeserializeOwned, Serialize};

use rmp_serde::decode::from_slice as decode_from_slice;
use rmp_serde::encode::to_vec as encode_to_vec;

use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

/// Durable log backed by a single file. Each record is an 8-byte big-endian
/// length header followed by the encoded entry. The file cursor is kept at
/// EOF between operations.
pub(crate) struct DurableLog<Ent> {
    /// Path of the backing file.
    path: PathBuf,

    /// Backing file handle.
    backer: File,

    /// Current size of the file in bytes.
    file_size: usize,

    _entry: PhantomData<Ent>,
}

impl<Ent> fmt::Debug for DurableLog<Ent> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "DurableLog({}, {} bytes)", self.path.display(), self.file_size)
    }
}

impl<Ent> DurableLog<Ent>
where
    Ent: fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Opens the log at `path`, creating the file if absent.
    pub(crate) async fn new_and_setup(path: &Path) -> Result<Self, RiverError> {
        if !fs::try_exists(path).await? {
            File::create(path).await?;
            pf_info!("created log file '{}'", path.display());
        } else {
            pf_info!("log file '{}' already exists", path.display());
        }
        let mut backer =
            OpenOptions::new().read(true).write(true).open(path).await?;
        let file_size = backer.seek(SeekFrom::End(0)).await? as usize;

        Ok(DurableLog {
            path: path.to_path_buf(),
            backer,
            file_size,
            _entry: PhantomData,
        })
    }

    pub(crate) fn size(&self) -> usize {
        self.file_size
    }

    /// Appends an entry at EOF, syncing data to disk if `sync` is set.
    /// Returns the new file size.
    pub(crate) async fn append(
        &mut self,
        entry: &Ent,
        sync: bool,
    ) -> Result<usize, RiverError> {
        let entry_bytes = encode_to_vec(entry)?;
        let entry_len = entry_bytes.len();

        // write entry length header first
        self.backer.write_u64(entry_len as u64).await?;

        // then entry content
        self.backer.write_all(&entry_bytes[..]).await?;

        if sync {
            self.backer.sync_data().await?;
        }

        self.file_size += 8 + entry_len;
        Ok(self.file_size)
    }

    /// Reads every complete entry from the start. A torn record at the tail
    /// (from a crash mid-append) is cut off so later appends stay readable.
    pub(crate) async fn replay(&mut self) -> Result<Vec<Ent>, RiverError> {
        let mut entries = vec![];
        let mut offset = 0;
        loop {
            let (entry, end_offset) =
                Self::read_entry(&mut self.backer, self.file_size, offset).await?;
            match entry {
                Some(entry) => {
                    entries.push(entry);
                    offset = end_offset;
                }
                None => break,
            }
        }

        if offset < self.file_size {
            pf_warn!(
                "truncating torn log tail at {} (file size {})",
                offset,
                self.file_size
            );
            self.backer.set_len(offset as u64).await?;
            self.backer.sync_all().await?;
            self.file_size = offset;
        }
        self.backer.seek(SeekFrom::End(0)).await?; // recover cursor to EOF
        Ok(entries)
    }

    /// Discards the whole log.
    pub(crate) async fn truncate(&mut self) -> Result<(), RiverError> {
        self.backer.set_len(0).await?;
        self.backer.seek(SeekFrom::End(0)).await?;
        self.backer.sync_all().await?;
        self.file_size = 0;
        Ok(())
    }

    /// Reads the entry at given offset. Returns `None` if no complete entry
    /// starts there.
    async fn read_entry(
        backer: &mut File,
        file_size: usize,
        offset: usize,
    ) -> Result<(Option<Ent>, usize), RiverError> {
        if offset + 8 > file_size {
            if offset < file_size {
                pf_warn!(
                    "read header end offset {} out of file bound {}",
                    offset + 8,
                    file_size
                );
            }
            return Ok((None, offset));
        }

        // read entry length header
        backer.seek(SeekFrom::Start(offset as u64)).await?;
        let entry_len: usize = backer.read_u64().await? as usize;
        let offset_e = match (offset + 8).checked_add(entry_len) {
            Some(offset_e) if offset_e <= file_size => offset_e,
            _ => {
                pf_warn!("read entry invalid length {}", entry_len);
                return Ok((None, offset));
            }
        };

        // read entry content
        let mut entry_buf: Vec<u8> = vec![0; entry_len];
        backer.read_exact(&mut entry_buf[..]).await?;
        match decode_from_slice(&entry_buf) {
            Ok(entry) => Ok((Some(entry), offset_e)),
            Err(e) => {
                pf_warn!("undecodable entry at offset {}: {}", offset, e);
                Ok((None, offset))
            }
        }
    }
}

#[cfg(test)]
mod storage_tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    struct TestEntry(String);

    async fn fresh_log(path: &str) -> Result<DurableLog<TestEntry>, RiverError> {
        if fs::try_exists(path).await? {
            fs::remove_file(path).await?;
        }
        DurableLog::new_and_setup(Path::new(path)).await
    }

    #[tokio::test]
    async fn append_and_replay() -> Result<(), RiverError> {
        let path = "/tmp/river-test-log-0.log";
        let mut log = fresh_log(path).await?;
        let a = TestEntry("alpha".into());
        let b = TestEntry("beta".into());
        let mid = log.append(&a, false).await?;
        let end = log.append(&b, true).await?;
        assert!(end > mid);
        assert_eq!(log.size(), end);

        // reopen as a restarted process would
        drop(log);
        let mut log = DurableLog::<TestEntry>::new_and_setup(Path::new(path)).await?;
        assert_eq!(log.size(), end);
        assert_eq!(log.replay().await?, vec![a.clone(), b]);
        log.append(&a, true).await?;
        assert_eq!(log.replay().await?.len(), 3);
        Ok(())
    }

    #[tokio::test]
    async fn torn_tail_truncated() -> Result<(), RiverError> {
        let path = "/tmp/river-test-log-1.log";
        let mut log = fresh_log(path).await?;
        let entry = TestEntry("gamma".into());
        let good = log.append(&entry, true).await?;
        drop(log);

        // simulate a crash after a partial header
        let mut raw = OpenOptions::new().append(true).open(path).await?;
        raw.write_all(&[0, 0, 0]).await?;
        raw.sync_all().await?;
        drop(raw);

        let mut log = DurableLog::<TestEntry>::new_and_setup(Path::new(path)).await?;
        assert_eq!(log.size(), good + 3);
        assert_eq!(log.replay().await?, vec![entry.clone()]);
        assert_eq!(log.size(), good);
        log.append(&entry, true).await?;
        assert_eq!(log.replay().await?.len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn corrupt_length_truncated() -> Result<(), RiverError> {
        let path = "/tmp/river-test-log-3.log";
        let mut log = fresh_log(path).await?;
        let entry = TestEntry("epsilon".into());
        let good = log.append(&entry, true).await?;
        drop(log);

        // garbage header claiming a length near the top of the range
        let mut raw = OpenOptions::new().append(true).open(path).await?;
        raw.write_u64(u64::MAX - 3).await?;
        raw.write_all(b"junk").await?;
        raw.sync_all().await?;
        drop(raw);

        let mut log = DurableLog::<TestEntry>::new_and_setup(Path::new(path)).await?;
        assert_eq!(log.replay().await?, vec![entry]);
        assert_eq!(log.size(), good);
        Ok(())
    }

    #[tokio::test]
    async fn truncate_all() -> Result<(), RiverError> {
        let mut log = fresh_log("/tmp/river-test-log-2.log").await?;
        log.append(&TestEntry("delta".into()), false).await?;
        log.truncate().await?;
        assert_eq!(log.size(), 0);
        assert!(log.replay().await?.is_empty());
        Ok(())
    }
}
