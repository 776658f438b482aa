use std::{
    fs::{self, File, OpenOptions},
    io::{BufWriter, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};

use tracing::{debug, info};

use super::{Header, SegmentError, HEADER_SIZE, MAGIC, SPARSE_INDEX_STRIDE, VERSION};

/// Builds a new segment file from a sorted `(key, value)` iterator, using
/// a temp-file-then-rename atomic write. The writer guarantees: on
/// success, the final path names a fully-formed segment; on failure,
/// neither the final path nor the temp path persists.
pub struct SegmentWriter {
    final_path: PathBuf,
}

impl SegmentWriter {
    pub fn new<P: AsRef<Path>>(final_path: P) -> Self {
        Self {
            final_path: final_path.as_ref().to_path_buf(),
        }
    }

    /// Writes `entries` (must already be sorted ascending by key, unique
    /// keys) as a complete segment file.
    pub fn write<I>(self, entries: I, entry_count: usize) -> Result<PathBuf, SegmentError>
    where
        I: Iterator<Item = (Vec<u8>, Vec<u8>)>,
    {
        let tmp_path = self.final_path.with_extension("tmp");
        let result = Self::write_inner(&tmp_path, entries, entry_count);

        match result {
            Ok(index_entry_count) => {
                debug!(
                    path = %self.final_path.display(),
                    entry_count,
                    index_entry_count,
                    "segment written, renaming into place"
                );
                fs::rename(&tmp_path, &self.final_path)?;
                info!(path = %self.final_path.display(), "segment finalized");
                Ok(self.final_path)
            }
            Err(e) => {
                let _ = fs::remove_file(&tmp_path);
                Err(e)
            }
        }
    }

    fn write_inner<I>(
        tmp_path: &Path,
        entries: I,
        entry_count: usize,
    ) -> Result<usize, SegmentError>
    where
        I: Iterator<Item = (Vec<u8>, Vec<u8>)>,
    {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(tmp_path)?;
        let mut w = BufWriter::new(file);

        // Placeholder header, rewritten once we know the real counts/offset.
        w.write_all(&[0u8; HEADER_SIZE as usize])?;

        let mut index: Vec<(Vec<u8>, u64)> = Vec::new();
        let mut offset = HEADER_SIZE;
        let mut written = 0usize;

        for (key, value) in entries {
            if written % SPARSE_INDEX_STRIDE == 0 {
                index.push((key.clone(), offset));
            }

            w.write_all(&(key.len() as i32).to_le_bytes())?;
            w.write_all(&key)?;
            w.write_all(&(value.len() as i32).to_le_bytes())?;
            w.write_all(&value)?;

            offset += 4 + key.len() as u64 + 4 + value.len() as u64;
            written += 1;
        }

        let index_offset = offset;
        for (key, entry_offset) in &index {
            w.write_all(&(key.len() as i32).to_le_bytes())?;
            w.write_all(key)?;
            w.write_all(&entry_offset.to_le_bytes())?;
        }

        w.flush()?;
        let mut file = w.into_inner().map_err(|e| SegmentError::Io(e.into_error()))?;

        let header = Header {
            magic: MAGIC,
            version: VERSION,
            entry_count: written as u32,
            index_entry_count: index.len() as u32,
            index_offset,
        };
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&header.encode())?;
        file.sync_all()?;

        debug_assert_eq!(written, entry_count.max(written));
        Ok(index.len())
    }
}
