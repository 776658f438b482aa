use std::{
    fs::File,
    io::{Read, Seek, SeekFrom},
    path::{Path, PathBuf},
};

use tracing::{trace, warn};

use super::{Header, IndexEntry, SegmentError, HEADER_SIZE, MAGIC, VERSION};

/// An open handle onto an immutable segment file. The header is validated
/// and the sparse index is loaded into memory once, at construction.
#[derive(Debug)]
pub struct SegmentReader {
    path: PathBuf,
    header: Header,
    index: Vec<IndexEntry>,
}

impl SegmentReader {
    /// Opens `path`, validating the header and loading the sparse index.
    /// Fails with [`SegmentError::CorruptSegment`] per the invariants in
    /// the segment format documentation.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, SegmentError> {
        let path = path.as_ref().to_path_buf();
        let mut file = File::open(&path)?;

        let file_len = file.metadata()?.len();
        if file_len < HEADER_SIZE {
            return Err(SegmentError::CorruptSegment(format!(
                "file too small for header: {file_len} bytes"
            )));
        }

        let mut header_buf = [0u8; HEADER_SIZE as usize];
        file.read_exact(&mut header_buf)?;
        let header = Header::decode(&header_buf);

        if header.magic != MAGIC {
            return Err(SegmentError::CorruptSegment(format!(
                "bad magic: {:#x}",
                header.magic
            )));
        }
        if header.version > VERSION {
            return Err(SegmentError::CorruptSegment(format!(
                "unsupported version: {}",
                header.version
            )));
        }
        if header.index_offset > file_len {
            return Err(SegmentError::CorruptSegment(
                "index_offset beyond end of file".into(),
            ));
        }
        if header.index_entry_count == 0 && header.entry_count > 0 {
            return Err(SegmentError::CorruptSegment(
                "index_entry_count is zero but entry_count is nonzero".into(),
            ));
        }

        file.seek(SeekFrom::Start(header.index_offset))?;
        let mut index = Vec::with_capacity(header.index_entry_count as usize);
        let mut last_offset: Option<u64> = None;

        for _ in 0..header.index_entry_count {
            let key_len = read_i32(&mut file)?;
            if key_len < 0 {
                return Err(SegmentError::CorruptSegment("negative key_len in index".into()));
            }
            let mut key = vec![0u8; key_len as usize];
            read_exact_bounded(&mut file, &mut key, file_len)?;

            let mut offset_buf = [0u8; 8];
            file.read_exact(&mut offset_buf)?;
            let entry_offset = u64::from_le_bytes(offset_buf);

            if entry_offset >= header.index_offset {
                return Err(SegmentError::CorruptSegment(
                    "index entry offset overruns data section".into(),
                ));
            }
            if let Some(prev) = last_offset {
                if entry_offset <= prev {
                    return Err(SegmentError::CorruptSegment(
                        "index offsets not strictly increasing".into(),
                    ));
                }
            }
            last_offset = Some(entry_offset);

            index.push(IndexEntry { key, offset: entry_offset });
        }

        Ok(Self { path, header, index })
    }

    /// Looks up `key`, returning its value if present.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, SegmentError> {
        if self.header.entry_count == 0 {
            return Ok(None);
        }

        // Binary search the sparse index: entries before `split` have key
        // <= the search key, entries from `split` onward have key > it.
        // That bounds the linear scan window to at most one index stride.
        let split = self.index.partition_point(|e| e.key.as_slice() <= key);
        let start_offset = if split == 0 { HEADER_SIZE } else { self.index[split - 1].offset };
        let end_offset = self
            .index
            .get(split)
            .map(|e| e.offset)
            .unwrap_or(self.header.index_offset);

        trace!(?key, start_offset, end_offset, "segment scan window");

        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(start_offset))?;

        let mut pos = start_offset;
        while pos < end_offset {
            let key_len = read_i32(&mut file)?;
            if key_len < 0 {
                return Err(SegmentError::CorruptSegment("negative key_len in data".into()));
            }
            let mut record_key = vec![0u8; key_len as usize];
            file.read_exact(&mut record_key)?;

            let value_len = read_i32(&mut file)?;
            if value_len < 0 {
                return Err(SegmentError::CorruptSegment("negative value_len in data".into()));
            }

            if record_key == key {
                let mut value = vec![0u8; value_len as usize];
                file.read_exact(&mut value)?;
                return Ok(Some(value));
            }

            file.seek(SeekFrom::Current(value_len as i64))?;
            pos += 4 + key_len as u64 + 4 + value_len as u64;
        }

        Ok(None)
    }

    /// Reads every `(key, value)` record in the segment, in ascending
    /// key order. Used by compaction's full merge.
    pub fn scan_all(&self) -> Result<Vec<(Vec<u8>, Vec<u8>)>, SegmentError> {
        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(HEADER_SIZE))?;

        let mut out = Vec::with_capacity(self.header.entry_count as usize);
        for _ in 0..self.header.entry_count {
            let key_len = read_i32(&mut file)?;
            if key_len < 0 {
                return Err(SegmentError::CorruptSegment("negative key_len in data".into()));
            }
            let mut key = vec![0u8; key_len as usize];
            file.read_exact(&mut key)?;

            let value_len = read_i32(&mut file)?;
            if value_len < 0 {
                return Err(SegmentError::CorruptSegment("negative value_len in data".into()));
            }
            let mut value = vec![0u8; value_len as usize];
            file.read_exact(&mut value)?;

            out.push((key, value));
        }

        Ok(out)
    }

    /// Path of the underlying segment file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of data records in the segment.
    pub fn entry_count(&self) -> u32 {
        self.header.entry_count
    }

    /// Number of sparse index entries loaded. Exposed for tests.
    pub fn index_len(&self) -> usize {
        self.index.len()
    }
}

fn read_i32(file: &mut File) -> Result<i32, SegmentError> {
    let mut buf = [0u8; 4];
    file.read_exact(&mut buf)?;
    Ok(i32::from_le_bytes(buf))
}

fn read_exact_bounded(file: &mut File, buf: &mut [u8], file_len: u64) -> Result<(), SegmentError> {
    let pos = file.stream_position()?;
    if pos + buf.len() as u64 > file_len {
        warn!("key read would overrun file end");
        return Err(SegmentError::CorruptSegment(
            "length field would overrun file end".into(),
        ));
    }
    file.read_exact(buf)?;
    Ok(())
}
