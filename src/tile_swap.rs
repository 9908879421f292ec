// ============================================================================
// Swap file — on-disk backing store for evicted tile buffers
// ============================================================================
//
// Append-style file of tile records. A record's location and length are
// captured in an opaque `SwapToken`; the store keeps the token on the tile
// and treats it as a handle, nothing here is interpreted beyond
// offset + length.
//
// Deleted records go on a free list keyed by exact byte length and are
// reused by the next allocation of that length. Tile records only come in a
// handful of sizes per image (interior, right edge, bottom edge, corner), so
// exact-length reuse keeps the file from growing without needing record
// coalescing.
//
// The file lives in the configured swap directory under a per-process unique
// name and is removed when the store is dropped.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use uuid::Uuid;

use crate::error::TileError;

/// Opaque handle to one tile record in the swap file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SwapToken {
    offset: u64,
    len: usize,
}

impl SwapToken {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

pub struct SwapFile {
    file: File,
    path: PathBuf,
    /// One past the last allocated byte.
    end: u64,
    /// Freed record offsets, keyed by record length.
    free: HashMap<usize, Vec<u64>>,
    records: usize,
}

impl SwapFile {
    /// Create the backing file inside `dir` under a unique name.
    pub fn open(dir: &Path) -> Result<Self, TileError> {
        let path = dir.join(format!("tilefe-swap-{}", Uuid::new_v4()));
        if let Err(e) = fs::create_dir_all(dir) {
            return Err(TileError::SwapCreate { path, source: e });
        }
        let file = OpenOptions::new()
            .create_new(true)
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| TileError::SwapCreate {
                path: path.clone(),
                source: e,
            })?;
        crate::log_info!("swap file opened: {}", path.display());
        Ok(SwapFile {
            file,
            path,
            end: 0,
            free: HashMap::new(),
            records: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Live (allocated, not freed) record count.
    pub fn record_count(&self) -> usize {
        self.records
    }

    /// Total bytes the file spans, including freed records.
    pub fn file_len(&self) -> u64 {
        self.end
    }

    /// Reserve a record of `len` bytes, reusing a freed record of the same
    /// length when one exists.
    pub fn alloc(&mut self, len: usize) -> SwapToken {
        self.records += 1;
        if let Some(offsets) = self.free.get_mut(&len)
            && let Some(offset) = offsets.pop()
        {
            return SwapToken { offset, len };
        }
        let offset = self.end;
        self.end += len as u64;
        SwapToken { offset, len }
    }

    /// Write a tile's bytes to its record. `data` must be exactly the
    /// record's length.
    pub fn write(&mut self, token: SwapToken, data: &[u8]) -> Result<(), TileError> {
        debug_assert_eq!(data.len(), token.len);
        self.file
            .seek(SeekFrom::Start(token.offset))
            .and_then(|_| self.file.write_all(data))
            .map_err(|e| TileError::SwapWrite { source: e })
    }

    /// Read a tile's bytes back from its record into `buf`.
    pub fn read(&mut self, token: SwapToken, buf: &mut [u8]) -> Result<(), TileError> {
        debug_assert_eq!(buf.len(), token.len);
        self.file
            .seek(SeekFrom::Start(token.offset))
            .and_then(|_| self.file.read_exact(buf))
            .map_err(|e| TileError::SwapRead { source: e })
    }

    /// Release a record for reuse.
    pub fn delete(&mut self, token: SwapToken) {
        debug_assert!(self.records > 0);
        self.records -= 1;
        self.free.entry(token.len).or_default().push(token.offset);
    }
}

impl Drop for SwapFile {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            crate::log_warn!("could not remove swap file {}: {}", self.path.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_swap() -> SwapFile {
        SwapFile::open(&std::env::temp_dir()).expect("swap file in temp dir")
    }

    #[test]
    fn test_write_read_round_trip() {
        let mut swap = temp_swap();
        let data: Vec<u8> = (0..256u32).map(|i| (i * 7 % 251) as u8).collect();
        let token = swap.alloc(data.len());
        swap.write(token, &data).unwrap();

        let mut back = vec![0u8; data.len()];
        swap.read(token, &mut back).unwrap();
        assert_eq!(back, data);
    }

    #[test]
    fn test_records_do_not_clobber_each_other() {
        let mut swap = temp_swap();
        let a_data = vec![0xAAu8; 100];
        let b_data = vec![0xBBu8; 100];
        let a = swap.alloc(100);
        let b = swap.alloc(100);
        swap.write(a, &a_data).unwrap();
        swap.write(b, &b_data).unwrap();

        let mut buf = vec![0u8; 100];
        swap.read(a, &mut buf).unwrap();
        assert_eq!(buf, a_data);
        swap.read(b, &mut buf).unwrap();
        assert_eq!(buf, b_data);
    }

    #[test]
    fn test_delete_reuses_same_length_record() {
        let mut swap = temp_swap();
        let a = swap.alloc(64);
        let _b = swap.alloc(64);
        let end_before = swap.file_len();
        swap.delete(a);
        let c = swap.alloc(64);
        assert_eq!(c, a); // same offset, same length
        assert_eq!(swap.file_len(), end_before);
        // A different length must not reuse the freed slot.
        let d = swap.alloc(65);
        assert_ne!(d.len(), a.len());
        assert_eq!(swap.file_len(), end_before + 65);
    }

    #[test]
    fn test_record_count_tracks_live_records() {
        let mut swap = temp_swap();
        let a = swap.alloc(10);
        let _b = swap.alloc(20);
        assert_eq!(swap.record_count(), 2);
        swap.delete(a);
        assert_eq!(swap.record_count(), 1);
    }

    #[test]
    fn test_delete_unwritten_record_restores_accounting() {
        // An allocation abandoned before its first write (the write-back
        // error path) must go straight back to the free list.
        let mut swap = temp_swap();
        let t = swap.alloc(128);
        swap.delete(t);
        assert_eq!(swap.record_count(), 0);
        let reused = swap.alloc(128);
        assert_eq!(reused, t);
        assert_eq!(swap.file_len(), 128);
    }

    #[test]
    fn test_file_removed_on_drop() {
        let swap = temp_swap();
        let path = swap.path().to_path_buf();
        assert!(path.exists());
        drop(swap);
        assert!(!path.exists());
    }
}
