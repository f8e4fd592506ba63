//! The virtual tarball: a bidirectional view between a sorted file collection
//! and one contiguous byte stream.
//!
//! Every file contributes `size + 1` bytes to the stream - its contents
//! followed by a mandatory zero terminator byte. The terminator forces at
//! least one transferred byte per file, which is what materializes empty
//! files and symlinks on the receiving side.

mod reader;
mod writer;

pub use reader::TarballReader;
pub use writer::TarballWriter;

use std::hash::Hasher;
use std::path::PathBuf;

use bytes::{Buf, BufMut, BytesMut};
use rustc_hash::{FxHashSet, FxHasher};

use crate::error::{Error, Result};
use crate::wire::HashId;

/// File-type bits of a Unix `st_mode`.
const MODE_TYPE_SYMLINK: u32 = 0o120_000;
const MODE_TYPE_REGULAR: u32 = 0o100_000;
/// Permission bits carried across the wire.
const MODE_PERM_MASK: u32 = 0o7_777;

pub fn regular_mode(perm: u32) -> u32 {
    MODE_TYPE_REGULAR | (perm & MODE_PERM_MASK)
}

pub fn symlink_mode(perm: u32) -> u32 {
    MODE_TYPE_SYMLINK | (perm & MODE_PERM_MASK)
}

/// One logical file of a transfer.
///
/// `path` is the name inside the transfer: relative, `/`-separated, unique.
/// `local_path` is where the sending side reads the bytes from; it stays
/// empty on entries reconstructed from metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub path: String,
    pub local_path: PathBuf,
    pub size: i64,
    pub mode: u32,
    pub symlink_target: String,
}

impl FileEntry {
    pub fn is_symlink(&self) -> bool {
        !self.symlink_target.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TarballOptions {
    /// Lowest-common-denominator mode: non-regular files are not supported
    /// and destination modes are left to the OS default.
    pub compat_mode: bool,
}

pub(crate) struct StreamFile {
    pub entry: FileEntry,
    /// First stream byte of this file. The terminator sits at
    /// `offset + entry.size`.
    pub offset: i64,
}

/// The sorted file list with assigned stream offsets. Sender and receiver
/// derive identical layouts from identical entries.
pub struct FileSet {
    files: Vec<StreamFile>,
    size: i64,
}

impl FileSet {
    pub fn new(mut entries: Vec<FileEntry>) -> Result<FileSet> {
        let mut seen = FxHashSet::default();
        for entry in &entries {
            validate_path(&entry.path)?;
            if !seen.insert(entry.path.clone()) {
                return Err(Error::DuplicatePaths(entry.path.clone()));
            }
        }

        entries.sort_by(|a, b| a.path.cmp(&b.path));

        let mut files = Vec::with_capacity(entries.len());
        let mut size = 0;
        for entry in entries {
            let offset = size;
            size += entry.size + 1;
            files.push(StreamFile { entry, offset });
        }

        Ok(FileSet { files, size })
    }

    /// Total stream length: `Σ (size + 1)` over all files.
    pub fn size(&self) -> i64 {
        self.size
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = &FileEntry> {
        self.files.iter().map(|f| &f.entry)
    }

    pub(crate) fn files(&self) -> &[StreamFile] {
        &self.files
    }

    /// Index of the file owning stream position `offset` (contents or
    /// terminator byte).
    pub(crate) fn locate(&self, offset: i64) -> Option<usize> {
        if offset < 0 || offset >= self.size {
            return None;
        }
        let idx = self
            .files
            .partition_point(|f| f.offset + f.entry.size + 1 <= offset);
        debug_assert!(idx < self.files.len());
        Some(idx)
    }

    /// The transfer fingerprint: a 64-bit non-cryptographic hash folded over
    /// every entry in sorted order. Seedless, so identical file lists give
    /// identical ids across processes.
    pub fn hash_id(&self) -> HashId {
        let mut hasher = FxHasher::default();
        for f in &self.files {
            hasher.write(f.entry.path.as_bytes());
            hasher.write(&(f.entry.size as u64).to_le_bytes());
            hasher.write(&f.entry.mode.to_le_bytes());
            hasher.write(f.entry.symlink_target.as_bytes());
        }
        HashId::from_raw(hasher.finish())
    }
}

fn validate_path(path: &str) -> Result<()> {
    if path.is_empty() || path.starts_with('/') {
        return Err(Error::BadPath(path.to_owned()));
    }
    for component in path.split('/') {
        if component.is_empty() || component == "." || component == ".." {
            return Err(Error::BadPath(path.to_owned()));
        }
    }
    Ok(())
}

/// Serialize the metadata blob describing a file set. Layout:
/// `stream_size (i64 LE)`, `file_count (u32 LE)`, then per file
/// `path_len (u16 LE)`, path bytes, `size (i64 LE)`, `mode (u32 LE)`,
/// `symlink_len (u16 LE)`, symlink target bytes.
pub fn encode_metadata(set: &FileSet) -> Vec<u8> {
    let mut buf = BytesMut::new();
    buf.put_i64_le(set.size());
    buf.put_u32_le(set.len() as u32);
    for entry in set.entries() {
        buf.put_u16_le(entry.path.len() as u16);
        buf.put_slice(entry.path.as_bytes());
        buf.put_i64_le(entry.size);
        buf.put_u32_le(entry.mode);
        buf.put_u16_le(entry.symlink_target.len() as u16);
        buf.put_slice(entry.symlink_target.as_bytes());
    }
    buf.to_vec()
}

/// Decode a reassembled metadata blob into `(stream_size, entries)`.
pub fn decode_metadata(mut buf: &[u8]) -> Result<(i64, Vec<FileEntry>)> {
    if buf.remaining() < 8 + 4 {
        return Err(Error::BadMetadata);
    }
    let stream_size = buf.get_i64_le();
    let file_count = buf.get_u32_le();

    let mut entries = Vec::with_capacity(file_count.min(1 << 16) as usize);
    for _ in 0..file_count {
        let path = read_string(&mut buf)?;
        if buf.remaining() < 8 + 4 {
            return Err(Error::BadMetadata);
        }
        let size = buf.get_i64_le();
        let mode = buf.get_u32_le();
        let symlink_target = read_string(&mut buf)?;

        if size < 0 {
            return Err(Error::BadMetadata);
        }
        entries.push(FileEntry {
            path,
            local_path: PathBuf::new(),
            size,
            mode,
            symlink_target,
        });
    }
    Ok((stream_size, entries))
}

fn read_string(buf: &mut &[u8]) -> Result<String> {
    if buf.remaining() < 2 {
        return Err(Error::BadMetadata);
    }
    let len = buf.get_u16_le() as usize;
    if buf.remaining() < len {
        return Err(Error::BadMetadata);
    }
    let mut bytes = vec![0u8; len];
    buf.copy_to_slice(&mut bytes);
    String::from_utf8(bytes).map_err(|_| Error::BadMetadata)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    pub(crate) fn entry(path: &str, size: i64) -> FileEntry {
        FileEntry {
            path: path.to_owned(),
            local_path: PathBuf::new(),
            size,
            mode: regular_mode(0o644),
            symlink_target: String::new(),
        }
    }

    pub(crate) fn symlink_entry(path: &str, target: &str) -> FileEntry {
        FileEntry {
            path: path.to_owned(),
            local_path: PathBuf::new(),
            size: 0,
            mode: symlink_mode(0o777),
            symlink_target: target.to_owned(),
        }
    }

    #[test]
    fn test_layout() {
        let set = FileSet::new(vec![
            entry("c", 2),
            entry("a", 3),
            entry("b", 0),
        ])
        .unwrap();

        // sorted by path; each file contributes size + 1
        let offsets: Vec<(String, i64)> = set
            .files()
            .iter()
            .map(|f| (f.entry.path.clone(), f.offset))
            .collect();
        assert_eq!(
            offsets,
            vec![("a".to_owned(), 0), ("b".to_owned(), 4), ("c".to_owned(), 5)]
        );
        assert_eq!(set.size(), 3 + 1 + 0 + 1 + 2 + 1);
    }

    #[test]
    fn test_mixed_entries_stream_size() {
        let set = FileSet::new(vec![
            entry("a", 3),
            entry("b", 0),
            symlink_entry("c", "x"),
        ])
        .unwrap();
        assert_eq!(set.size(), 6);
    }

    #[rstest]
    #[case::start(0, Some("a"))]
    #[case::terminator(3, Some("a"))]
    #[case::empty_file(4, Some("b"))]
    #[case::last(5, Some("c"))]
    #[case::past_end(6, None)]
    #[case::negative(-1, None)]
    fn test_locate(#[case] offset: i64, #[case] expected: Option<&str>) {
        let set = FileSet::new(vec![
            entry("a", 3),
            entry("b", 0),
            symlink_entry("c", "x"),
        ])
        .unwrap();

        let actual = set.locate(offset).map(|i| set.files()[i].entry.path.as_str());
        assert_eq!(actual, expected);
    }

    #[rstest]
    #[case::absolute("/etc/passwd")]
    #[case::dot("a/./b")]
    #[case::dotdot("../escape")]
    #[case::trailing_dotdot("a/..")]
    #[case::empty("")]
    #[case::double_slash("a//b")]
    fn test_bad_paths(#[case] path: &str) {
        let result = FileSet::new(vec![entry(path, 1)]);
        assert!(matches!(result, Err(Error::BadPath(_))));
    }

    #[test]
    fn test_duplicate_paths() {
        let result = FileSet::new(vec![entry("a", 1), entry("a", 2)]);
        assert!(matches!(result, Err(Error::DuplicatePaths(_))));
    }

    #[test]
    fn test_hash_id_stable_and_sensitive() {
        let make = |size| {
            FileSet::new(vec![entry("a", size), symlink_entry("c", "x")])
                .unwrap()
                .hash_id()
        };

        assert_eq!(make(3), make(3));
        assert_ne!(make(3), make(4));

        let renamed = FileSet::new(vec![entry("b", 3), symlink_entry("c", "x")])
            .unwrap()
            .hash_id();
        assert_ne!(make(3), renamed);

        let retargeted = FileSet::new(vec![entry("a", 3), symlink_entry("c", "y")])
            .unwrap()
            .hash_id();
        assert_ne!(make(3), retargeted);
    }

    #[test]
    fn test_hash_id_order_independent_input() {
        // construction sorts, so input order must not matter
        let a = FileSet::new(vec![entry("a", 1), entry("b", 2)]).unwrap();
        let b = FileSet::new(vec![entry("b", 2), entry("a", 1)]).unwrap();
        assert_eq!(a.hash_id(), b.hash_id());
    }

    #[test]
    fn test_metadata_round_trip() {
        let set = FileSet::new(vec![
            entry("dir/a.txt", 1234),
            entry("b", 0),
            symlink_entry("link", "a/b/c"),
        ])
        .unwrap();

        let blob = encode_metadata(&set);
        let (stream_size, entries) = decode_metadata(&blob).unwrap();

        assert_eq!(stream_size, set.size());
        let expected: Vec<FileEntry> = set.entries().cloned().collect();
        assert_eq!(entries, expected);

        // and the layout derived on the receiving side matches
        let decoded_set = FileSet::new(entries).unwrap();
        assert_eq!(decoded_set.size(), set.size());
        assert_eq!(decoded_set.hash_id(), set.hash_id());
    }

    #[rstest]
    #[case::empty(&[])]
    #[case::truncated_header(&[1, 2, 3])]
    #[case::truncated_entry(&[6, 0, 0, 0, 0, 0, 0, 0, 1, 0, 0, 0, 5, 0, b'a'])]
    fn test_metadata_malformed(#[case] blob: &[u8]) {
        assert!(matches!(decode_metadata(blob), Err(Error::BadMetadata)));
    }
}
