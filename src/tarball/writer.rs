use std::fs::{self, File, OpenOptions, Permissions};
use std::io;
use std::os::unix::fs::{symlink, DirBuilderExt, FileExt, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{Error, Result};
use crate::tarball::{regular_mode, FileEntry, FileSet, TarballOptions};
use crate::wire::HashId;

struct OpenFile {
    index: usize,
    file: File,
}

/// Write-side view of the virtual tarball: reconstructs the file collection
/// under a destination root from arbitrary positioned writes.
///
/// Files are created lazily on first touch and truncated to their declared
/// size up front to reserve disk space; writes may arrive in any order and
/// may repeat. Symlinks and empty files materialize when their terminator
/// byte position is written.
pub struct TarballWriter {
    set: FileSet,
    root: PathBuf,
    options: TarballOptions,
    open: Option<OpenFile>,
    /// per file: terminator already processed (symlink created / empty file
    /// forced into existence)
    materialized: Vec<bool>,
}

impl TarballWriter {
    pub fn new(
        entries: Vec<FileEntry>,
        root: impl Into<PathBuf>,
        options: TarballOptions,
    ) -> Result<TarballWriter> {
        let entries = if options.compat_mode {
            entries
                .into_iter()
                .map(|mut e| {
                    e.mode = regular_mode(0o644);
                    e
                })
                .collect()
        } else {
            entries
        };

        let set = FileSet::new(entries)?;
        let materialized = vec![false; set.len()];
        Ok(TarballWriter {
            set,
            root: root.into(),
            options,
            open: None,
            materialized,
        })
    }

    pub fn size(&self) -> i64 {
        self.set.size()
    }

    pub fn hash_id(&self) -> HashId {
        self.set.hash_id()
    }

    pub fn file_set(&self) -> &FileSet {
        &self.set
    }

    /// Write `src` into the virtual byte range at `offset`, mirroring
    /// `TarballReader::read_at`: file contents go to the owning files, each
    /// terminator position must carry `0x00`.
    pub fn write_at(&mut self, src: &[u8], offset: i64) -> Result<usize> {
        if src.is_empty() {
            return Err(Error::NilBuffer);
        }
        if offset < 0 || offset >= self.set.size() {
            return Err(Error::OutOfRange {
                start: offset,
                end_ex: offset,
                size: self.set.size(),
            });
        }

        let mut total = 0;
        let mut offset = offset;
        while total < src.len() && offset < self.set.size() {
            let index = self
                .set
                .locate(offset)
                .expect("offset was checked against stream bounds");
            let (file_size, local) = {
                let f = &self.set.files()[index];
                (f.entry.size, offset - f.offset)
            };

            if local < file_size {
                let want = (src.len() - total).min((file_size - local) as usize);
                let file = self.file_for(index)?;
                file.write_all_at(&src[total..total + want], local as u64)?;
                total += want;
                offset += want as i64;
            } else {
                if src[total] != 0 {
                    return Err(Error::BadPaddingByte(offset));
                }
                self.on_terminator(index)?;
                total += 1;
                offset += 1;
            }
        }
        Ok(total)
    }

    /// Finalize the currently open file and release all resources. Must be
    /// called for destination modes to be fully applied.
    pub fn close(&mut self) -> Result<()> {
        self.finalize_open()
    }

    fn destination(&self, index: usize) -> PathBuf {
        self.root.join(&self.set.files()[index].entry.path)
    }

    fn file_for(&mut self, index: usize) -> Result<&File> {
        if self.open.as_ref().map(|o| o.index) != Some(index) {
            self.finalize_open()?;
            let file = self.create_file(index)?;
            self.open = Some(OpenFile { index, file });
        }
        Ok(&self.open.as_ref().expect("just opened").file)
    }

    fn create_file(&mut self, index: usize) -> Result<File> {
        let entry = &self.set.files()[index].entry;
        let dest = self.destination(index);

        self.create_parent_dirs(&dest, entry.mode)?;

        let mut opts = OpenOptions::new();
        opts.write(true).create(true);
        if !self.options.compat_mode {
            opts.mode(entry.mode & 0o7777);
        }

        let file = match opts.open(&dest) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::PermissionDenied && !self.options.compat_mode => {
                // a previous run may have left the file without owner-write
                let writable = (entry.mode | 0o200) & 0o7777;
                fs::set_permissions(&dest, Permissions::from_mode(writable))?;
                opts.open(&dest)?
            }
            Err(e) => return Err(e.into()),
        };

        // reserve the full size; out-of-order writes land in a sparse file
        file.set_len(entry.size as u64)?;
        Ok(file)
    }

    fn create_parent_dirs(&self, dest: &Path, mode: u32) -> Result<()> {
        if let Some(parent) = dest.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                let mut builder = fs::DirBuilder::new();
                builder.recursive(true);
                if !self.options.compat_mode {
                    // directories must stay traversable by the owner
                    builder.mode((mode & 0o777) | 0o700);
                }
                builder.create(parent)?;
            }
        }
        Ok(())
    }

    fn on_terminator(&mut self, index: usize) -> Result<()> {
        if self.materialized[index] {
            return Ok(());
        }

        let entry = self.set.files()[index].entry.clone();
        if entry.is_symlink() {
            let dest = self.destination(index);
            self.create_parent_dirs(&dest, entry.mode)?;
            match symlink(&entry.symlink_target, &dest) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    debug!("symlink '{}' already exists", entry.path);
                }
                Err(e) => return Err(e.into()),
            }
        } else {
            // guarantees creation of files whose contents never produce a
            // write (empty files), and is a no-op for everything else
            self.file_for(index)?;
        }

        self.materialized[index] = true;
        Ok(())
    }

    fn finalize_open(&mut self) -> Result<()> {
        if let Some(open) = self.open.take() {
            drop(open.file);
            if !self.options.compat_mode {
                let entry = &self.set.files()[open.index].entry;
                let dest = self.root.join(&entry.path);
                fs::set_permissions(&dest, Permissions::from_mode(entry.mode & 0o7777))?;
            }
        }
        Ok(())
    }
}

impl Drop for TarballWriter {
    fn drop(&mut self) {
        let _ = self.finalize_open();
    }
}
