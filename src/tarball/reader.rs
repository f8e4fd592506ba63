use std::fs::{self, File, Permissions};
use std::io;
use std::os::unix::fs::{FileExt, PermissionsExt};

use tracing::debug;

use crate::error::{Error, Result};
use crate::tarball::{regular_mode, symlink_mode, FileEntry, FileSet, TarballOptions};
use crate::wire::HashId;

struct OpenFile {
    index: usize,
    file: File,
    /// mode to put back when this file is closed (set when opening required
    /// a temporary permission change)
    restore_mode: Option<u32>,
}

/// Read-side view of the virtual tarball. At most one source file is open at
/// any time; sequential consumption over thousands of files must not
/// accumulate descriptors.
pub struct TarballReader {
    set: FileSet,
    options: TarballOptions,
    open: Option<OpenFile>,
}

impl TarballReader {
    /// Build the stream view over local files. Every entry is `lstat`ed:
    /// sizes, modes and symlink targets come from the filesystem, never from
    /// the caller.
    pub fn new(entries: Vec<FileEntry>, options: TarballOptions) -> Result<TarballReader> {
        let mut resolved = Vec::with_capacity(entries.len());
        for mut entry in entries {
            if entry.local_path.as_os_str().is_empty() {
                return Err(Error::MissingLocalPath(entry.path));
            }

            let md = fs::symlink_metadata(&entry.local_path)?;
            let file_type = md.file_type();

            if file_type.is_dir() {
                return Err(Error::FilesOnly(entry.path));
            }
            if file_type.is_symlink() {
                if options.compat_mode {
                    return Err(Error::CompatViolation(entry.path));
                }
                entry.size = 0;
                entry.mode = symlink_mode(md.permissions().mode());
                entry.symlink_target = fs::read_link(&entry.local_path)?
                    .to_string_lossy()
                    .into_owned();
            } else if file_type.is_file() {
                entry.size = md.len() as i64;
                entry.symlink_target = String::new();
                entry.mode = if options.compat_mode {
                    regular_mode(0o644)
                } else {
                    md.permissions().mode()
                };
            } else {
                // pipes, sockets, devices - nothing we can stream
                if options.compat_mode {
                    return Err(Error::CompatViolation(entry.path));
                }
                debug!("skipping non-regular file '{}'", entry.path);
                continue;
            }

            resolved.push(entry);
        }

        Ok(TarballReader {
            set: FileSet::new(resolved)?,
            options,
            open: None,
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

    /// Fill `dst` from the virtual byte range starting at `offset`, crossing
    /// file boundaries and emitting the zero terminator after each file.
    /// Returns the number of bytes produced (short only at end of stream).
    pub fn read_at(&mut self, dst: &mut [u8], offset: i64) -> Result<usize> {
        if dst.is_empty() {
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
        while total < dst.len() && offset < self.set.size() {
            let index = self
                .set
                .locate(offset)
                .expect("offset was checked against stream bounds");
            let (file_size, local) = {
                let f = &self.set.files()[index];
                (f.entry.size, offset - f.offset)
            };

            if local < file_size {
                let want = (dst.len() - total).min((file_size - local) as usize);
                let file = self.file_for(index)?;
                file.read_exact_at(&mut dst[total..total + want], local as u64)?;
                total += want;
                offset += want as i64;
            } else {
                // the file's terminator byte
                dst[total] = 0;
                total += 1;
                offset += 1;
            }
        }
        Ok(total)
    }

    fn file_for(&mut self, index: usize) -> Result<&File> {
        if self.open.as_ref().map(|o| o.index) != Some(index) {
            self.close_open()?;

            let entry = &self.set.files()[index].entry;
            let mut restore_mode = None;
            let file = match File::open(&entry.local_path) {
                Ok(f) => f,
                Err(e) if e.kind() == io::ErrorKind::PermissionDenied && !self.options.compat_mode => {
                    // unreadable source: add owner-read for the duration
                    let readable = entry.mode | 0o400;
                    fs::set_permissions(&entry.local_path, Permissions::from_mode(readable & 0o7777))?;
                    restore_mode = Some(entry.mode);
                    File::open(&entry.local_path)?
                }
                Err(e) => return Err(e.into()),
            };

            self.open = Some(OpenFile {
                index,
                file,
                restore_mode,
            });
        }
        Ok(&self.open.as_ref().expect("just opened").file)
    }

    fn close_open(&mut self) -> Result<()> {
        if let Some(open) = self.open.take() {
            if let Some(mode) = open.restore_mode {
                let path = &self.set.files()[open.index].entry.local_path;
                fs::set_permissions(path, Permissions::from_mode(mode & 0o7777))?;
            }
        }
        Ok(())
    }

    pub fn close(&mut self) -> Result<()> {
        self.close_open()
    }
}

impl Drop for TarballReader {
    fn drop(&mut self) {
        let _ = self.close_open();
    }
}
