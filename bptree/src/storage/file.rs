//! Tree file I/O.
//!
//! All access is positional (`pread`/`pwrite` on unix, `seek_read`/`seek_write`
//! on windows) so reads only need a shared reference to the file.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use crate::storage::page::{self, Offset};

/// Handle to the single file backing a tree.
#[derive(Debug)]
pub struct TreeFile {
    file: File,
    path: PathBuf,
}

impl TreeFile {
    /// Open the file at `path`, creating it empty if it does not exist.
    pub fn open(path: &Path) -> Result<Self, FileError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(FileError::Io)?;

        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    /// Path the file was opened from.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current physical length of the file.
    pub fn len(&self) -> Result<u64, FileError> {
        Ok(self.file.metadata().map_err(FileError::Io)?.len())
    }

    /// Filesystem block size, or 0 if unknown.
    pub fn block_size(&self) -> Result<u64, FileError> {
        page::block_size(&self.file).map_err(FileError::Io)
    }

    /// Fill `buf` from the bytes starting at `offset`.
    ///
    /// Returns `OutOfBounds` if the range extends past the end of the file.
    pub fn read_at(&self, buf: &mut [u8], offset: Offset) -> Result<(), FileError> {
        let file_len = self.len()?;
        let len = buf.len() as u64;
        if offset.checked_add(len).is_none_or(|end| end > file_len) {
            return Err(FileError::OutOfBounds {
                offset,
                len,
                file_len,
            });
        }

        read_exact_at(&self.file, buf, offset).map_err(FileError::Io)
    }

    /// Write all of `buf` starting at `offset`, extending the file if needed.
    pub fn write_at(&self, buf: &[u8], offset: Offset) -> Result<(), FileError> {
        write_all_at(&self.file, buf, offset).map_err(FileError::Io)
    }

    /// Extend the file with zeroes to at least `len` bytes.
    ///
    /// Never shrinks the file.
    pub fn grow_to(&self, len: u64) -> Result<(), FileError> {
        if len > self.len()? {
            self.file.set_len(len).map_err(FileError::Io)?;
        }
        Ok(())
    }

    /// Flush file contents and metadata to disk.
    pub fn sync(&self) -> Result<(), FileError> {
        self.file.sync_all().map_err(FileError::Io)
    }
}

#[cfg(unix)]
fn read_exact_at(file: &File, buf: &mut [u8], offset: Offset) -> io::Result<()> {
    use std::os::unix::fs::FileExt;

    file.read_exact_at(buf, offset)
}

#[cfg(unix)]
fn write_all_at(file: &File, buf: &[u8], offset: Offset) -> io::Result<()> {
    use std::os::unix::fs::FileExt;

    file.write_all_at(buf, offset)
}

#[cfg(windows)]
fn read_exact_at(file: &File, mut buf: &mut [u8], mut offset: Offset) -> io::Result<()> {
    use std::os::windows::fs::FileExt;

    while !buf.is_empty() {
        match file.seek_read(buf, offset) {
            Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
            Ok(n) => {
                buf = &mut buf[n..];
                offset += n as u64;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

#[cfg(windows)]
fn write_all_at(file: &File, mut buf: &[u8], mut offset: Offset) -> io::Result<()> {
    use std::os::windows::fs::FileExt;

    while !buf.is_empty() {
        match file.seek_write(buf, offset) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => {
                buf = &buf[n..];
                offset += n as u64;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Errors that can occur during file operations.
#[derive(Debug)]
pub enum FileError {
    /// I/O error.
    Io(io::Error),
    /// A read extends past the end of the file.
    OutOfBounds {
        offset: Offset,
        len: u64,
        file_len: u64,
    },
}

impl std::fmt::Display for FileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::OutOfBounds {
                offset,
                len,
                file_len,
            } => write!(
                f,
                "read of {len} bytes at offset {offset} past end of file ({file_len} bytes)"
            ),
        }
    }
}

impl std::error::Error for FileError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::OutOfBounds { .. } => None,
        }
    }
}

impl From<io::Error> for FileError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn create_test_file() -> (tempfile::TempDir, PathBuf) {
        let dir = tempdir().expect("create temp dir");
        let path = dir.path().join("test.bpt");
        (dir, path)
    }

    #[test]
    fn test_open_creates_empty_file() {
        let (_dir, path) = create_test_file();
        let file = TreeFile::open(&path).expect("open file");
        assert!(path.exists());
        assert_eq!(file.len().expect("len"), 0);
        assert_eq!(file.path(), path.as_path());
    }

    #[test]
    fn test_write_and_read_at() {
        let (_dir, path) = create_test_file();
        let file = TreeFile::open(&path).expect("open file");

        file.write_at(b"hello", 4096).expect("write");
        assert_eq!(file.len().expect("len"), 4101);

        let mut buf = [0u8; 5];
        file.read_at(&mut buf, 4096).expect("read");
        assert_eq!(&buf, b"hello");

        // The gap before the write reads back as zeroes.
        let mut gap = [0xFFu8; 16];
        file.read_at(&mut gap, 0).expect("read gap");
        assert_eq!(gap, [0u8; 16]);
    }

    #[test]
    fn test_read_past_end_is_out_of_bounds() {
        let (_dir, path) = create_test_file();
        let file = TreeFile::open(&path).expect("open file");
        file.write_at(&[1, 2, 3], 0).expect("write");

        let mut buf = [0u8; 8];
        let err = file.read_at(&mut buf, 0).expect_err("should fail");
        assert!(matches!(
            err,
            FileError::OutOfBounds {
                offset: 0,
                len: 8,
                file_len: 3
            }
        ));
    }

    #[test]
    fn test_grow_to_never_shrinks() {
        let (_dir, path) = create_test_file();
        let file = TreeFile::open(&path).expect("open file");

        file.grow_to(8192).expect("grow");
        assert_eq!(file.len().expect("len"), 8192);

        file.grow_to(4096).expect("grow smaller");
        assert_eq!(file.len().expect("len"), 8192);
    }

    #[test]
    fn test_reopen_keeps_contents() {
        let (_dir, path) = create_test_file();
        {
            let file = TreeFile::open(&path).expect("open file");
            file.write_at(b"persisted", 0).expect("write");
            file.sync().expect("sync");
        }

        let file = TreeFile::open(&path).expect("reopen file");
        let mut buf = [0u8; 9];
        file.read_at(&mut buf, 0).expect("read");
        assert_eq!(&buf, b"persisted");
    }
}
