use libc;
use std::fs::{File, OpenOptions};
use std::io::{Error as IoError, ErrorKind, Result as IoResult};
use std::ops::{Deref, DerefMut};
use std::os::unix::io::AsRawFd;
use std::path::Path;

/// An `std::fs::File` whose inner FD holds a `libc::flock` lock for the
/// lifetime of the wrapper. Used to serialize reads and writes of the
/// persisted token-data record between processes.
///
/// `Deref`/`DerefMut` expose the inner `File` interface directly.
pub struct LockedFile(File);

impl LockedFile {
    /// Open the file at `path` read-only, under a shared lock.
    pub fn open_ro<P: AsRef<Path>>(path: P) -> IoResult<Self> {
        OpenOptions::new()
            .read(true)
            .open(path)
            .and_then(|f| Self::from_file(f, libc::LOCK_SH))
    }

    /// Open the file at `path` read-write, under an exclusive lock.
    pub fn open_rw<P: AsRef<Path>>(path: P) -> IoResult<Self> {
        OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .and_then(|f| Self::from_file(f, libc::LOCK_EX))
    }

    /// Open the file at `path` read-write, creating it if absent, under an
    /// exclusive lock. Used when a token-data record is first persisted.
    pub fn create_rw<P: AsRef<Path>>(path: P) -> IoResult<Self> {
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)
            .and_then(|f| Self::from_file(f, libc::LOCK_EX))
    }

    /// Get a mutable reference to the inner `File` object.
    pub fn as_mut_file(&mut self) -> &mut File {
        &mut self.0
    }

    fn from_file(file: File, flock_op: libc::c_int) -> IoResult<Self> {
        loop {
            let rc = unsafe { libc::flock(file.as_raw_fd(), flock_op) };
            if rc == 0 {
                break;
            }
            let err = IoError::last_os_error();

            // If our wait was interrupted, try to acquire the lock again.
            if err.kind() != ErrorKind::Interrupted {
                return Err(err);
            }
        }
        Ok(Self(file))
    }
}

impl Deref for LockedFile {
    type Target = File;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for LockedFile {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl Drop for LockedFile {
    fn drop(&mut self) {
        unsafe {
            libc::flock(self.0.as_raw_fd(), libc::LOCK_UN);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Seek, SeekFrom, Write};

    #[test]
    fn create_write_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data");

        let mut f = LockedFile::create_rw(&path).unwrap();
        f.write_all(b"hello").unwrap();
        f.flush().unwrap();
        drop(f);

        let mut f = LockedFile::open_ro(&path).unwrap();
        let mut buf = String::new();
        f.seek(SeekFrom::Start(0)).unwrap();
        f.as_mut_file().read_to_string(&mut buf).unwrap();
        assert_eq!(buf, "hello");
    }

    #[test]
    fn open_missing_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(LockedFile::open_rw(dir.path().join("absent")).is_err());
    }
}
