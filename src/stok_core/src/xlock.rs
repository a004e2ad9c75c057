use libc;
use std::ffi::CString;
use std::fs::{self, File, Permissions};
use std::io::{Error as IoError, ErrorKind};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::io::{AsRawFd, FromRawFd};
use std::path::PathBuf;
use std::sync::{Condvar, Mutex};
use std::thread::{self, ThreadId};

use stok_common::defs as common_defs;
use stok_common::util::paths;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Error {
    CannotLock,
    LockSetupFailed,
    NotLocked,
    PathTooLong,
}
pub type Result<T> = std::result::Result<T, Error>;

/// Where the software lock path keeps its files, and which group (if any)
/// should own them. Backends that provide their own serialization bypass
/// this entirely via `token::LockHook`.
#[derive(Clone, Debug)]
pub struct LockConfig {
    pub root: PathBuf,
    pub group: Option<String>,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from(common_defs::LOCK_ROOT_DIR),
            group: Some(common_defs::TOKEN_GROUP.to_string()),
        }
    }
}

struct LockState {
    file: Option<File>,
    owner: Option<ThreadId>,
    depth: u32,
}

/// Two-layer token lock: an explicit owner/depth record serializes threads
/// within this process (and makes nested acquire/release pairs cheap),
/// while an exclusive `flock` on the per-token lock file excludes other
/// processes for as long as any thread here holds the lock.
///
/// The flock is taken on the 0->1 depth transition and dropped on 1->0;
/// `release` must be called exactly once per `acquire`.
pub struct XProcLock {
    state: Mutex<LockState>,
    unlocked: Condvar,
}

impl XProcLock {
    /// A lock in the "unopened" state. `open` (or `adopt`) must succeed
    /// before `acquire` can.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LockState {
                file: None,
                owner: None,
                depth: 0,
            }),
            unlocked: Condvar::new(),
        }
    }

    /// Lazily create the per-token lock directory and file, and keep the
    /// file open for subsequent `acquire` calls. Idempotent: an already
    /// opened lock is left untouched.
    ///
    /// The directory is created mode 0o770 and the lock file 0o440, both
    /// owned by the configured group when one is set. Missing pieces are
    /// created; existing ones are tolerated.
    pub fn open(&self, config: &LockConfig, tokname: &str) -> Result<()> {
        let mut st = self.state.lock().map_err(|_| Error::CannotLock)?;
        if st.file.is_some() {
            return Ok(());
        }

        let gid = match &config.group {
            Some(name) => Some(group_gid(name).ok_or_else(|| {
                error!("lock group {} not found", name);
                Error::LockSetupFailed
            })?),
            None => None,
        };

        let dir = paths::lock_dir(&config.root, tokname).map_err(|_| Error::PathTooLong)?;
        match fs::create_dir_all(&dir) {
            Ok(()) => {}
            Err(ref e) if e.kind() == ErrorKind::AlreadyExists => {}
            Err(e) => {
                error!("cannot create lock dir {}: {}", dir.display(), e);
                return Err(Error::LockSetupFailed);
            }
        }
        // mkdir is subject to umask, so group permissions are set again
        // explicitly.
        fs::set_permissions(&dir, Permissions::from_mode(0o770)).map_err(|e| {
            error!("cannot set lock dir mode: {}", e);
            Error::LockSetupFailed
        })?;
        if let Some(gid) = gid {
            chown_gid(&dir, gid)?;
        }

        let path = paths::lock_file(&config.root, tokname).map_err(|_| Error::PathTooLong)?;
        let file = open_lock_file(&path)?;
        if let Some(gid) = gid {
            let rc = unsafe { libc::fchown(file.as_raw_fd(), libc::uid_t::MAX, gid) };
            if rc != 0 {
                error!(
                    "fchown({}): {}",
                    path.display(),
                    IoError::last_os_error()
                );
                return Err(Error::LockSetupFailed);
            }
        }

        st.file = Some(file);
        Ok(())
    }

    /// Adopt an already opened lock file, e.g. one supplied by a backend
    /// locking hook.
    pub fn adopt(&self, file: File) -> Result<()> {
        let mut st = self.state.lock().map_err(|_| Error::CannotLock)?;
        if st.file.is_none() {
            st.file = Some(file);
        }
        Ok(())
    }

    /// Block until this thread holds the token lock. Reentrant: a thread
    /// already holding the lock just deepens its hold.
    pub fn acquire(&self) -> Result<()> {
        let me = thread::current().id();
        let mut st = self.state.lock().map_err(|_| Error::CannotLock)?;

        if st.owner == Some(me) {
            st.depth += 1;
            return Ok(());
        }
        while st.owner.is_some() {
            st = self.unlocked.wait(st).map_err(|_| Error::CannotLock)?;
        }

        let file = st.file.as_ref().ok_or_else(|| {
            error!("no lock file to lock with");
            Error::CannotLock
        })?;
        flock(file, libc::LOCK_EX)?;

        st.owner = Some(me);
        st.depth = 1;
        Ok(())
    }

    /// Undo one `acquire`. The OS-level lock is dropped only when the
    /// depth returns to zero.
    pub fn release(&self) -> Result<()> {
        let me = thread::current().id();
        let mut st = self.state.lock().map_err(|_| Error::CannotLock)?;

        if st.owner != Some(me) || st.depth == 0 {
            return Err(Error::NotLocked);
        }
        if st.depth == 1 {
            let file = st.file.as_ref().ok_or(Error::CannotLock)?;
            flock(file, libc::LOCK_UN)?;
            st.owner = None;
            st.depth = 0;
            self.unlocked.notify_one();
        } else {
            st.depth -= 1;
        }
        Ok(())
    }

    /// Release the lock file descriptor. Any held flock goes with it.
    pub fn close(&self) {
        if let Ok(mut st) = self.state.lock() {
            st.file = None;
            st.owner = None;
            st.depth = 0;
            self.unlocked.notify_all();
        }
    }
}

fn flock(file: &File, op: libc::c_int) -> Result<()> {
    loop {
        let rc = unsafe { libc::flock(file.as_raw_fd(), op) };
        if rc == 0 {
            return Ok(());
        }
        let err = IoError::last_os_error();
        // An interrupted wait is retried; anything else is fatal.
        if err.kind() != ErrorKind::Interrupted {
            error!("flock: {}", err);
            return Err(Error::CannotLock);
        }
    }
}

/// Open the lock file, creating it mode 0o440 if absent. `OpenOptions`
/// cannot create without write access, so this goes through `libc::open`
/// with `O_CREAT | O_RDONLY` like the lock file is meant to be used.
fn open_lock_file(path: &PathBuf) -> Result<File> {
    let cpath = CString::new(path.as_os_str().as_bytes()).map_err(|_| Error::LockSetupFailed)?;
    let fd = unsafe {
        libc::open(
            cpath.as_ptr(),
            libc::O_CREAT | libc::O_RDONLY | libc::O_CLOEXEC,
            0o440 as libc::mode_t as libc::c_uint,
        )
    };
    if fd < 0 {
        error!("open({}): {}", path.display(), IoError::last_os_error());
        return Err(Error::LockSetupFailed);
    }
    let file = unsafe { File::from_raw_fd(fd) };
    // umask may have stripped the group bit on creation.
    let rc = unsafe { libc::fchmod(fd, 0o440) };
    if rc != 0 {
        error!("fchmod({}): {}", path.display(), IoError::last_os_error());
        return Err(Error::LockSetupFailed);
    }
    Ok(file)
}

fn group_gid(name: &str) -> Option<libc::gid_t> {
    let cname = CString::new(name).ok()?;
    let grp = unsafe { libc::getgrnam(cname.as_ptr()) };
    if grp.is_null() {
        return None;
    }
    Some(unsafe { (*grp).gr_gid })
}

fn chown_gid(path: &PathBuf, gid: libc::gid_t) -> Result<()> {
    let cpath = CString::new(path.as_os_str().as_bytes()).map_err(|_| Error::LockSetupFailed)?;
    let rc = unsafe { libc::chown(cpath.as_ptr(), libc::geteuid(), gid) };
    if rc != 0 {
        error!("chown({}): {}", path.display(), IoError::last_os_error());
        return Err(Error::LockSetupFailed);
    }
    Ok(())
}
