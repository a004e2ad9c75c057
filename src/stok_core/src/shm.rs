use libc;
use std::ffi::CString;
use std::io::Error as IoError;
use std::mem;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Error {
    ShmUnavailable,
    ShmDetachFailed,
}
pub type Result<T> = std::result::Result<T, Error>;

/// Token-wide volatile state, visible to every process attached to the
/// token's shm region. Mutations happen only under the cross-process lock;
/// unsynchronized readers must tolerate old or new values.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct TokenSharedState {
    pub num_private_objects: u32,
    pub num_public_objects: u32,
    /// Bumped whenever the persisted token-data record is rewritten, so
    /// attached processes can notice staleness cheaply.
    pub token_data_generation: u32,
}

#[repr(C)]
struct Header {
    ref_count: u32,
}

/// A mapped, named POSIX shm region holding a refcount header followed by
/// `TokenSharedState`. Callers must hold the token's cross-process lock
/// across `attach` and `detach`: the existence-check-then-create sequence
/// and the refcount updates race otherwise.
pub struct SharedRegion {
    ptr: *mut u8,
    len: usize,
    name: CString,
}

// The region is only ever mutated under the cross-process lock.
unsafe impl Send for SharedRegion {}

/// Attach to the named region, creating and zero-initializing it if it
/// does not exist yet. Creation uses `O_EXCL`, so two creators cannot both
/// think they made it (the lock already prevents this; the flag keeps the
/// kernel-side story consistent too).
pub fn attach(name: &str) -> Result<SharedRegion> {
    let cname = CString::new(name).map_err(|_| Error::ShmUnavailable)?;
    let len = mem::size_of::<Header>() + mem::size_of::<TokenSharedState>();

    let mut created = true;
    let mut fd = unsafe {
        libc::shm_open(
            cname.as_ptr(),
            libc::O_CREAT | libc::O_EXCL | libc::O_RDWR,
            0o660 as libc::mode_t,
        )
    };
    if fd < 0 {
        let err = IoError::last_os_error();
        if err.raw_os_error() != Some(libc::EEXIST) {
            error!("shm_open({}): {}", name, err);
            return Err(Error::ShmUnavailable);
        }
        created = false;
        fd = unsafe { libc::shm_open(cname.as_ptr(), libc::O_RDWR, 0) };
        if fd < 0 {
            error!("shm_open({}): {}", name, IoError::last_os_error());
            return Err(Error::ShmUnavailable);
        }
    }

    if created {
        // ftruncate zero-fills the new region.
        let rc = unsafe { libc::ftruncate(fd, len as libc::off_t) };
        if rc != 0 {
            error!("ftruncate({}): {}", name, IoError::last_os_error());
            unsafe {
                libc::close(fd);
                libc::shm_unlink(cname.as_ptr());
            }
            return Err(Error::ShmUnavailable);
        }
    }

    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            fd,
            0,
        )
    };
    unsafe { libc::close(fd) };
    if ptr == libc::MAP_FAILED {
        error!("mmap({}): {}", name, IoError::last_os_error());
        if created {
            unsafe { libc::shm_unlink(cname.as_ptr()) };
        }
        return Err(Error::ShmUnavailable);
    }

    let region = SharedRegion {
        ptr: ptr as *mut u8,
        len,
        name: cname,
    };
    unsafe {
        let hdr = region.header();
        if created {
            (*hdr).ref_count = 1;
        } else {
            (*hdr).ref_count += 1;
        }
    }
    Ok(region)
}

impl SharedRegion {
    unsafe fn header(&self) -> *mut Header {
        self.ptr as *mut Header
    }

    unsafe fn state_ptr(&self) -> *mut TokenSharedState {
        self.ptr.add(mem::size_of::<Header>()) as *mut TokenSharedState
    }

    pub fn ref_count(&self) -> u32 {
        unsafe { (*self.header()).ref_count }
    }

    pub fn state(&self) -> &TokenSharedState {
        unsafe { &*self.state_ptr() }
    }

    pub fn state_mut(&mut self) -> &mut TokenSharedState {
        unsafe { &mut *self.state_ptr() }
    }

    /// Drop one reference and unmap. The region is unlinked when the last
    /// reference goes away, or immediately when `force` is set. Errors are
    /// reported but nothing is rolled back; treat this as best-effort
    /// cleanup.
    pub fn detach(self, force: bool) -> Result<()> {
        let remaining = unsafe {
            let hdr = self.header();
            (*hdr).ref_count = (*hdr).ref_count.saturating_sub(1);
            (*hdr).ref_count
        };
        let unlink = force || remaining == 0;

        let mut res = Ok(());
        let rc = unsafe { libc::munmap(self.ptr as *mut libc::c_void, self.len) };
        if rc != 0 {
            warn!("munmap: {}", IoError::last_os_error());
            res = Err(Error::ShmDetachFailed);
        }
        if unlink {
            let rc = unsafe { libc::shm_unlink(self.name.as_ptr()) };
            if rc != 0 {
                warn!("shm_unlink: {}", IoError::last_os_error());
                res = Err(Error::ShmDetachFailed);
            }
        }
        mem::forget(self);
        res
    }
}

impl Drop for SharedRegion {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr as *mut libc::c_void, self.len);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique_name(tag: &str) -> String {
        format!("/stok-test.{}.{}", tag, std::process::id())
    }

    #[test]
    fn create_attach_detach() {
        let name = unique_name("basic");
        let mut region = attach(&name).unwrap();
        assert_eq!(region.ref_count(), 1);
        assert_eq!(region.state().num_private_objects, 0);

        region.state_mut().num_private_objects = 7;

        let second = attach(&name).unwrap();
        assert_eq!(second.ref_count(), 2);
        assert_eq!(second.state().num_private_objects, 7);

        second.detach(false).unwrap();
        assert_eq!(region.ref_count(), 1);
        region.detach(false).unwrap();

        // Last detach unlinked the region, so a fresh attach recreates it
        // zeroed.
        let fresh = attach(&name).unwrap();
        assert_eq!(fresh.state().num_private_objects, 0);
        fresh.detach(false).unwrap();
    }

    #[test]
    fn forced_detach_unlinks_with_references_left() {
        let name = unique_name("force");
        let region = attach(&name).unwrap();
        let second = attach(&name).unwrap();
        assert_eq!(second.ref_count(), 2);

        second.detach(true).unwrap();

        let fresh = attach(&name).unwrap();
        assert_eq!(fresh.ref_count(), 1);
        fresh.detach(true).unwrap();
        drop(region);
    }
}
