use std::path::{Path, PathBuf};

use crate::defs;

/// Per-token filesystem and shared-memory name resolution.
///
/// Every token gets its own subdirectory under the lock root (holding a
/// single `LCK..<token>` file) and under the data root (holding the
/// persisted token-data record). The POSIX shm region name is derived from
/// the token name as well, so that all processes opening the same token
/// agree on all three without coordination.

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Error {
    PathTooLong,
}
pub type Result<T> = std::result::Result<T, Error>;

fn checked(path: PathBuf) -> Result<PathBuf> {
    if path.as_os_str().len() > defs::MAX_PATH_LEN {
        return Err(Error::PathTooLong);
    }
    Ok(path)
}

/// Lock subdirectory for `tokname`, under `root`.
pub fn lock_dir(root: &Path, tokname: &str) -> Result<PathBuf> {
    checked(root.join(tokname))
}

/// Lock file for `tokname`: `<root>/<tokname>/LCK..<tokname>`.
pub fn lock_file(root: &Path, tokname: &str) -> Result<PathBuf> {
    checked(root.join(tokname).join(format!(
        "{}{}",
        defs::LOCK_FILE_PREFIX,
        tokname
    )))
}

/// Data directory for `tokname`, under `root`.
pub fn data_dir(root: &Path, tokname: &str) -> Result<PathBuf> {
    checked(root.join(tokname))
}

/// Persisted token-data record for `tokname`.
pub fn data_file(root: &Path, tokname: &str) -> Result<PathBuf> {
    checked(root.join(tokname).join(defs::TOKEN_DATA_FILE))
}

/// POSIX shm object name for `tokname`. Slashes are not allowed past the
/// leading one, so the token name is folded into a flat `/stok.<tokname>`.
pub fn shm_name(tokname: &str) -> Result<String> {
    let name = format!("/{}.{}", defs::SHM_NAME_PREFIX, tokname.replace('/', "."));
    if name.len() > defs::MAX_SHM_NAME_LEN {
        return Err(Error::PathTooLong);
    }
    Ok(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_file_layout() {
        let f = lock_file(Path::new("/var/lock/stok"), "tok01").unwrap();
        assert_eq!(f, PathBuf::from("/var/lock/stok/tok01/LCK..tok01"));
    }

    #[test]
    fn shm_name_flattens_slashes() {
        assert_eq!(shm_name("a/b").unwrap(), "/stok.a.b");
    }

    #[test]
    fn overlong_paths_are_rejected() {
        let long = "x".repeat(crate::defs::MAX_PATH_LEN);
        assert_eq!(
            lock_file(Path::new("/tmp"), &long).unwrap_err(),
            Error::PathTooLong
        );
        let long_name = "x".repeat(crate::defs::MAX_SHM_NAME_LEN);
        assert_eq!(shm_name(&long_name).unwrap_err(), Error::PathTooLong);
    }
}
