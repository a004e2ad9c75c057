use std::fs;
use std::io::{BufReader, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use stok_common::defs as common_defs;
use stok_common::util::{paths, LockedFile};

use crate::defs;
use crate::hierarchy::{self, KeyHierarchy, MasterKey, Role};
use crate::object_name::{self, OverflowPolicy};
use crate::shm::{self, SharedRegion, TokenSharedState};
use crate::xlock::{self, LockConfig, XProcLock};

#[derive(Debug)]
pub enum Error {
    DataCorrupt,
    DataStore(std::io::Error),
    Hierarchy(hierarchy::Error),
    Lock(xlock::Error),
    ObjectName(object_name::Error),
    PathTooLong,
    PinLenInvalid,
    Shm(shm::Error),
    ShmNotAttached,
    TokenUninit,
}
pub type Result<T> = std::result::Result<T, Error>;

/// Replace the software lock-file creation; the returned file is what the
/// cross-process lock will flock. Backends with their own serialization
/// return any lockable file here.
pub trait LockHook: Send + Sync {
    fn create_lock(&self) -> std::io::Result<fs::File>;
}

/// Replace the software shm attach path entirely.
pub trait ShmHook: Send + Sync {
    fn attach(&self, tokname: &str) -> shm::Result<SharedRegion>;
}

/// Take full responsibility for establishing a token's key hierarchy at
/// initialization time. Hardware-backed tokens that keep key material in
/// their own secure storage leave `data.hierarchy` as `None`.
pub trait InitHook: Send + Sync {
    fn init_token_data(
        &self,
        data: &mut TokenData,
        so_pin: &str,
        user_pin: &str,
    ) -> hierarchy::Result<()>;
}

/// Optional backend replacements for whole subsystems. An unset hook
/// selects the software default path.
#[derive(Clone, Default)]
pub struct TokenHooks {
    pub lock: Option<Arc<dyn LockHook>>,
    pub shm: Option<Arc<dyn ShmHook>>,
    pub init: Option<Arc<dyn InitHook>>,
}

/// The persisted token-data record: format version, descriptive fields,
/// the next-object-name counter and the key hierarchy. Serialized as JSON
/// into the token's data directory; last writer wins.
#[derive(Clone, Serialize, Deserialize)]
pub struct TokenData {
    pub version: u32,
    pub label: String,
    pub flags: u64,
    pub next_object_name: String,
    pub hierarchy: Option<KeyHierarchy>,
}

impl TokenData {
    fn fresh(label: &str) -> Self {
        Self {
            version: defs::TOKEN_DATA_VERSION,
            label: padded_label(label),
            flags: defs::TOKEN_FLAG_INITIALIZED,
            next_object_name: String::from_utf8_lossy(defs::NEXT_OBJECT_NAME_INIT).into_owned(),
            hierarchy: None,
        }
    }
}

fn padded_label(label: &str) -> String {
    let truncated: String = label.chars().take(common_defs::TOKEN_LABEL_LEN).collect();
    format!("{:<width$}", truncated, width = common_defs::TOKEN_LABEL_LEN)
}

fn check_pin(pin: &str) -> Result<()> {
    if pin.len() < common_defs::TOKEN_MIN_PIN_LEN || pin.len() > common_defs::TOKEN_MAX_PIN_LEN {
        return Err(Error::PinLenInvalid);
    }
    Ok(())
}

#[derive(Clone)]
pub struct TokenConfig {
    pub name: String,
    pub lock: LockConfig,
    pub data_root: PathBuf,
    pub overflow_policy: OverflowPolicy,
    pub hooks: TokenHooks,
}

impl TokenConfig {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            lock: LockConfig::default(),
            data_root: PathBuf::from(common_defs::DATA_ROOT_DIR),
            overflow_policy: OverflowPolicy::Fail,
            hooks: TokenHooks::default(),
        }
    }
}

/// One process's view of a token: its cross-process lock state, an
/// optional shm attachment, and the last loaded copy of the persisted
/// token-data record. All shared-state mutation goes through `lock`/
/// `unlock`; read-only callers may see a stale record until they reload.
pub struct Token {
    config: TokenConfig,
    xproc: XProcLock,
    shm: Option<SharedRegion>,
    data: Option<TokenData>,
}

impl Token {
    pub fn new(config: TokenConfig) -> Self {
        Self {
            config,
            xproc: XProcLock::new(),
            shm: None,
            data: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn data(&self) -> Option<&TokenData> {
        self.data.as_ref()
    }

    pub fn is_initialized(&self) -> bool {
        self.data.is_some()
    }

    /// Set up the lock (software path or backend hook) and pick up any
    /// previously persisted token-data record.
    pub fn open(&mut self) -> Result<()> {
        match &self.config.hooks.lock {
            Some(hook) => {
                let file = hook.create_lock().map_err(|e| {
                    error!("backend lock hook failed: {}", e);
                    Error::Lock(xlock::Error::LockSetupFailed)
                })?;
                self.xproc.adopt(file).map_err(Error::Lock)?;
            }
            None => self
                .xproc
                .open(&self.config.lock, &self.config.name)
                .map_err(Error::Lock)?,
        }

        let path = self.data_file()?;
        self.lock()?;
        let res = if path.exists() { self.load_locked() } else { Ok(()) };
        self.unlock_keeping(res)
    }

    /// Best-effort teardown: detach shm, drop the lock file. Errors are
    /// logged, not surfaced.
    pub fn close(&mut self) {
        if let Some(region) = self.shm.take() {
            let locked = self.lock().is_ok();
            if let Err(e) = region.detach(false) {
                warn!("shm detach failed during close: {:?}", e);
            }
            if locked {
                if let Err(e) = self.unlock() {
                    warn!("unlock failed during close: {:?}", e);
                }
            }
        }
        self.xproc.close();
        self.data = None;
    }

    pub fn lock(&self) -> Result<()> {
        self.xproc.acquire().map_err(Error::Lock)
    }

    pub fn unlock(&self) -> Result<()> {
        self.xproc.release().map_err(Error::Lock)
    }

    /// Release the lock while keeping `res` as the primary outcome; an
    /// unlock failure only surfaces when `res` itself succeeded.
    fn unlock_keeping<T>(&self, res: Result<T>) -> Result<T> {
        match self.xproc.release() {
            Ok(()) => res,
            Err(e) => {
                warn!("unlock failed: {:?}", e);
                res.and(Err(Error::Lock(e)))
            }
        }
    }

    /// Attach the token's shared region, creating it on first use. The
    /// existence-check-then-create sequence runs under the cross-process
    /// lock; a backend hook replaces the whole path.
    pub fn attach_shm(&mut self) -> Result<()> {
        if self.shm.is_some() {
            return Ok(());
        }
        if let Some(hook) = self.config.hooks.shm.clone() {
            self.shm = Some(hook.attach(&self.config.name).map_err(Error::Shm)?);
            return Ok(());
        }

        self.lock()?;
        let res = paths::shm_name(&self.config.name)
            .map_err(|_| Error::PathTooLong)
            .and_then(|name| shm::attach(&name).map_err(Error::Shm));
        let res = match res {
            Ok(region) => {
                self.shm = Some(region);
                Ok(())
            }
            Err(e) => Err(e),
        };
        self.unlock_keeping(res)
    }

    pub fn detach_shm(&mut self, force: bool) -> Result<()> {
        let region = self.shm.take().ok_or(Error::ShmNotAttached)?;
        self.lock()?;
        let res = region.detach(force).map_err(Error::Shm);
        self.unlock_keeping(res)
    }

    pub fn shared_state(&self) -> Result<&TokenSharedState> {
        self.shm
            .as_ref()
            .map(|r| r.state())
            .ok_or(Error::ShmNotAttached)
    }

    pub fn shared_state_mut(&mut self) -> Result<&mut TokenSharedState> {
        self.shm
            .as_mut()
            .map(|r| r.state_mut())
            .ok_or(Error::ShmNotAttached)
    }

    /// Initialize (or reinitialize) the token: fresh descriptive record,
    /// fresh key hierarchy (software default, or whatever the init hook
    /// decides). Nothing is written until every derivation has succeeded,
    /// so a failed init leaves prior state untouched on disk.
    pub fn init_token_data(&mut self, label: &str, so_pin: &str, user_pin: &str) -> Result<()> {
        check_pin(so_pin)?;
        check_pin(user_pin)?;
        self.lock()?;
        let res = self.init_locked(label, so_pin, user_pin);
        self.unlock_keeping(res)
    }

    fn init_locked(&mut self, label: &str, so_pin: &str, user_pin: &str) -> Result<()> {
        let mut data = TokenData::fresh(label);
        match &self.config.hooks.init {
            Some(hook) => hook
                .init_token_data(&mut data, so_pin, user_pin)
                .map_err(Error::Hierarchy)?,
            None => {
                let (hierarchy, _master) =
                    KeyHierarchy::initialize(so_pin, user_pin).map_err(Error::Hierarchy)?;
                data.hierarchy = Some(hierarchy);
            }
        }
        data.flags |= defs::TOKEN_FLAG_USER_PIN_INITIALIZED | defs::TOKEN_FLAG_LOGIN_REQUIRED;
        self.save_locked(&data)?;
        self.bump_generation();
        self.data = Some(data);
        Ok(())
    }

    /// Verify `pin` for `role` against the loaded record.
    pub fn login(&self, role: Role, pin: &str) -> Result<()> {
        self.hierarchy()?
            .verify_pin(role, pin)
            .map_err(Error::Hierarchy)
    }

    /// Verify `pin` and hand back the unwrapped master key. The caller
    /// uses it and drops it; it is never persisted in the clear.
    pub fn unwrap_master_key(&self, role: Role, pin: &str) -> Result<MasterKey> {
        self.hierarchy()?
            .unwrap_master_key(role, pin)
            .map_err(Error::Hierarchy)
    }

    /// Change one role's PIN and persist the updated record. The in-memory
    /// record is only swapped once the new one is safely on disk.
    pub fn set_pin(&mut self, role: Role, old_pin: &str, new_pin: &str) -> Result<()> {
        check_pin(new_pin)?;
        self.lock()?;
        let res = self.set_pin_locked(role, old_pin, new_pin);
        self.unlock_keeping(res)
    }

    fn set_pin_locked(&mut self, role: Role, old_pin: &str, new_pin: &str) -> Result<()> {
        let mut data = self.data.clone().ok_or(Error::TokenUninit)?;
        data.hierarchy
            .as_mut()
            .ok_or(Error::TokenUninit)?
            .set_pin(role, old_pin, new_pin)
            .map_err(Error::Hierarchy)?;
        self.save_locked(&data)?;
        self.bump_generation();
        self.data = Some(data);
        Ok(())
    }

    /// Allocate the next object name: advance the persisted counter under
    /// the lock and return the name that was current. Reloads the record
    /// first so counters advanced by other processes are respected.
    pub fn next_object_name(&mut self) -> Result<[u8; object_name::OBJECT_NAME_LEN]> {
        self.lock()?;
        let res = self.next_object_name_locked();
        self.unlock_keeping(res)
    }

    fn next_object_name_locked(&mut self) -> Result<[u8; object_name::OBJECT_NAME_LEN]> {
        if self.data_file()?.exists() {
            self.load_locked()?;
        }
        let mut data = self.data.clone().ok_or(Error::TokenUninit)?;

        let mut current = [0u8; object_name::OBJECT_NAME_LEN];
        let bytes = data.next_object_name.as_bytes();
        if bytes.len() != current.len() {
            return Err(Error::DataCorrupt);
        }
        current.copy_from_slice(bytes);

        let next =
            object_name::next(&current, self.config.overflow_policy).map_err(Error::ObjectName)?;
        data.next_object_name = String::from_utf8_lossy(&next).into_owned();
        self.save_locked(&data)?;
        self.data = Some(data);
        Ok(current)
    }

    /// Destroy the token's secret state: zeroize the hierarchy and remove
    /// the persisted record.
    pub fn wipe(&mut self) -> Result<()> {
        self.lock()?;
        let res = self.wipe_locked();
        self.unlock_keeping(res)
    }

    fn wipe_locked(&mut self) -> Result<()> {
        if let Some(data) = self.data.as_mut() {
            if let Some(h) = data.hierarchy.as_mut() {
                h.wipe();
            }
        }
        self.data = None;
        let path = self.data_file()?;
        if path.exists() {
            fs::remove_file(&path).map_err(Error::DataStore)?;
        }
        Ok(())
    }

    fn hierarchy(&self) -> Result<&KeyHierarchy> {
        self.data
            .as_ref()
            .and_then(|d| d.hierarchy.as_ref())
            .ok_or(Error::TokenUninit)
    }

    fn data_file(&self) -> Result<PathBuf> {
        paths::data_file(&self.config.data_root, &self.config.name)
            .map_err(|_| Error::PathTooLong)
    }

    fn save_locked(&self, data: &TokenData) -> Result<()> {
        let dir = paths::data_dir(&self.config.data_root, &self.config.name)
            .map_err(|_| Error::PathTooLong)?;
        fs::create_dir_all(&dir).map_err(Error::DataStore)?;

        let mut file = LockedFile::create_rw(self.data_file()?).map_err(Error::DataStore)?;
        file.seek(SeekFrom::Start(0)).map_err(Error::DataStore)?;
        file.set_len(0).map_err(Error::DataStore)?;
        serde_json::to_writer(file.as_mut_file(), data).map_err(|e| {
            error!("cannot persist token data: {}", e);
            Error::DataCorrupt
        })?;
        file.flush().map_err(Error::DataStore)
    }

    fn load_locked(&mut self) -> Result<()> {
        let mut file = LockedFile::open_ro(self.data_file()?).map_err(Error::DataStore)?;
        let data: TokenData =
            serde_json::from_reader(BufReader::new(file.as_mut_file())).map_err(|e| {
                error!("token data corrupt: {}", e);
                Error::DataCorrupt
            })?;
        self.data = Some(data);
        Ok(())
    }

    fn bump_generation(&mut self) {
        if let Some(region) = self.shm.as_mut() {
            let state = region.state_mut();
            state.token_data_generation = state.token_data_generation.wrapping_add(1);
        }
    }
}
