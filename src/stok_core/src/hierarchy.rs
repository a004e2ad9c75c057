use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use hmac::Hmac;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha512;
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, Zeroizing};

use crate::defs;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Error {
    KeyDerivationFailed,
    /// PIN mismatch and corrupted key material are deliberately not
    /// distinguishable through this error.
    LoginIncorrect,
    FunctionFailed,
}
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    SecurityOfficer,
    User,
}

/// PBKDF2 parameters for one derived key: a fixed iteration count and a
/// 64-byte salt (32-byte purpose constant + 32 random bytes). Safe to
/// persist; the derived key is not stored here.
#[derive(Clone, Serialize, Deserialize)]
pub struct KdfSlot {
    pub iterations: u32,
    pub salt: Vec<u8>,
}

impl KdfSlot {
    fn fresh(purpose: &[u8; defs::KDF_PURPOSE_LEN], iterations: u32) -> Self {
        let mut salt = Vec::with_capacity(defs::KDF_SALT_LEN);
        salt.extend_from_slice(purpose);
        let mut random = [0u8; defs::KDF_SALT_RANDOM_LEN];
        OsRng.fill_bytes(&mut random);
        salt.extend_from_slice(&random);
        Self { iterations, salt }
    }

    fn derive(&self, pin: &str) -> Result<Zeroizing<[u8; 32]>> {
        derive_key(pin, &self.salt, self.iterations)
    }
}

/// Everything the token persists for one role: the login verifier (salt,
/// iterations and derived login key), the wrap-key KDF parameters (the
/// wrap key itself is rederived on demand, never stored), and the master
/// key wrapped under that wrap key.
#[derive(Clone, Serialize, Deserialize)]
pub struct RoleKeys {
    pub login: KdfSlot,
    pub login_key: Vec<u8>,
    pub wrap: KdfSlot,
    pub wrapped_master: Vec<u8>,
}

impl RoleKeys {
    /// Derive a role's slots from scratch for `pin` and wrap `master`
    /// under the fresh wrap key. Nothing is mutated in place, so a failure
    /// here leaves no partial state behind.
    fn initialize(role: Role, pin: &str, master: &MasterKey) -> Result<Self> {
        let login = KdfSlot::fresh(login_purpose(role), login_iterations(role));
        let login_key = login.derive(pin)?;

        let wrap = KdfSlot::fresh(wrap_purpose(role), wrap_iterations(role));
        let wrap_key = wrap.derive(pin)?;
        let wrapped_master = wrap_master(&wrap_key, master)?;

        Ok(Self {
            login,
            login_key: login_key.to_vec(),
            wrap,
            wrapped_master,
        })
    }

    fn verify_pin(&self, pin: &str) -> Result<()> {
        let candidate = self.login.derive(pin)?;
        // ct_eq handles the length-mismatch case (corrupt verifier) by
        // reporting inequality.
        if bool::from(candidate.ct_eq(&self.login_key[..])) {
            Ok(())
        } else {
            Err(Error::LoginIncorrect)
        }
    }

    fn unwrap_master(&self, pin: &str) -> Result<MasterKey> {
        let wrap_key = self.wrap.derive(pin)?;
        unwrap_master(&wrap_key, &self.wrapped_master)
    }

    fn wipe(&mut self) {
        self.login.salt.zeroize();
        self.login_key.zeroize();
        self.wrap.salt.zeroize();
        self.wrapped_master.zeroize();
    }
}

/// The token master key: generated once at token initialization, persisted
/// only in wrapped form, held unwrapped in memory just long enough to use.
pub struct MasterKey(Zeroizing<[u8; defs::MASTER_KEY_LEN]>);

impl MasterKey {
    pub fn generate() -> Self {
        let mut key = Zeroizing::new([0u8; defs::MASTER_KEY_LEN]);
        OsRng.fill_bytes(&mut key[..]);
        Self(key)
    }

    pub fn as_bytes(&self) -> &[u8; defs::MASTER_KEY_LEN] {
        &self.0
    }
}

impl core::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str("MasterKey(..)")
    }
}

impl PartialEq for MasterKey {
    fn eq(&self, other: &Self) -> bool {
        bool::from(self.0.ct_eq(&other.0[..]))
    }
}

/// The persisted key hierarchy of a token: per-role login/wrap slots plus
/// a wrapped master-key copy for each role, so either role can recover the
/// master key with its own PIN.
#[derive(Clone, Serialize, Deserialize)]
pub struct KeyHierarchy {
    pub version: u32,
    pub so: RoleKeys,
    pub user: RoleKeys,
}

impl KeyHierarchy {
    /// Build a fresh hierarchy: new salts, new login keys, a new random
    /// master key wrapped under both roles' wrap keys. Nothing escapes on
    /// failure.
    pub fn initialize(so_pin: &str, user_pin: &str) -> Result<(Self, MasterKey)> {
        let master = MasterKey::generate();
        let so = RoleKeys::initialize(Role::SecurityOfficer, so_pin, &master)?;
        let user = RoleKeys::initialize(Role::User, user_pin, &master)?;
        Ok((
            Self {
                version: defs::TOKEN_DATA_VERSION,
                so,
                user,
            },
            master,
        ))
    }

    fn role_keys(&self, role: Role) -> &RoleKeys {
        match role {
            Role::SecurityOfficer => &self.so,
            Role::User => &self.user,
        }
    }

    /// Check `pin` against the persisted login verifier for `role`.
    pub fn verify_pin(&self, role: Role, pin: &str) -> Result<()> {
        self.role_keys(role).verify_pin(pin)
    }

    /// Verify `pin` and recover the master key through `role`'s wrapped
    /// copy. The caller owns the returned key and should drop it as soon
    /// as it is done; it zeroizes itself.
    pub fn unwrap_master_key(&self, role: Role, pin: &str) -> Result<MasterKey> {
        let keys = self.role_keys(role);
        keys.verify_pin(pin)?;
        keys.unwrap_master(pin)
    }

    /// Change one role's PIN: recover the master key with the old PIN,
    /// rebuild that role's slots with fresh salts, re-wrap the master key
    /// for that role. The master key value itself is unchanged and the
    /// other role is untouched.
    pub fn set_pin(&mut self, role: Role, old_pin: &str, new_pin: &str) -> Result<()> {
        let master = self.unwrap_master_key(role, old_pin)?;
        let fresh = RoleKeys::initialize(role, new_pin, &master)?;
        match role {
            Role::SecurityOfficer => self.so = fresh,
            Role::User => self.user = fresh,
        }
        Ok(())
    }

    /// Scrub all persisted key material. Used only by explicit token wipe.
    pub fn wipe(&mut self) {
        self.so.wipe();
        self.user.wipe();
    }
}

/// PBKDF2-HMAC-SHA-512, the only KDF this token format uses.
pub fn derive_key(pin: &str, salt: &[u8], iterations: u32) -> Result<Zeroizing<[u8; 32]>> {
    let mut key = Zeroizing::new([0u8; 32]);
    pbkdf2::pbkdf2::<Hmac<Sha512>>(pin.as_bytes(), salt, iterations, &mut key[..]).map_err(
        |_| {
            error!("PBKDF2 failed");
            Error::KeyDerivationFailed
        },
    )?;
    Ok(key)
}

fn wrap_master(kek: &[u8; 32], master: &MasterKey) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new_from_slice(kek).map_err(|_| Error::FunctionFailed)?;
    let mut nonce = [0u8; defs::WRAP_NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), &master.as_bytes()[..])
        .map_err(|_| Error::FunctionFailed)?;

    let mut blob = Vec::with_capacity(defs::WRAP_NONCE_LEN + ciphertext.len());
    blob.extend_from_slice(&nonce);
    blob.extend_from_slice(&ciphertext);
    Ok(blob)
}

fn unwrap_master(kek: &[u8; 32], blob: &[u8]) -> Result<MasterKey> {
    if blob.len() <= defs::WRAP_NONCE_LEN {
        return Err(Error::LoginIncorrect);
    }
    let (nonce, ciphertext) = blob.split_at(defs::WRAP_NONCE_LEN);
    let cipher = Aes256Gcm::new_from_slice(kek).map_err(|_| Error::FunctionFailed)?;
    let plaintext = Zeroizing::new(
        cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| Error::LoginIncorrect)?,
    );
    if plaintext.len() != defs::MASTER_KEY_LEN {
        return Err(Error::LoginIncorrect);
    }
    let mut key = Zeroizing::new([0u8; defs::MASTER_KEY_LEN]);
    key.copy_from_slice(&plaintext);
    Ok(MasterKey(key))
}

fn login_purpose(role: Role) -> &'static [u8; defs::KDF_PURPOSE_LEN] {
    match role {
        Role::SecurityOfficer => defs::SO_LOGIN_PURPOSE,
        Role::User => defs::USER_LOGIN_PURPOSE,
    }
}

fn wrap_purpose(role: Role) -> &'static [u8; defs::KDF_PURPOSE_LEN] {
    match role {
        Role::SecurityOfficer => defs::SO_WRAP_PURPOSE,
        Role::User => defs::USER_WRAP_PURPOSE,
    }
}

fn login_iterations(role: Role) -> u32 {
    match role {
        Role::SecurityOfficer => defs::SO_LOGIN_ITERATIONS,
        Role::User => defs::USER_LOGIN_ITERATIONS,
    }
}

fn wrap_iterations(role: Role) -> u32 {
    match role {
        Role::SecurityOfficer => defs::SO_WRAP_ITERATIONS,
        Role::User => defs::USER_WRAP_ITERATIONS,
    }
}
