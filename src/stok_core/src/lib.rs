//! Token security-state core: the cross-process lock, shared-memory
//! region, PIN-derived key hierarchy, attribute store and object-name
//! allocator shared by every process that opens a software token. The
//! PKCS#11-style dispatch layer sits above this crate; the cryptographic
//! mechanism backends sit beside it and may replace whole subsystems
//! through the hooks in [`token::TokenHooks`].

#[macro_use]
extern crate log;

pub mod attr;
pub mod hierarchy;
pub mod object_name;
pub mod shm;
pub mod token;
pub mod xlock;

pub use hierarchy::{KeyHierarchy, MasterKey, Role};
pub use object_name::OverflowPolicy;
pub use token::{Token, TokenConfig, TokenData, TokenHooks};
pub use xlock::{LockConfig, XProcLock};

/// Token format constants. Iteration counts are fixed per role and must
/// not decrease within a given `TOKEN_DATA_VERSION`.
pub mod defs {
    /// Format version tag of the persisted token-data record.
    pub const TOKEN_DATA_VERSION: u32 = 1;

    pub const SO_LOGIN_ITERATIONS: u32 = 100_000;
    pub const SO_WRAP_ITERATIONS: u32 = 150_000;
    pub const USER_LOGIN_ITERATIONS: u32 = 100_000;
    pub const USER_WRAP_ITERATIONS: u32 = 150_000;

    /// KDF salts are a fixed 32-byte purpose constant followed by 32
    /// random bytes, regenerated on every (re)initialization.
    pub const KDF_PURPOSE_LEN: usize = 32;
    pub const KDF_SALT_RANDOM_LEN: usize = 32;
    pub const KDF_SALT_LEN: usize = KDF_PURPOSE_LEN + KDF_SALT_RANDOM_LEN;

    pub const LOGIN_KEY_LEN: usize = 32;
    pub const WRAP_KEY_LEN: usize = 32;
    pub const MASTER_KEY_LEN: usize = 32;
    /// AES-GCM nonce prepended to the wrapped master-key blob.
    pub const WRAP_NONCE_LEN: usize = 12;

    pub const SO_LOGIN_PURPOSE: &[u8; 32] = b"SO-LOGIN-KEY-PBKDF2-HMAC-SHA512.";
    pub const SO_WRAP_PURPOSE: &[u8; 32] = b"SO-WRAP--KEY-PBKDF2-HMAC-SHA512.";
    pub const USER_LOGIN_PURPOSE: &[u8; 32] = b"US-LOGIN-KEY-PBKDF2-HMAC-SHA512.";
    pub const USER_WRAP_PURPOSE: &[u8; 32] = b"US-WRAP--KEY-PBKDF2-HMAC-SHA512.";

    /// First object name handed out by a freshly initialized token.
    pub const NEXT_OBJECT_NAME_INIT: &[u8; 8] = b"00000000";

    pub const TOKEN_FLAG_INITIALIZED: u64 = 0x0000_0400;
    pub const TOKEN_FLAG_USER_PIN_INITIALIZED: u64 = 0x0000_0008;
    pub const TOKEN_FLAG_LOGIN_REQUIRED: u64 = 0x0000_0004;
}
