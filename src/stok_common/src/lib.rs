pub mod util;

pub mod defs {
    /// Root directory under which each token keeps its lock subdirectory.
    pub const LOCK_ROOT_DIR: &str = "/var/lock/stok";
    /// Root directory under which each token keeps its persisted data.
    pub const DATA_ROOT_DIR: &str = "/var/lib/stok";

    /// Prefix of the per-token lock file (`LCK..<token>`).
    pub const LOCK_FILE_PREFIX: &str = "LCK..";
    /// File name of the persisted token-data record, inside the token's
    /// data directory.
    pub const TOKEN_DATA_FILE: &str = "token.json";
    /// Prefix of the per-token POSIX shared-memory region name.
    pub const SHM_NAME_PREFIX: &str = "stok";

    /// Group owning token lock directories, when present on the system.
    pub const TOKEN_GROUP: &str = "pkcs11";

    /// Longest filesystem path this library will construct.
    pub const MAX_PATH_LEN: usize = 4096;
    /// Longest POSIX shm object name (NAME_MAX on Linux).
    pub const MAX_SHM_NAME_LEN: usize = 255;

    /// Minimum length (in bytes) of a token PIN.
    pub const TOKEN_MIN_PIN_LEN: usize = 4;
    /// Maximum length (in bytes) of a token PIN.
    pub const TOKEN_MAX_PIN_LEN: usize = 64;
    /// Token labels are stored space-padded to this width.
    pub const TOKEN_LABEL_LEN: usize = 32;
}
