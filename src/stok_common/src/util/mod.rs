pub mod flock;
pub mod logger;
pub mod paths;

pub use flock::LockedFile;
