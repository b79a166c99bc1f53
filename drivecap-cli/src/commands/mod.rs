pub mod init;
pub mod run;
pub mod scrub;
pub mod status;
pub mod verify_invalidate;
pub mod zero;
