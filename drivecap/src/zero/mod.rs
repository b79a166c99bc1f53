//! Zeroing: the background zero engine and the foreground requests that
//! feed it.

pub(crate) mod background;
pub(crate) mod scrub;
pub(crate) mod user;
