//! Media verification: sniff verify, media error remap and
//! verify-invalidate of untrusted chunk records.

pub(crate) mod invalidate;
pub(crate) mod remap;
pub(crate) mod sniff;
