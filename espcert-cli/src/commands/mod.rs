//! Command implementations.

pub(crate) mod certs;
pub(crate) mod completions;
pub(crate) mod device;
pub(crate) mod ports;
