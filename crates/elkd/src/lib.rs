//! elkd: composition root and request facade of the storage key daemon

pub mod daemon;
pub mod service;
