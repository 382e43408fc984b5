//! Tinyblob Common - Shared types and utilities
//!
//! This crate provides the common types, error definitions and checksum
//! utilities used across the tinyblob engine crates.

pub mod checksum;
pub mod config;
pub mod error;
pub mod types;

pub use checksum::{Crc32Builder, crc32, verify_crc32};
pub use config::{
    CHUNK_COUNT, COMPACT_MAX_WAIT, COMPACT_THRESHOLD, MIN_WRITABLE_CHUNK, OBJECT_ID_LEN,
    StoreConfig,
};
pub use error::{Error, Result};
pub use types::*;
