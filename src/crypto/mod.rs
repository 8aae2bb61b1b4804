//! Cryptographic utilities for the overlay
//!
//! This module provides:
//! - SHA-256 / double SHA-256 hashing
//! - Message checksums
//! - 256-bit identifiers for inventory and request nonces

pub mod hash;

pub use hash::{checksum, double_sha256, sha256, Hash256};
