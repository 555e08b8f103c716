//! Identifier Minter
//!
//! Function ids are `/<prefix>/<hash32(file)>-<counter>[-<name>]`. The counter
//! belongs to one compile of one file, so two call sites in the same file never
//! collide; the hash keeps files apart on a best-effort basis.

use sha2::{Digest, Sha256};

pub const DEFAULT_PREFIX: &str = "__thaler";
pub const ANONYMOUS: &str = "anonymous";

/// First 32 bits of the SHA-256 digest of `input`.
pub fn hash32(input: &str) -> u32 {
    let digest = Sha256::digest(input.as_bytes());
    u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]])
}

#[derive(Debug, Clone)]
pub struct IdMinter {
    base: String,
    counter: u32,
    dev_mode: bool,
}

impl IdMinter {
    pub fn new(file_path: &str, prefix: Option<&str>, origin: Option<&str>, dev_mode: bool) -> Self {
        let prefix = prefix.unwrap_or(DEFAULT_PREFIX).trim_matches('/');
        let origin = origin.unwrap_or("").trim_end_matches('/');
        IdMinter {
            base: format!("{}/{}/{:x}-", origin, prefix, hash32(file_path)),
            counter: 0,
            dev_mode,
        }
    }

    /// Number of ids minted so far.
    pub fn count(&self) -> u32 {
        self.counter
    }

    pub fn mint(&mut self, dev_name: Option<&str>) -> String {
        let id = format!("{}{}", self.base, self.counter);
        self.counter += 1;
        if self.dev_mode {
            format!("{}-{}", id, dev_name.unwrap_or(ANONYMOUS))
        } else {
            id
        }
    }
}
