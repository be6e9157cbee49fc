//! Run-scoped names for the OS objects backing one ring
//!
//! Every object lives in a machine-global namespace, so two benchmark runs
//! using fixed names would trample each other. Names are composed from a
//! fixed prefix and a run token; both processes of a run must agree on the
//! token, which is why the default is the process group id.

use crate::error::{Result, RingError};
use std::fmt;

/// Default prefix for every object name
pub const DEFAULT_PREFIX: &str = "ringbench";

/// Longest full name accepted (`sem_open` reserves a few bytes of NAME_MAX)
pub const MAX_NAME_LEN: usize = 250;

const SUFFIXES: [&str; 5] = ["shm", "ready", "mutex", "free", "filled"];

/// Per-run unique token
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunToken(String);

impl RunToken {
    /// Use an explicit token, e.g. one handed to both processes by a launcher
    pub fn new(token: impl Into<String>) -> Result<Self> {
        let token = token.into();
        validate_component(&token)?;
        Ok(Self(token))
    }

    /// Token derived from the caller's process group id
    ///
    /// A writer and reader started from the same shell pipeline or job share
    /// a process group, so they derive the same token independently.
    pub fn process_group() -> Self {
        let pgid = rustix::process::getpgrp().as_raw_nonzero().get();
        Self(format!("pg{}", pgid))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RunToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The five names used by one ring: region, readiness latch, mutex and the
/// two counting semaphores
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceNames {
    shm: String,
    ready: String,
    mutex: String,
    free: String,
    filled: String,
}

impl ResourceNames {
    pub fn new(prefix: &str, token: &RunToken) -> Result<Self> {
        validate_component(prefix)?;

        let make = |suffix: &str| format!("/{}-{}-{}", prefix, token.as_str(), suffix);
        let longest = SUFFIXES
            .iter()
            .map(|s| make(s))
            .max_by_key(|n| n.len())
            .unwrap_or_default();
        if longest.len() > MAX_NAME_LEN {
            return Err(RingError::InvalidName {
                name: longest,
                reason: "name too long",
            });
        }

        Ok(Self {
            shm: make("shm"),
            ready: make("ready"),
            mutex: make("mutex"),
            free: make("free"),
            filled: make("filled"),
        })
    }

    /// Names under the default prefix for the current process group
    pub fn for_process_group() -> Result<Self> {
        Self::new(DEFAULT_PREFIX, &RunToken::process_group())
    }

    pub fn shm(&self) -> &str {
        &self.shm
    }

    pub fn ready(&self) -> &str {
        &self.ready
    }

    pub fn mutex(&self) -> &str {
        &self.mutex
    }

    pub fn free(&self) -> &str {
        &self.free
    }

    pub fn filled(&self) -> &str {
        &self.filled
    }

    /// Semaphore names in creation order
    pub fn semaphores(&self) -> [&str; 4] {
        [&self.ready, &self.mutex, &self.free, &self.filled]
    }
}

fn validate_component(part: &str) -> Result<()> {
    if part.is_empty() {
        return Err(RingError::InvalidName {
            name: part.to_string(),
            reason: "empty name component",
        });
    }
    if !part
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
    {
        return Err(RingError::InvalidName {
            name: part.to_string(),
            reason: "only ASCII letters, digits, '_' and '.' are allowed",
        });
    }
    Ok(())
}
