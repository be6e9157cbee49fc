//! ringbench - cross-process shared memory ring buffer benchmark
//!
//! A writer process and a reader process exchange fixed-size messages
//! through a ring of slots in POSIX shared memory. Flow control uses named
//! counting semaphores, so both sides block instead of spinning:
//!
//! - **Writer**: waits for a free slot, copies under the mutex, signals filled
//! - **Reader**: waits for a filled slot, copies out, signals free
//!
//! Whichever process creates the ring owns its names and removes them on
//! teardown. The [`bench`] module drives either role and reports throughput.

pub mod error;
pub mod names;
pub mod shm;
pub mod semaphore;
pub mod ring;
pub mod bench;

pub use error::{RingError, Result};
pub use names::{ResourceNames, RunToken};
pub use ring::{RingConfig, RingTransport};
pub use bench::{Ownership, Report, Role, Session};

#[cfg(test)]
pub(crate) mod test_util {
    use crate::names::{ResourceNames, RunToken};
    use std::sync::atomic::{AtomicUsize, Ordering};

    static COUNTER: AtomicUsize = AtomicUsize::new(0);

    /// Names no other test (or concurrent test run) will use
    pub fn unique_names(tag: &str) -> ResourceNames {
        let n = COUNTER.fetch_add(1, Ordering::Relaxed);
        let token = RunToken::new(format!("{}_{}_{}", tag, std::process::id(), n)).unwrap();
        ResourceNames::new("rbtest", &token).unwrap()
    }
}
