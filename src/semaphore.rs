//! Named POSIX counting semaphores
//!
//! Three of them give the ring its flow control (`mutex`, `free`, `filled`);
//! a fourth, the readiness latch, tells an attaching process that the
//! creator has finished initialising everything.
//!
//! Waits default to "forever". A timeout turns an indefinite block into
//! `RingError::Timeout`, which lets callers layer their own shutdown checks
//! on top without changing the protocol.

use crate::error::{Result, RingError};
use crate::names::ResourceNames;
use std::ffi::CString;
use std::io;
use std::ptr::NonNull;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Permission bits for created semaphores
const SEM_MODE: libc::c_uint = 0o660;

/// Handle to one named semaphore
pub struct NamedSemaphore {
    sem: NonNull<libc::sem_t>,
    name: String,
    is_owner: bool,
    unlinked: bool,
}

// SAFETY: sem_wait/sem_post/sem_getvalue are thread-safe on the same handle
unsafe impl Send for NamedSemaphore {}
unsafe impl Sync for NamedSemaphore {}

impl NamedSemaphore {
    /// Create a semaphore exclusively with the given initial count
    pub fn create(name: &str, initial: u32) -> Result<Self> {
        let c_name = c_name(name)?;
        let sem = unsafe {
            libc::sem_open(
                c_name.as_ptr(),
                libc::O_CREAT | libc::O_EXCL,
                SEM_MODE,
                initial as libc::c_uint,
            )
        };
        if sem == libc::SEM_FAILED {
            let err = io::Error::last_os_error();
            return Err(match err.raw_os_error() {
                Some(libc::EEXIST) => RingError::AlreadyExists {
                    name: name.to_string(),
                },
                _ => RingError::SemCreate {
                    name: name.to_string(),
                    source: err,
                },
            });
        }

        Ok(Self {
            sem: non_null(sem, name)?,
            name: name.to_string(),
            is_owner: true,
            unlinked: false,
        })
    }

    /// Open an existing semaphore without changing its count
    pub fn open(name: &str) -> Result<Self> {
        let c_name = c_name(name)?;
        let sem = unsafe { libc::sem_open(c_name.as_ptr(), 0) };
        if sem == libc::SEM_FAILED {
            let err = io::Error::last_os_error();
            return Err(match err.raw_os_error() {
                Some(libc::ENOENT) => RingError::NotFound {
                    name: name.to_string(),
                },
                _ => RingError::SemOpen {
                    name: name.to_string(),
                    source: err,
                },
            });
        }

        Ok(Self {
            sem: non_null(sem, name)?,
            name: name.to_string(),
            is_owner: false,
            unlinked: false,
        })
    }

    /// Block until the count is positive, then decrement it
    pub fn acquire(&self) -> Result<()> {
        self.acquire_timeout(None)
    }

    /// Like `acquire`, giving up with `Timeout` once `timeout` has elapsed.
    /// `None` waits forever.
    pub fn acquire_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        let Some(timeout) = timeout else {
            loop {
                if unsafe { libc::sem_wait(self.sem.as_ptr()) } == 0 {
                    return Ok(());
                }
                let err = io::Error::last_os_error();
                if err.raw_os_error() != Some(libc::EINTR) {
                    return Err(self.wait_error(err));
                }
            }
        };

        // sem_timedwait takes an absolute CLOCK_REALTIME deadline
        let deadline = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .saturating_add(timeout);
        let mut ts: libc::timespec = unsafe { std::mem::zeroed() };
        ts.tv_sec = deadline.as_secs() as libc::time_t;
        ts.tv_nsec = deadline.subsec_nanos() as libc::c_long;

        loop {
            if unsafe { libc::sem_timedwait(self.sem.as_ptr(), &ts) } == 0 {
                return Ok(());
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) => continue,
                Some(libc::ETIMEDOUT) => {
                    return Err(RingError::Timeout {
                        name: self.name.clone(),
                        timeout,
                    })
                }
                _ => return Err(self.wait_error(err)),
            }
        }
    }

    /// Decrement without blocking. Returns `false` if the count was zero.
    pub fn try_acquire(&self) -> Result<bool> {
        loop {
            if unsafe { libc::sem_trywait(self.sem.as_ptr()) } == 0 {
                return Ok(true);
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) => continue,
                Some(libc::EAGAIN) => return Ok(false),
                _ => return Err(self.wait_error(err)),
            }
        }
    }

    /// Increment the count, waking at most one waiter
    pub fn release(&self) -> Result<()> {
        if unsafe { libc::sem_post(self.sem.as_ptr()) } == 0 {
            Ok(())
        } else {
            Err(RingError::SemPost {
                name: self.name.clone(),
                source: io::Error::last_os_error(),
            })
        }
    }

    /// Current count (a snapshot; it may change immediately)
    pub fn value(&self) -> Result<u32> {
        let mut value: libc::c_int = 0;
        if unsafe { libc::sem_getvalue(self.sem.as_ptr(), &mut value) } != 0 {
            return Err(self.wait_error(io::Error::last_os_error()));
        }
        // Linux reports 0 rather than a negative waiter count
        Ok(value.max(0) as u32)
    }

    /// Remove the name from the OS namespace. A no-op for non-owners.
    pub fn unlink(&mut self) -> Result<()> {
        if !self.is_owner || self.unlinked {
            return Ok(());
        }
        self.unlinked = true;
        if Self::remove(&self.name)? {
            Ok(())
        } else {
            Err(RingError::NotFound {
                name: self.name.clone(),
            })
        }
    }

    /// Unlink a semaphore name. `Ok(false)` if it did not exist.
    pub fn remove(name: &str) -> Result<bool> {
        let c_name = c_name(name)?;
        if unsafe { libc::sem_unlink(c_name.as_ptr()) } == 0 {
            return Ok(true);
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::ENOENT) => Ok(false),
            _ => Err(RingError::Unlink {
                name: name.to_string(),
                source: err,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_owner(&self) -> bool {
        self.is_owner
    }

    fn wait_error(&self, source: io::Error) -> RingError {
        RingError::SemWait {
            name: self.name.clone(),
            source,
        }
    }
}

impl Drop for NamedSemaphore {
    fn drop(&mut self) {
        unsafe {
            libc::sem_close(self.sem.as_ptr());
        }
        if self.is_owner && !self.unlinked {
            let _ = Self::remove(&self.name);
        }
    }
}

fn c_name(name: &str) -> Result<CString> {
    CString::new(name).map_err(|_| RingError::InvalidName {
        name: name.to_string(),
        reason: "contains a NUL byte",
    })
}

fn non_null(sem: *mut libc::sem_t, name: &str) -> Result<NonNull<libc::sem_t>> {
    NonNull::new(sem).ok_or_else(|| RingError::SemOpen {
        name: name.to_string(),
        source: io::Error::other("sem_open returned null"),
    })
}

/// One-shot readiness gate between creator and attacher
///
/// Created at zero before anything else exists and signalled once after the
/// creator has initialised every other object. An attacher passes the latch
/// by acquiring and immediately re-releasing it, so it stays open for anyone
/// who comes later.
pub struct ReadyLatch {
    sem: NamedSemaphore,
}

impl ReadyLatch {
    pub fn create(name: &str) -> Result<Self> {
        Ok(Self {
            sem: NamedSemaphore::create(name, 0)?,
        })
    }

    pub fn open(name: &str) -> Result<Self> {
        Ok(Self {
            sem: NamedSemaphore::open(name)?,
        })
    }

    /// Mark initialisation complete
    pub fn signal(&self) -> Result<()> {
        self.sem.release()
    }

    /// Wait until the creator has signalled
    pub fn wait(&self, timeout: Option<Duration>) -> Result<()> {
        self.sem.acquire_timeout(timeout)?;
        self.sem.release()
    }

    pub fn is_open(&self) -> Result<bool> {
        Ok(self.sem.value()? > 0)
    }

    pub fn unlink(&mut self) -> Result<()> {
        self.sem.unlink()
    }
}

/// The three steady-state flow-control semaphores of a ring
pub struct FlowControl {
    /// Guards the producer's copy and tail update (binary, starts unlocked)
    pub mutex: NamedSemaphore,
    /// Slots available for writing, starts at capacity
    pub free: NamedSemaphore,
    /// Slots available for reading, starts at zero
    pub filled: NamedSemaphore,
}

impl FlowControl {
    pub fn create(names: &ResourceNames, capacity: u32) -> Result<Self> {
        // Created one by one so a failure drops (and unlinks) the earlier ones
        let mutex = NamedSemaphore::create(names.mutex(), 1)?;
        let free = NamedSemaphore::create(names.free(), capacity)?;
        let filled = NamedSemaphore::create(names.filled(), 0)?;
        Ok(Self { mutex, free, filled })
    }

    pub fn open(names: &ResourceNames) -> Result<Self> {
        Ok(Self {
            mutex: NamedSemaphore::open(names.mutex())?,
            free: NamedSemaphore::open(names.free())?,
            filled: NamedSemaphore::open(names.filled())?,
        })
    }

    /// Unlink all three names, reporting the first failure
    pub fn unlink(&mut self) -> Result<()> {
        let results = [self.mutex.unlink(), self.free.unlink(), self.filled.unlink()];
        results.into_iter().collect()
    }
}
