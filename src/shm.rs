//! Low-level POSIX shared memory region holding the ring
//!
//! `SharedRegion` is the only place that touches the raw mapping. Everything
//! above it goes through bounds-checked slot accessors and the two cursor
//! accessors.

use crate::error::{Result, RingError};
use rustix::fd::OwnedFd;
use rustix::fs::ftruncate;
use rustix::io::Errno;
use rustix::mm::{mmap, munmap, MapFlags, ProtFlags};
use rustix::shm::{shm_open, shm_unlink, Mode, ShmOFlags};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, Ordering};

/// Magic number for region validation
pub const REGION_MAGIC: u32 = 0x524E_4247; // "RNBG"
pub const REGION_VERSION: u32 = 1;

/// Cache line size
const CACHE_LINE_SIZE: usize = 64;

/// Per-slot length prefix
const SLOT_HEADER_SIZE: usize = 8;

const STATE_OPEN: u32 = 1;
const STATE_CLOSED: u32 = 2;

#[repr(C, align(64))]
struct CacheAligned<T>(T);

/// Control block at the start of the region
#[repr(C)]
struct RegionHeader {
    magic: u32,
    version: u32,
    capacity: u32,
    slot_size: u32,
    state: AtomicU32,
    /// Next slot to consume. Written only by the reader.
    head: CacheAligned<AtomicU32>,
    /// Next slot to produce. Written only by the writer.
    tail: CacheAligned<AtomicU32>,
}

const fn align_up(size: usize) -> usize {
    (size + CACHE_LINE_SIZE - 1) & !(CACHE_LINE_SIZE - 1)
}

/// Shape of a ring: `capacity` slots of `slot_size` payload bytes each
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    capacity: u32,
    slot_size: u32,
}

impl Geometry {
    pub fn new(capacity: usize, slot_size: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(RingError::InvalidConfig("ring capacity must be at least 1".into()));
        }
        if slot_size == 0 {
            return Err(RingError::InvalidConfig("slot size must be at least 1 byte".into()));
        }
        let capacity = u32::try_from(capacity)
            .map_err(|_| RingError::InvalidConfig(format!("capacity {} too large", capacity)))?;
        let slot_size = u32::try_from(slot_size)
            .map_err(|_| RingError::InvalidConfig(format!("slot size {} too large", slot_size)))?;

        let geometry = Self { capacity, slot_size };
        geometry.checked_region_size().ok_or_else(|| {
            RingError::InvalidConfig(format!(
                "{} slots of {} bytes overflow the address space",
                capacity, slot_size
            ))
        })?;
        Ok(geometry)
    }

    #[inline(always)]
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    #[inline(always)]
    pub fn slot_size(&self) -> u32 {
        self.slot_size
    }

    /// Distance between the starts of two consecutive slots
    fn slot_stride(&self) -> usize {
        align_up(SLOT_HEADER_SIZE + self.slot_size as usize)
    }

    fn slots_offset() -> usize {
        align_up(std::mem::size_of::<RegionHeader>())
    }

    fn checked_region_size(&self) -> Option<usize> {
        (self.capacity as usize)
            .checked_mul(self.slot_stride())?
            .checked_add(Self::slots_offset())
    }

    /// Total bytes of the shared object: header plus all slots
    pub fn region_size(&self) -> usize {
        Self::slots_offset() + self.capacity as usize * self.slot_stride()
    }
}

/// Handle to a mapped ring region
pub struct SharedRegion {
    #[allow(dead_code)]
    fd: OwnedFd,
    addr: NonNull<u8>,
    size: usize,
    geometry: Geometry,
    name: String,
    is_owner: bool,
    unlinked: bool,
}

// SAFETY: the mapping stays valid for the handle's lifetime; cursor and slot
// access is ordered by the ring's semaphores.
unsafe impl Send for SharedRegion {}
unsafe impl Sync for SharedRegion {}

impl SharedRegion {
    /// Create the named region exclusively and initialise its header
    ///
    /// Fails with `AlreadyExists` if the name is taken. On any later failure
    /// the name is unlinked again so a retry starts clean.
    pub fn create(name: &str, geometry: Geometry) -> Result<Self> {
        let fd = shm_open(
            name,
            ShmOFlags::CREATE | ShmOFlags::EXCL | ShmOFlags::RDWR,
            Mode::RUSR | Mode::WUSR | Mode::RGRP | Mode::WGRP,
        )
        .map_err(|e| match e {
            e if e == Errno::EXIST => RingError::AlreadyExists {
                name: name.to_string(),
            },
            e => RingError::ShmCreate {
                name: name.to_string(),
                source: e.into(),
            },
        })?;

        let size = geometry.region_size();
        let mapped = ftruncate(&fd, size as u64)
            .map_err(|e| RingError::Truncate(e.into()))
            .and_then(|()| map(&fd, size));
        let addr = match mapped {
            Ok(addr) => addr,
            Err(e) => {
                let _ = shm_unlink(name);
                return Err(e);
            }
        };

        // Zero initialize, then write the control block
        unsafe {
            std::ptr::write_bytes(addr.as_ptr(), 0, size);
            std::ptr::write(
                addr.as_ptr().cast::<RegionHeader>(),
                RegionHeader {
                    magic: REGION_MAGIC,
                    version: REGION_VERSION,
                    capacity: geometry.capacity,
                    slot_size: geometry.slot_size,
                    state: AtomicU32::new(STATE_OPEN),
                    head: CacheAligned(AtomicU32::new(0)),
                    tail: CacheAligned(AtomicU32::new(0)),
                },
            );
        }

        Ok(Self {
            fd,
            addr,
            size,
            geometry,
            name: name.to_string(),
            is_owner: true,
            unlinked: false,
        })
    }

    /// Map an existing region without touching its control fields
    ///
    /// `NotFound` if the name does not exist, `Closed` if the owner already
    /// marked it torn down, `GeometryMismatch` if it was created with a
    /// different shape than `geometry`.
    pub fn open(name: &str, geometry: Geometry) -> Result<Self> {
        let fd = shm_open(name, ShmOFlags::RDWR, Mode::empty()).map_err(|e| match e {
            e if e == Errno::NOENT => RingError::NotFound {
                name: name.to_string(),
            },
            e => RingError::ShmOpen {
                name: name.to_string(),
                source: e.into(),
            },
        })?;

        // Get size from file
        let stat = rustix::fs::fstat(&fd).map_err(|e| RingError::ShmOpen {
            name: name.to_string(),
            source: e.into(),
        })?;
        let size = stat.st_size as usize;
        if size < std::mem::size_of::<RegionHeader>() {
            return Err(RingError::InvalidMagic {
                expected: REGION_MAGIC,
                got: 0,
            });
        }

        let addr = map(&fd, size)?;
        let region = Self {
            fd,
            addr,
            size,
            geometry,
            name: name.to_string(),
            is_owner: false,
            unlinked: false,
        };
        region.validate()?;
        Ok(region)
    }

    fn validate(&self) -> Result<()> {
        let header = self.header();
        if header.magic != REGION_MAGIC {
            return Err(RingError::InvalidMagic {
                expected: REGION_MAGIC,
                got: header.magic,
            });
        }
        if header.version != REGION_VERSION {
            return Err(RingError::InvalidConfig(format!(
                "region version {} not supported (expected {})",
                header.version, REGION_VERSION
            )));
        }
        if header.capacity != self.geometry.capacity
            || header.slot_size != self.geometry.slot_size
            || self.size < self.geometry.region_size()
        {
            return Err(RingError::GeometryMismatch {
                expected_capacity: self.geometry.capacity,
                expected_slot_size: self.geometry.slot_size,
                found_capacity: header.capacity,
                found_slot_size: header.slot_size,
            });
        }
        if self.is_closed() {
            return Err(RingError::Closed {
                name: self.name.clone(),
            });
        }
        Ok(())
    }

    #[inline(always)]
    fn header(&self) -> &RegionHeader {
        unsafe { &*self.addr.as_ptr().cast::<RegionHeader>() }
    }

    /// Pointer to the start of slot `index`, after the bounds check
    fn slot_ptr(&self, index: u32) -> Result<*mut u8> {
        if index >= self.geometry.capacity {
            return Err(RingError::SlotOutOfRange {
                index,
                capacity: self.geometry.capacity,
            });
        }
        let offset = Geometry::slots_offset() + index as usize * self.geometry.slot_stride();
        Ok(unsafe { self.addr.as_ptr().add(offset) })
    }

    /// Copy `payload` into slot `index` and record its length
    pub fn write_slot(&self, index: u32, payload: &[u8]) -> Result<()> {
        let max = self.geometry.slot_size as usize;
        if payload.len() > max {
            return Err(RingError::MessageTooLarge {
                max,
                got: payload.len(),
            });
        }
        let slot = self.slot_ptr(index)?;
        unsafe {
            std::ptr::write(slot.cast::<u32>(), payload.len() as u32);
            std::ptr::copy_nonoverlapping(
                payload.as_ptr(),
                slot.add(SLOT_HEADER_SIZE),
                payload.len(),
            );
        }
        Ok(())
    }

    /// Payload length recorded in slot `index`
    pub fn slot_len(&self, index: u32) -> Result<usize> {
        let slot = self.slot_ptr(index)?;
        let len = unsafe { std::ptr::read(slot.cast::<u32>()) } as usize;
        // A corrupted prefix must not read past the slot
        Ok(len.min(self.geometry.slot_size as usize))
    }

    /// Copy slot `index` into `buf`, returning the payload length
    pub fn read_slot(&self, index: u32, buf: &mut [u8]) -> Result<usize> {
        let len = self.slot_len(index)?;
        if buf.len() < len {
            return Err(RingError::BufferTooSmall {
                needed: len,
                got: buf.len(),
            });
        }
        let slot = self.slot_ptr(index)?;
        unsafe {
            std::ptr::copy_nonoverlapping(slot.add(SLOT_HEADER_SIZE), buf.as_mut_ptr(), len);
        }
        Ok(len)
    }

    // Cursor accesses are Relaxed: the semaphore post/wait pair around every
    // update supplies the happens-before edge between the two processes.

    #[inline(always)]
    pub fn head(&self) -> u32 {
        self.header().head.0.load(Ordering::Relaxed)
    }

    #[inline(always)]
    pub fn set_head(&self, head: u32) {
        self.header().head.0.store(head, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn tail(&self) -> u32 {
        self.header().tail.0.load(Ordering::Relaxed)
    }

    #[inline(always)]
    pub fn set_tail(&self, tail: u32) {
        self.header().tail.0.store(tail, Ordering::Relaxed);
    }

    /// Flag the region as torn down for anyone still mapping it
    pub fn mark_closed(&self) {
        self.header().state.store(STATE_CLOSED, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.header().state.load(Ordering::Acquire) == STATE_CLOSED
    }

    /// Remove the name from the OS namespace. A no-op for non-owners.
    pub fn unlink(&mut self) -> Result<()> {
        if !self.is_owner || self.unlinked {
            return Ok(());
        }
        self.unlinked = true;
        shm_unlink(self.name.as_str()).map_err(|e| RingError::Unlink {
            name: self.name.clone(),
            source: e.into(),
        })
    }

    /// Remove a region name left behind by a crashed run
    ///
    /// Returns `Ok(false)` if there was nothing to remove.
    pub fn remove(name: &str) -> Result<bool> {
        match shm_unlink(name) {
            Ok(()) => Ok(true),
            Err(e) if e == Errno::NOENT => Ok(false),
            Err(e) => Err(RingError::Unlink {
                name: name.to_string(),
                source: e.into(),
            }),
        }
    }

    #[inline(always)]
    pub fn geometry(&self) -> Geometry {
        self.geometry
    }

    /// Get size of the mapping
    #[inline(always)]
    pub fn size(&self) -> usize {
        self.size
    }

    #[inline(always)]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Check if this handle created (and will unlink) the region
    #[inline(always)]
    pub fn is_owner(&self) -> bool {
        self.is_owner
    }
}

fn map(fd: &OwnedFd, size: usize) -> Result<NonNull<u8>> {
    let addr = unsafe {
        mmap(
            std::ptr::null_mut(),
            size,
            ProtFlags::READ | ProtFlags::WRITE,
            MapFlags::SHARED,
            fd,
            0,
        )
        .map_err(|e| RingError::Mmap(e.into()))?
    };
    NonNull::new(addr.cast::<u8>())
        .ok_or_else(|| RingError::Mmap(std::io::Error::other("mmap returned null")))
}

impl Drop for SharedRegion {
    fn drop(&mut self) {
        unsafe {
            let _ = munmap(self.addr.as_ptr().cast(), self.size);
        }

        // Only the owner ever unlinks
        if self.is_owner && !self.unlinked {
            let _ = shm_unlink(self.name.as_str());
        }
    }
}
