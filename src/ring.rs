//! Ring transport: a bounded FIFO of fixed-size slots shared by one writer
//! process and one reader process
//!
//! ```text
//! produce: free.acquire -> mutex.acquire -> slot[tail] = msg -> tail++ -> mutex.release -> filled.release
//! consume: filled.acquire -> msg = slot[head] -> head++ -> free.release
//! ```
//!
//! The creating process owns every named object and removes them on
//! teardown; the attaching process only closes its handles.

use crate::error::{Result, RingError};
use crate::names::ResourceNames;
use crate::semaphore::{FlowControl, NamedSemaphore, ReadyLatch};
use crate::shm::{Geometry, SharedRegion};
use std::time::Duration;

/// Default number of slots
const DEFAULT_CAPACITY: usize = 10;

/// Default slot payload size (4KB)
const DEFAULT_SLOT_SIZE: usize = 4096;

/// Ring configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RingConfig {
    /// Number of slots
    pub capacity: usize,
    /// Maximum payload bytes per slot
    pub slot_size: usize,
    /// Bound on every blocking wait; `None` blocks forever
    pub timeout: Option<Duration>,
}

impl Default for RingConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            slot_size: DEFAULT_SLOT_SIZE,
            timeout: None,
        }
    }
}

impl RingConfig {
    pub fn geometry(&self) -> Result<Geometry> {
        Geometry::new(self.capacity, self.slot_size)
    }
}

/// One process's view of a ring
pub struct RingTransport {
    // Field order is drop order: handles close before the latch goes away
    region: SharedRegion,
    flow: FlowControl,
    ready: ReadyLatch,
    names: ResourceNames,
    timeout: Option<Duration>,
    is_owner: bool,
}

impl RingTransport {
    /// Create every named object of the ring and open the readiness latch
    ///
    /// The latch is created first and signalled last, so an attacher that
    /// finds it waits until the region and semaphores are all in place.
    pub fn create(names: &ResourceNames, config: &RingConfig) -> Result<Self> {
        let geometry = config.geometry()?;
        let ready = ReadyLatch::create(names.ready())?;
        Self::initialize(ready, names, geometry, config.timeout)
    }

    fn initialize(
        ready: ReadyLatch,
        names: &ResourceNames,
        geometry: Geometry,
        timeout: Option<Duration>,
    ) -> Result<Self> {
        let created = SharedRegion::create(names.shm(), geometry).and_then(|region| {
            FlowControl::create(names, geometry.capacity()).map(|flow| (region, flow))
        });
        let (region, flow) = match created {
            Ok(objects) => objects,
            Err(e) => {
                // Wake anyone already parked on the latch; once it is dropped
                // and unlinked they find the region missing instead of hanging
                let _ = ready.signal();
                return Err(e);
            }
        };
        ready.signal()?;

        tracing::debug!(
            shm = names.shm(),
            capacity = geometry.capacity(),
            slot_size = geometry.slot_size(),
            "created ring"
        );

        Ok(Self {
            region,
            flow,
            ready,
            names: names.clone(),
            timeout,
            is_owner: true,
        })
    }

    /// Attach to a ring created by another process
    ///
    /// Fails with `NotFound` when the names do not exist, and with `Closed`
    /// if the owner is tearing the ring down. The OS keeps no trace of
    /// unlinked names, so `NotFound` cannot tell "not created yet" from
    /// "already torn down"; callers that know their peer's start order can.
    pub fn attach(names: &ResourceNames, config: &RingConfig) -> Result<Self> {
        let geometry = config.geometry()?;
        let ready = ReadyLatch::open(names.ready())?;
        ready.wait(config.timeout)?;

        let region = SharedRegion::open(names.shm(), geometry)?;
        let flow = FlowControl::open(names)?;

        tracing::debug!(shm = names.shm(), "attached to ring");

        Ok(Self {
            region,
            flow,
            ready,
            names: names.clone(),
            timeout: config.timeout,
            is_owner: false,
        })
    }

    /// Create the ring if nobody has yet, otherwise attach to it
    ///
    /// Whoever creates the readiness latch first becomes the owner.
    pub fn create_or_attach(names: &ResourceNames, config: &RingConfig) -> Result<Self> {
        let geometry = config.geometry()?;
        match ReadyLatch::create(names.ready()) {
            Ok(ready) => Self::initialize(ready, names, geometry, config.timeout),
            Err(RingError::AlreadyExists { .. }) => Self::attach(names, config),
            Err(e) => Err(e),
        }
    }

    /// Place one message in the ring, blocking while it is full
    ///
    /// Returns once the message is in shared memory and visible to the
    /// reader.
    pub fn produce(&self, payload: &[u8]) -> Result<()> {
        let max = self.region.geometry().slot_size() as usize;
        if payload.len() > max {
            return Err(RingError::MessageTooLarge {
                max,
                got: payload.len(),
            });
        }

        self.flow.free.acquire_timeout(self.timeout)?;
        if let Err(e) = self.flow.mutex.acquire_timeout(self.timeout) {
            // Hand the reserved slot back so free + filled stays at capacity
            self.flow.free.release()?;
            return Err(e);
        }

        let tail = self.region.tail();
        let written = self.region.write_slot(tail, payload);
        if written.is_ok() {
            self.region.set_tail(self.next(tail));
        }

        self.flow.mutex.release()?;
        if let Err(e) = written {
            self.flow.free.release()?;
            return Err(e);
        }
        self.flow.filled.release()
    }

    /// Take the oldest message into `buf`, blocking while the ring is empty
    ///
    /// Returns the payload length. Only the single reader touches `head`, so
    /// no mutex is taken here.
    pub fn consume_into(&self, buf: &mut [u8]) -> Result<usize> {
        self.flow.filled.acquire_timeout(self.timeout)?;

        let head = self.region.head();
        let len = match self.region.read_slot(head, buf) {
            Ok(len) => len,
            Err(e) => {
                // Leave the message in place for a retry with a larger buffer
                self.flow.filled.release()?;
                return Err(e);
            }
        };
        self.region.set_head(self.next(head));

        self.flow.free.release()?;
        Ok(len)
    }

    /// Take the oldest message, blocking while the ring is empty
    pub fn consume(&self) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; self.region.geometry().slot_size() as usize];
        let len = self.consume_into(&mut buf)?;
        buf.truncate(len);
        Ok(buf)
    }

    #[inline(always)]
    fn next(&self, index: u32) -> u32 {
        (index + 1) % self.region.geometry().capacity()
    }

    /// Release this process's hold on the ring
    ///
    /// The owner marks the region closed and removes every name, so a later
    /// `attach` fails with `NotFound`. A non-owner only closes its handles.
    pub fn teardown(mut self) -> Result<()> {
        if !self.is_owner {
            tracing::debug!(shm = self.names.shm(), "detached from ring");
            return Ok(());
        }

        self.region.mark_closed();
        let results = [
            self.ready.unlink(),
            self.region.unlink(),
            self.flow.unlink(),
        ];
        tracing::debug!(shm = self.names.shm(), "tore down ring");
        results.into_iter().collect()
    }

    /// Remove every name of a ring left behind by a crashed run
    ///
    /// Returns how many names were actually removed.
    pub fn remove_stale(names: &ResourceNames) -> Result<usize> {
        let mut removed = usize::from(SharedRegion::remove(names.shm())?);
        for name in names.semaphores() {
            removed += usize::from(NamedSemaphore::remove(name)?);
        }
        if removed > 0 {
            tracing::info!(removed, shm = names.shm(), "removed stale ring objects");
        }
        Ok(removed)
    }

    pub fn is_owner(&self) -> bool {
        self.is_owner
    }

    pub fn names(&self) -> &ResourceNames {
        &self.names
    }

    pub fn capacity(&self) -> usize {
        self.region.geometry().capacity() as usize
    }

    pub fn slot_size(&self) -> usize {
        self.region.geometry().slot_size() as usize
    }

    /// Next slot the reader will consume
    pub fn head(&self) -> u32 {
        self.region.head()
    }

    /// Next slot the writer will fill
    pub fn tail(&self) -> u32 {
        self.region.tail()
    }

    /// True once the owner has started tearing the ring down
    pub fn is_closed(&self) -> bool {
        self.region.is_closed()
    }

    /// Messages waiting to be consumed
    pub fn filled(&self) -> Result<u32> {
        self.flow.filled.value()
    }

    /// Slots available to the writer
    pub fn free(&self) -> Result<u32> {
        self.flow.free.value()
    }
}

impl Drop for RingTransport {
    fn drop(&mut self) {
        // The field drops unlink the owner's names; peers still mapping the
        // region must also see it closed
        if self.is_owner {
            self.region.mark_closed();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::unique_names;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;

    fn config(capacity: usize, slot_size: usize) -> RingConfig {
        RingConfig {
            capacity,
            slot_size,
            timeout: None,
        }
    }

    #[test]
    fn test_fifo_across_capacities() {
        for capacity in [1, 2, 3, 10] {
            let names = unique_names("fifo");
            let cfg = config(capacity, 32);
            let reader = RingTransport::create(&names, &cfg).unwrap();
            let writer = RingTransport::attach(&names, &cfg).unwrap();

            let messages: Vec<Vec<u8>> = (0..50u32)
                .map(|i| format!("message {}", i).into_bytes())
                .collect();

            let producer = {
                let messages = messages.clone();
                thread::spawn(move || {
                    for m in &messages {
                        writer.produce(m).unwrap();
                    }
                    writer
                })
            };

            for expected in &messages {
                assert_eq!(&reader.consume().unwrap(), expected);
            }

            let writer = producer.join().unwrap();
            writer.teardown().unwrap();
            reader.teardown().unwrap();
        }
    }

    #[test]
    fn test_empty_sequence_leaves_counts_untouched() {
        let names = unique_names("empty");
        let ring = RingTransport::create(&names, &config(4, 16)).unwrap();
        assert_eq!(ring.free().unwrap(), 4);
        assert_eq!(ring.filled().unwrap(), 0);
        assert_eq!(ring.head(), ring.tail());
    }

    #[test]
    fn test_occupancy_accounting_and_wraparound() {
        let names = unique_names("occupancy");
        let ring = RingTransport::create(&names, &config(3, 8)).unwrap();

        for round in 0..4u8 {
            for i in 0..3u8 {
                ring.produce(&[round, i]).unwrap();
                let filled = ring.filled().unwrap();
                assert_eq!(filled + ring.free().unwrap(), 3);
                assert_eq!((ring.tail() + 3 - ring.head()) % 3, filled % 3);
            }
            assert_eq!(ring.filled().unwrap(), 3);
            assert_eq!(ring.free().unwrap(), 0);

            for i in 0..3u8 {
                assert_eq!(ring.consume().unwrap(), vec![round, i]);
                assert_eq!(ring.filled().unwrap() + ring.free().unwrap(), 3);
            }
            assert_eq!(ring.head(), ring.tail());
        }
    }

    #[test]
    fn test_produce_blocks_until_consume() {
        let names = unique_names("backpressure");
        let cfg = config(2, 8);
        let reader = RingTransport::create(&names, &cfg).unwrap();
        let writer = RingTransport::attach(&names, &cfg).unwrap();

        writer.produce(b"a").unwrap();
        writer.produce(b"b").unwrap();
        assert_eq!(writer.free().unwrap(), 0);

        let done = Arc::new(AtomicBool::new(false));
        let blocked = {
            let done = Arc::clone(&done);
            thread::spawn(move || {
                writer.produce(b"c").unwrap();
                done.store(true, Ordering::SeqCst);
                writer
            })
        };

        thread::sleep(Duration::from_millis(100));
        assert!(!done.load(Ordering::SeqCst));

        assert_eq!(reader.consume().unwrap(), b"a");
        let _writer = blocked.join().unwrap();
        assert!(done.load(Ordering::SeqCst));
        assert_eq!(reader.consume().unwrap(), b"b");
        assert_eq!(reader.consume().unwrap(), b"c");
    }

    #[test]
    fn test_consume_blocks_until_produce() {
        let names = unique_names("starve");
        let cfg = config(2, 8);
        let reader = RingTransport::create(&names, &cfg).unwrap();
        let writer = RingTransport::attach(&names, &cfg).unwrap();

        let done = Arc::new(AtomicBool::new(false));
        let consumer = {
            let done = Arc::clone(&done);
            thread::spawn(move || {
                let msg = reader.consume().unwrap();
                done.store(true, Ordering::SeqCst);
                msg
            })
        };

        thread::sleep(Duration::from_millis(100));
        assert!(!done.load(Ordering::SeqCst));

        writer.produce(b"late").unwrap();
        assert_eq!(consumer.join().unwrap(), b"late");
    }

    #[test]
    fn test_timeouts_keep_counts_balanced() {
        let names = unique_names("timeout");
        let cfg = RingConfig {
            capacity: 1,
            slot_size: 8,
            timeout: Some(Duration::from_millis(20)),
        };
        let ring = RingTransport::create(&names, &cfg).unwrap();

        assert!(matches!(ring.consume(), Err(RingError::Timeout { .. })));

        ring.produce(b"x").unwrap();
        assert!(matches!(ring.produce(b"y"), Err(RingError::Timeout { .. })));
        assert_eq!(ring.filled().unwrap() + ring.free().unwrap(), 1);
        assert_eq!(ring.consume().unwrap(), b"x");
    }

    #[test]
    fn test_rejects_oversized_payload() {
        let names = unique_names("oversize");
        let ring = RingTransport::create(&names, &config(2, 4)).unwrap();

        let err = ring.produce(b"too long").err().unwrap();
        assert!(matches!(err, RingError::MessageTooLarge { max: 4, got: 8 }));
        assert_eq!(ring.free().unwrap(), 2);
        assert_eq!(ring.tail(), 0);
    }

    #[test]
    fn test_small_buffer_leaves_message_queued() {
        let names = unique_names("small_buf");
        let ring = RingTransport::create(&names, &config(2, 16)).unwrap();
        ring.produce(b"0123456789").unwrap();

        let mut small = [0u8; 4];
        assert!(matches!(
            ring.consume_into(&mut small),
            Err(RingError::BufferTooSmall { needed: 10, got: 4 })
        ));
        assert_eq!(ring.filled().unwrap(), 1);
        assert_eq!(ring.consume().unwrap(), b"0123456789");
    }

    #[test]
    fn test_create_or_attach_picks_one_owner() {
        let names = unique_names("ownership");
        let cfg = config(4, 64);

        let first = RingTransport::create_or_attach(&names, &cfg).unwrap();
        let second = RingTransport::create_or_attach(&names, &cfg).unwrap();
        assert!(first.is_owner());
        assert!(!second.is_owner());

        second.produce(b"ping").unwrap();
        assert_eq!(first.consume().unwrap(), b"ping");
    }

    #[test]
    fn test_attach_before_create_is_not_found() {
        let names = unique_names("early");
        let err = RingTransport::attach(&names, &RingConfig::default()).err().unwrap();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_attach_after_teardown_is_not_found() {
        let names = unique_names("teardown");
        let cfg = config(2, 16);
        let owner = RingTransport::create(&names, &cfg).unwrap();
        let peer = RingTransport::attach(&names, &cfg).unwrap();

        peer.produce(b"bye").unwrap();
        assert_eq!(owner.consume().unwrap(), b"bye");

        // A non-owner leaving must not take the names with it
        peer.teardown().unwrap();
        let again = RingTransport::attach(&names, &cfg).unwrap();
        drop(again);

        let late_peer = RingTransport::attach(&names, &cfg).unwrap();
        owner.teardown().unwrap();
        assert!(late_peer.is_closed());

        let err = RingTransport::attach(&names, &cfg).err().unwrap();
        assert!(err.is_not_found(), "unexpected error: {err}");
        assert_eq!(err.to_string(), format!("'{}' not found", names.ready()));

        // And a fresh create starts clean
        let fresh = RingTransport::create(&names, &cfg).unwrap();
        assert_eq!(fresh.filled().unwrap(), 0);
        assert_eq!(fresh.tail(), 0);
    }

    #[test]
    fn test_dropped_owner_marks_region_closed() {
        let names = unique_names("drop_owner");
        let cfg = config(2, 8);
        let owner = RingTransport::create(&names, &cfg).unwrap();
        let peer = RingTransport::attach(&names, &cfg).unwrap();
        assert!(!peer.is_closed());

        drop(owner);
        assert!(peer.is_closed());
        assert!(RingTransport::attach(&names, &cfg).err().unwrap().is_not_found());

        // A non-owner going away leaves the state alone
        let owner = RingTransport::create(&names, &cfg).unwrap();
        drop(RingTransport::attach(&names, &cfg).unwrap());
        assert!(!owner.is_closed());
    }

    #[test]
    fn test_failed_create_releases_waiting_attacher() {
        let names = unique_names("failed_create");
        let cfg = config(2, 8);
        let geometry = cfg.geometry().unwrap();

        // A leftover region makes initialisation fail after the latch exists
        let _stale = SharedRegion::create(names.shm(), geometry).unwrap();
        let ready = ReadyLatch::create(names.ready()).unwrap();
        let waiting = ReadyLatch::open(names.ready()).unwrap();

        let err = RingTransport::initialize(ready, &names, geometry, None)
            .err()
            .unwrap();
        assert!(matches!(err, RingError::AlreadyExists { .. }));

        waiting.wait(Some(Duration::from_secs(1))).unwrap();
        assert!(ReadyLatch::open(names.ready()).err().unwrap().is_not_found());
    }

    #[test]
    fn test_attach_checks_geometry() {
        let names = unique_names("geometry");
        let _owner = RingTransport::create(&names, &config(4, 64)).unwrap();
        let err = RingTransport::attach(&names, &config(4, 128)).err().unwrap();
        assert!(matches!(err, RingError::GeometryMismatch { .. }));
    }

    #[test]
    fn test_create_over_existing_ring_fails() {
        let names = unique_names("twice");
        let cfg = config(2, 8);
        let _owner = RingTransport::create(&names, &cfg).unwrap();
        assert!(matches!(
            RingTransport::create(&names, &cfg),
            Err(RingError::AlreadyExists { .. })
        ));
    }

    #[test]
    fn test_remove_stale() {
        let names = unique_names("stale");
        let owner = RingTransport::create(&names, &config(2, 8)).unwrap();
        // Simulate a crash: keep the names, lose the handle
        std::mem::forget(owner);

        assert_eq!(RingTransport::remove_stale(&names).unwrap(), 5);
        assert_eq!(RingTransport::remove_stale(&names).unwrap(), 0);
        assert!(RingTransport::create(&names, &config(2, 8)).is_ok());
    }
}
