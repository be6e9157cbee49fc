//! Throughput harness driving one side of a ring
//!
//! A [`Session`] describes one process's run: its role, how many messages of
//! what size to move, and whether to verify payload content. [`Session::run`]
//! opens the ring, runs the loop, tears the ring down and returns a
//! [`Report`]. Short transfers and integrity mismatches are warnings, never
//! errors.

use crate::error::{Result, RingError};
use crate::names::ResourceNames;
use crate::ring::{RingConfig, RingTransport};
use std::fmt;
use std::time::{Duration, Instant};

/// How often the harness retries an attach while waiting for the owner
const ATTACH_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Which end of the ring this process drives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Writer,
    Reader,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Writer => f.write_str("WRITER"),
            Role::Reader => f.write_str("READER"),
        }
    }
}

/// How this process obtains the ring
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ownership {
    /// Create it; fail if it exists
    Create,
    /// Attach to a ring created by the peer
    Attach,
    /// Whoever comes first creates. A writer that wins and finishes within
    /// one ring's worth of messages tears down before any reader arrives.
    Auto,
}

impl Ownership {
    /// The reader owns the ring and the writer attaches to it
    pub fn for_role(role: Role) -> Self {
        match role {
            Role::Reader => Ownership::Create,
            Role::Writer => Ownership::Attach,
        }
    }
}

/// Byte `i` of every benchmark payload
#[inline(always)]
pub fn pattern_byte(i: usize) -> u8 {
    (i % 255) as u8
}

/// Fill `buf` with the benchmark pattern
pub fn fill_pattern(buf: &mut [u8]) {
    for (i, b) in buf.iter_mut().enumerate() {
        *b = pattern_byte(i);
    }
}

/// First byte of a received message that differs from the pattern
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mismatch {
    /// Zero-based index of the message within the run
    pub message: u64,
    /// Byte offset inside the message
    pub position: usize,
    pub expected: u8,
    pub actual: u8,
}

impl fmt::Display for Mismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "message {} byte {}: got {} expected {}",
            self.message, self.position, self.actual, self.expected
        )
    }
}

/// Compare `buf` against the pattern, reporting only the first difference
pub fn check_pattern(message: u64, buf: &[u8]) -> Option<Mismatch> {
    buf.iter()
        .enumerate()
        .find(|&(i, &b)| b != pattern_byte(i))
        .map(|(position, &actual)| Mismatch {
            message,
            position,
            expected: pattern_byte(position),
            actual,
        })
}

/// Per-process benchmark configuration
#[derive(Debug, Clone)]
pub struct Session {
    pub role: Role,
    /// Bytes per message; must fit into one slot
    pub message_size: usize,
    pub message_count: u64,
    /// Verify every received byte against the pattern (reader only)
    pub check: bool,
    pub ring: RingConfig,
    pub ownership: Ownership,
    /// How long an attaching process keeps retrying while the ring does not
    /// exist yet. `None` fails on the first `NotFound`.
    pub attach_wait: Option<Duration>,
}

impl Session {
    pub fn new(role: Role, message_size: usize, message_count: u64) -> Self {
        Self {
            role,
            message_size,
            message_count,
            check: false,
            ring: RingConfig::default(),
            ownership: Ownership::for_role(role),
            attach_wait: None,
        }
    }

    /// Reject configurations that could not run correctly
    pub fn validate(&self) -> Result<()> {
        if self.message_size == 0 {
            return Err(RingError::InvalidConfig("message size must be at least 1 byte".into()));
        }
        if self.message_size > self.ring.slot_size {
            return Err(RingError::MessageTooLarge {
                max: self.ring.slot_size,
                got: self.message_size,
            });
        }
        self.ring.geometry()?;
        Ok(())
    }

    /// Open the ring, run this role's loop, tear down and report
    pub fn run(&self, names: &ResourceNames) -> Result<Report> {
        self.validate()?;
        let ring = self.open(names)?;
        tracing::info!(
            role = %self.role,
            owner = ring.is_owner(),
            messages = self.message_count,
            message_size = self.message_size,
            "starting"
        );

        let report = match self.role {
            Role::Writer => run_writer(self, &ring)?,
            Role::Reader => run_reader(self, &ring)?,
        };
        ring.teardown()?;

        report.log_warnings();
        Ok(report)
    }

    fn open(&self, names: &ResourceNames) -> Result<RingTransport> {
        match self.ownership {
            Ownership::Create => RingTransport::create(names, &self.ring),
            Ownership::Auto => RingTransport::create_or_attach(names, &self.ring),
            Ownership::Attach => {
                let deadline = self.attach_wait.map(|wait| Instant::now() + wait);
                loop {
                    match RingTransport::attach(names, &self.ring) {
                        Err(e) if e.is_not_found() && deadline.is_some_and(|d| Instant::now() < d) => {
                            tracing::trace!(shm = names.shm(), "ring not there yet, retrying");
                            std::thread::sleep(ATTACH_POLL_INTERVAL);
                        }
                        result => return result,
                    }
                }
            }
        }
    }
}

/// Produce `message_count` pattern messages
pub fn run_writer(session: &Session, ring: &RingTransport) -> Result<Report> {
    let mut payload = vec![0u8; session.message_size];
    fill_pattern(&mut payload);

    let mut messages = 0u64;
    let mut bytes = 0u64;
    let start = Instant::now();
    for _ in 0..session.message_count {
        ring.produce(&payload)?;
        messages += 1;
        bytes += payload.len() as u64;
    }
    let elapsed = start.elapsed();

    Ok(Report::new(session, messages, bytes, elapsed, Vec::new()))
}

/// Consume `message_count` messages, optionally verifying each one
pub fn run_reader(session: &Session, ring: &RingTransport) -> Result<Report> {
    let mut buf = vec![0u8; ring.slot_size()];
    let mut mismatches = Vec::new();

    let mut messages = 0u64;
    let mut bytes = 0u64;
    let start = Instant::now();
    for i in 0..session.message_count {
        let n = ring.consume_into(&mut buf)?;
        if session.check {
            mismatches.extend(check_pattern(i, &buf[..n]));
        }
        messages += 1;
        bytes += n as u64;
    }
    let elapsed = start.elapsed();

    Ok(Report::new(session, messages, bytes, elapsed, mismatches))
}

/// Result of one side's run
#[derive(Debug, Clone)]
pub struct Report {
    pub role: Role,
    pub messages: u64,
    pub message_size: usize,
    pub bytes: u64,
    pub expected_bytes: u64,
    pub elapsed: Duration,
    pub mismatches: Vec<Mismatch>,
}

impl Report {
    fn new(
        session: &Session,
        messages: u64,
        bytes: u64,
        elapsed: Duration,
        mismatches: Vec<Mismatch>,
    ) -> Self {
        Self {
            role: session.role,
            messages,
            message_size: session.message_size,
            bytes,
            expected_bytes: session.message_count * session.message_size as u64,
            elapsed,
            mismatches,
        }
    }

    /// Bytes per second; zero if the run took no measurable time
    pub fn throughput(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.bytes as f64 / secs
        } else {
            0.0
        }
    }

    pub fn throughput_mib(&self) -> f64 {
        self.throughput() / (1024.0 * 1024.0)
    }

    pub fn total_mib(&self) -> f64 {
        self.bytes as f64 / (1024.0 * 1024.0)
    }

    /// Fewer (or more) bytes moved than the session asked for
    pub fn short_transfer(&self) -> bool {
        self.bytes != self.expected_bytes
    }

    /// One line per problem found during the run
    pub fn warnings(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.short_transfer() {
            warnings.push(format!(
                "couldn't move all messages: {} of {} bytes",
                self.bytes, self.expected_bytes
            ));
        }
        warnings.extend(self.mismatches.iter().map(|m| format!("incorrect data: {}", m)));
        warnings
    }

    /// Emit every warning through the log; [`Session::run`] does this once
    pub fn log_warnings(&self) {
        for warning in self.warnings() {
            tracing::warn!(role = %self.role, "{}", warning);
        }
    }
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "[SHM {}]", self.role)?;
        writeln!(f, "Total # messages : {}", self.messages)?;
        writeln!(f, "Message size     : {} Bytes", self.message_size)?;
        writeln!(f, "Total size       : {:.3} MBytes", self.total_mib())?;
        writeln!(f, "Total time       : {:.3} seconds", self.elapsed.as_secs_f64())?;
        write!(f, "Throughput       : {:.3} MBytes/sec", self.throughput_mib())
    }
}
