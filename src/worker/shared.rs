//! Blocking line input shared between the two threads
//!
//! The region mirrors a shared memory page: word 0 holds the state flag and
//! the NUL-terminated payload follows it. The compute thread parks on the
//! condition variable until the interactive side has written a line and set
//! the flag, then copies the payload out and zeroes the region. Exactly one
//! read is outstanding at a time.

use super::error::TransportError;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

/// Default payload capacity, terminator included
pub const DEFAULT_CAPACITY: usize = 64 * 1024;

const FLAG_EMPTY: u32 = 0;
const FLAG_READY: u32 = 1;
const FLAG_CLOSED: u32 = 2;

const HEADER: usize = 4;

/// Flag word plus payload, guarded by a mutex and a condvar
#[derive(Debug)]
pub struct SharedInput {
    region: Mutex<Vec<u8>>,
    ready: Condvar,
}

impl SharedInput {
    pub fn new(capacity: usize) -> Self {
        Self {
            region: Mutex::new(vec![0; HEADER + capacity.max(1)]),
            ready: Condvar::new(),
        }
    }

    /// Largest line that fits, in bytes
    pub fn capacity(&self) -> usize {
        self.lock().len() - HEADER - 1
    }

    fn lock(&self) -> MutexGuard<'_, Vec<u8>> {
        self.region.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn flag(region: &[u8]) -> u32 {
        u32::from_le_bytes([region[0], region[1], region[2], region[3]])
    }

    fn set_flag(region: &mut [u8], flag: u32) {
        region[..HEADER].copy_from_slice(&flag.to_le_bytes());
    }

    /// Publish one line and wake the reader; returns false once closed
    pub fn post(&self, line: &str) -> bool {
        let mut region = self.lock();
        if Self::flag(&region) == FLAG_CLOSED {
            return false;
        }

        let room = region.len() - HEADER - 1;
        let mut bytes = line.as_bytes();
        if bytes.len() > room {
            tracing::warn!(len = bytes.len(), room, "input line truncated");
            bytes = &bytes[..room];
        }
        // interior NULs would end the payload early
        let bytes = match bytes.iter().position(|&b| b == 0) {
            Some(end) => &bytes[..end],
            None => bytes,
        };

        region[HEADER..HEADER + bytes.len()].copy_from_slice(bytes);
        region[HEADER + bytes.len()] = 0;
        Self::set_flag(&mut region, FLAG_READY);
        self.ready.notify_all();
        true
    }

    /// Park until a line is posted, then take it and reset the region
    pub fn wait_line(&self) -> Result<String, TransportError> {
        let mut region = self.lock();
        loop {
            match Self::flag(&region) {
                FLAG_READY => break,
                FLAG_CLOSED => return Err(TransportError::Terminated),
                _ => {
                    region = self
                        .ready
                        .wait(region)
                        .unwrap_or_else(|e| e.into_inner());
                }
            }
        }

        let payload = &region[HEADER..];
        let end = payload.iter().position(|&b| b == 0).unwrap_or(payload.len());
        let line = String::from_utf8_lossy(&payload[..end]).into_owned();

        region.fill(0);
        Self::set_flag(&mut region, FLAG_EMPTY);
        Ok(line)
    }

    /// Wake any reader and refuse further lines
    pub fn close(&self) {
        let mut region = self.lock();
        Self::set_flag(&mut region, FLAG_CLOSED);
        self.ready.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        Self::flag(&self.lock()) == FLAG_CLOSED
    }
}

impl Default for SharedInput {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

/// One-shot answer to a line request
#[derive(Debug)]
pub struct LineReply {
    input: Arc<SharedInput>,
}

impl LineReply {
    pub(crate) fn new(input: Arc<SharedInput>) -> Self {
        Self { input }
    }

    /// Deliver the line to the parked reader
    pub fn send(self, line: &str) {
        if !self.input.post(line) {
            tracing::debug!("input region closed, line dropped");
        }
    }
}
