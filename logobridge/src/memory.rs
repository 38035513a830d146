use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::error::HardwareError;
use crate::session::{Connection, Connector};
use crate::types::MEMORY_SIZE;

/// S7 return code for an address outside of the data block
const ADDRESS_OUT_OF_RANGE: u8 = 0x05;

/// A write observed by a [`MemoryController`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WriteRecord {
    /// first address written
    pub start: u16,
    /// bytes written
    pub data: Vec<u8>,
}

#[derive(Default)]
struct State {
    memory: Vec<u8>,
    writes: Vec<WriteRecord>,
    reads: usize,
    opens: usize,
    pending_failures: usize,
    offline: bool,
    active: usize,
    max_active: usize,
}

/// In-memory controller with a shared byte image
///
/// Clones share the same memory, so a test can keep one clone to inspect and
/// mutate memory while the session owns another as its [`Connector`]. Every
/// operation yields to the runtime halfway through, which lets tests detect
/// overlapping access through [`MemoryController::max_concurrency`].
#[derive(Clone)]
pub struct MemoryController {
    state: Arc<Mutex<State>>,
}

impl Default for MemoryController {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryController {
    /// create a controller with zeroed memory of the full addressable size
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                memory: vec![0; MEMORY_SIZE],
                ..Default::default()
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        lock(&self.state)
    }

    /// overwrite memory starting at `start`
    ///
    /// bytes past the end of memory are ignored
    pub fn set_bytes(&self, start: u16, bytes: &[u8]) {
        let mut state = self.lock();
        let start = (start as usize).min(state.memory.len());
        let end = (start + bytes.len()).min(state.memory.len());
        let count = end - start;
        state.memory[start..end].copy_from_slice(&bytes[..count]);
    }

    /// copy of `count` bytes starting at `start`
    pub fn bytes(&self, start: u16, count: usize) -> Vec<u8> {
        let state = self.lock();
        state
            .memory
            .get(start as usize..start as usize + count)
            .map(|x| x.to_vec())
            .unwrap_or_default()
    }

    /// every successful write in the order it was applied
    pub fn writes(&self) -> Vec<WriteRecord> {
        self.lock().writes.clone()
    }

    /// the next `count` reads or writes fail with a response timeout
    pub fn fail_next_requests(&self, count: usize) {
        self.lock().pending_failures = count;
    }

    /// while offline, every attempt to open a connection is refused
    pub fn set_offline(&self, offline: bool) {
        self.lock().offline = offline;
    }

    /// number of connections opened so far
    pub fn open_count(&self) -> usize {
        self.lock().opens
    }

    /// number of successful reads
    pub fn read_count(&self) -> usize {
        self.lock().reads
    }

    /// highest number of operations that were ever in flight at once
    pub fn max_concurrency(&self) -> usize {
        self.lock().max_active
    }
}

impl Connector for MemoryController {
    type Connection = MemoryConnection;

    async fn open(&mut self) -> Result<Self::Connection, HardwareError> {
        let mut state = self.lock();
        if state.offline {
            return Err(HardwareError::Io(std::io::ErrorKind::ConnectionRefused));
        }
        state.opens += 1;
        Ok(MemoryConnection {
            state: self.state.clone(),
        })
    }
}

/// Connection to a [`MemoryController`]
pub struct MemoryConnection {
    state: Arc<Mutex<State>>,
}

impl MemoryConnection {
    fn begin(&self) -> Result<(), HardwareError> {
        let mut state = lock(&self.state);
        if state.pending_failures > 0 {
            state.pending_failures -= 1;
            return Err(HardwareError::ResponseTimeout);
        }
        state.active += 1;
        state.max_active = state.max_active.max(state.active);
        Ok(())
    }

    fn finish_read(&self, start: u16, count: usize) -> Result<Vec<u8>, HardwareError> {
        let mut state = lock(&self.state);
        state.active -= 1;
        let bytes = state
            .memory
            .get(start as usize..start as usize + count)
            .map(|x| x.to_vec())
            .ok_or(HardwareError::Rejected(ADDRESS_OUT_OF_RANGE))?;
        state.reads += 1;
        Ok(bytes)
    }

    fn finish_write(&self, start: u16, data: &[u8]) -> Result<(), HardwareError> {
        let mut state = lock(&self.state);
        state.active -= 1;
        let target = state
            .memory
            .get_mut(start as usize..start as usize + data.len())
            .ok_or(HardwareError::Rejected(ADDRESS_OUT_OF_RANGE))?;
        target.copy_from_slice(data);
        state.writes.push(WriteRecord {
            start,
            data: data.to_vec(),
        });
        Ok(())
    }
}

impl Connection for MemoryConnection {
    async fn read_block(&mut self, start: u16, count: usize) -> Result<Vec<u8>, HardwareError> {
        self.begin()?;
        tokio::task::yield_now().await;
        self.finish_read(start, count)
    }

    async fn write_block(&mut self, start: u16, data: &[u8]) -> Result<(), HardwareError> {
        self.begin()?;
        tokio::task::yield_now().await;
        self.finish_write(start, data)
    }
}

fn lock(state: &Mutex<State>) -> MutexGuard<'_, State> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}
