use tokio::sync::oneshot;

use crate::error::HardwareError;
use crate::types::MEMORY_SIZE;

/// requests served by the session task, one at a time
pub(crate) enum Request {
    Read {
        start: u16,
        count: usize,
        promise: Promise<Vec<u8>>,
    },
    Write {
        start: u16,
        data: Vec<u8>,
        promise: Promise<()>,
    },
    WriteBit {
        address: u16,
        bit: u8,
        value: bool,
        promise: Promise<()>,
    },
}

impl Request {
    /// addressed block must lie within the controller memory
    pub(crate) fn check_bounds(&self) -> Result<(), HardwareError> {
        let (start, count) = match self {
            Request::Read { start, count, .. } => (*start, *count),
            Request::Write { start, data, .. } => (*start, data.len()),
            Request::WriteBit { address, .. } => (*address, 1),
        };
        if start as usize + count > MEMORY_SIZE {
            return Err(HardwareError::OutOfRange { start, count });
        }
        Ok(())
    }

    pub(crate) fn fail(self, err: HardwareError) {
        match self {
            Request::Read { promise, .. } => promise.failure(err),
            Request::Write { promise, .. } => promise.failure(err),
            Request::WriteBit { promise, .. } => promise.failure(err),
        }
    }
}

/// completes the caller's future with the result of a request
///
/// If the promise is dropped without being completed, the caller observes
/// [`HardwareError::Shutdown`].
pub(crate) struct Promise<T> {
    sender: oneshot::Sender<Result<T, HardwareError>>,
}

impl<T> Promise<T> {
    pub(crate) fn new(sender: oneshot::Sender<Result<T, HardwareError>>) -> Self {
        Self { sender }
    }

    pub(crate) fn failure(self, err: HardwareError) {
        self.complete(Err(err))
    }

    pub(crate) fn complete(self, result: Result<T, HardwareError>) {
        // the caller may have given up on the request
        self.sender.send(result).ok();
    }
}
