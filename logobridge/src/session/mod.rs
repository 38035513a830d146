use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::error::HardwareError;
use crate::session::message::{Promise, Request};
use crate::session::task::SessionTask;

pub use connection::{Connection, Connector};

mod connection;
mod message;
mod task;

/// Handle used to access the controller behind a session task
///
/// Handles are cheap to clone. All clones feed the same request queue, which
/// a single task drains one request at a time, so the wire never carries
/// more than one request. The task exits and closes the connection once
/// every handle has been dropped.
#[derive(Clone, Debug)]
pub struct HardwareSession {
    tx: mpsc::Sender<Request>,
}

impl HardwareSession {
    /// Spawn a session task that opens connections using `connector`
    ///
    /// `max_queued` bounds the number of requests waiting for the task.
    /// Must be called from within a tokio runtime.
    pub fn spawn<C: Connector>(
        endpoint: &str,
        connector: C,
        max_queued: usize,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(max_queued);
        let mut task = SessionTask::new(connector, rx);
        let handle = tokio::spawn(
            async move { task.run().await }
                .instrument(tracing::info_span!("HardwareSession", endpoint = %endpoint)),
        );
        (Self { tx }, handle)
    }

    /// Read `count` bytes starting at `start`
    pub async fn read_block(&self, start: u16, count: usize) -> Result<Vec<u8>, HardwareError> {
        self.send(|promise| Request::Read {
            start,
            count,
            promise,
        })
        .await
    }

    /// Write `data` starting at `start`
    pub async fn write_block(&self, start: u16, data: &[u8]) -> Result<(), HardwareError> {
        self.send(|promise| Request::Write {
            start,
            data: data.to_vec(),
            promise,
        })
        .await
    }

    /// Set or clear a single bit, leaving the other bits of the byte untouched
    ///
    /// The byte is read and written back without any other request in between.
    pub async fn write_bit(&self, address: u16, bit: u8, value: bool) -> Result<(), HardwareError> {
        self.send(|promise| Request::WriteBit {
            address,
            bit,
            value,
            promise,
        })
        .await
    }

    async fn send<T>(&self, request: impl FnOnce(Promise<T>) -> Request) -> Result<T, HardwareError> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(request(Promise::new(tx)))
            .await
            .map_err(|_| HardwareError::Shutdown)?;
        rx.await.unwrap_or(Err(HardwareError::Shutdown))
    }
}
