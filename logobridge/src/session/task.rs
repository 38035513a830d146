use tokio::sync::mpsc;

use crate::codec;
use crate::error::{HardwareError, ResponseError};
use crate::session::message::Request;
use crate::session::{Connection, Connector};

/// Serves requests for a single controller endpoint
///
/// The task owns the connection, so every wire round trip is executed to
/// completion before the next request is dequeued.
pub(crate) struct SessionTask<C: Connector> {
    connector: C,
    connection: Option<C::Connection>,
    rx: mpsc::Receiver<Request>,
}

impl<C: Connector> SessionTask<C> {
    pub(crate) fn new(connector: C, rx: mpsc::Receiver<Request>) -> Self {
        Self {
            connector,
            connection: None,
            rx,
        }
    }

    /// run until every session handle has been dropped
    pub(crate) async fn run(&mut self) {
        while let Some(request) = self.rx.recv().await {
            self.process(request).await;
        }

        if self.connection.take().is_some() {
            tracing::info!("closing connection");
        }
        tracing::info!("session shut down");
    }

    async fn process(&mut self, request: Request) {
        if let Err(err) = request.check_bounds() {
            tracing::warn!("{}", err);
            request.fail(err);
            return;
        }

        match request {
            Request::Read {
                start,
                count,
                promise,
            } => {
                let result = match self.connect().await {
                    Ok(connection) => connection.read_block(start, count).await,
                    Err(err) => Err(err),
                };
                promise.complete(self.check(result));
            }
            Request::Write {
                start,
                data,
                promise,
            } => {
                let result = match self.connect().await {
                    Ok(connection) => connection.write_block(start, &data).await,
                    Err(err) => Err(err),
                };
                promise.complete(self.check(result));
            }
            Request::WriteBit {
                address,
                bit,
                value,
                promise,
            } => {
                let result = match self.connect().await {
                    Ok(connection) => write_bit(connection, address, bit, value).await,
                    Err(err) => Err(err),
                };
                promise.complete(self.check(result));
            }
        }
    }

    async fn connect(&mut self) -> Result<&mut C::Connection, HardwareError> {
        if self.connection.is_none() {
            match self.connector.open().await {
                Ok(connection) => {
                    self.connection = Some(connection);
                }
                Err(err) => {
                    tracing::warn!("unable to connect: {}", err);
                    return Err(err);
                }
            }
        }

        self.connection.as_mut().ok_or(HardwareError::NoConnection)
    }

    /// drops the connection on errors after which the stream state is unknown
    fn check<T>(&mut self, result: Result<T, HardwareError>) -> Result<T, HardwareError> {
        if let Err(err) = &result {
            if err.is_connection_fatal() && self.connection.take().is_some() {
                tracing::warn!("closing connection: {}", err);
            }
        }
        result
    }
}

async fn write_bit<T: Connection>(
    connection: &mut T,
    address: u16,
    bit: u8,
    value: bool,
) -> Result<(), HardwareError> {
    let current = connection.read_block(address, 1).await?;
    let byte = match current.first() {
        Some(x) => *x,
        None => return Err(ResponseError::InsufficientBytes.into()),
    };
    connection
        .write_block(address, &[codec::set_bit(byte, bit, value)])
        .await
}
