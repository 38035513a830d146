use std::future::Future;

use crate::error::HardwareError;

/// An open connection to a controller
///
/// Implementations perform exactly one wire round trip per call and never
/// retry. The session guarantees that calls never overlap.
pub trait Connection: Send + 'static {
    /// Read `count` bytes starting at `start`
    fn read_block(
        &mut self,
        start: u16,
        count: usize,
    ) -> impl Future<Output = Result<Vec<u8>, HardwareError>> + Send;

    /// Write `data` starting at `start`
    fn write_block(
        &mut self,
        start: u16,
        data: &[u8],
    ) -> impl Future<Output = Result<(), HardwareError>> + Send;
}

/// Opens connections to one controller endpoint
pub trait Connector: Send + 'static {
    /// type of connection produced
    type Connection: Connection;

    /// Open a new connection, failing with a [`HardwareError`] if the
    /// endpoint cannot be reached
    fn open(&mut self) -> impl Future<Output = Result<Self::Connection, HardwareError>> + Send;
}
