use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::error::{HardwareError, ResponseError};
use crate::s7::frame::{self, constants, FramedReader, ReadVar, Setup, WriteVar};
use crate::session::{Connection, Connector};

/// Connection parameters of an S7 endpoint
///
/// The defaults match a LOGO! 0BA7/0BA8 whose local variable memory is
/// exposed as data block 1.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct S7Settings {
    /// TSAP of this client
    pub local_tsap: u16,
    /// TSAP of the controller
    pub remote_tsap: u16,
    /// data block that maps the local variable memory
    pub db_number: u16,
    /// PDU length proposed during setup
    pub pdu_length: u16,
    /// maximum time to wait for each response
    pub response_timeout: Duration,
    /// maximum time to establish the TCP connection
    pub connect_timeout: Duration,
}

impl Default for S7Settings {
    fn default() -> Self {
        Self {
            local_tsap: 0x0100,
            remote_tsap: 0x0200,
            db_number: 1,
            pdu_length: 480,
            response_timeout: Duration::from_secs(2),
            connect_timeout: Duration::from_secs(5),
        }
    }
}

/// Opens S7 connections over ISO-on-TCP
#[derive(Clone, Copy, Debug)]
pub struct S7Connector {
    addr: SocketAddr,
    settings: S7Settings,
}

impl S7Connector {
    /// Standard ISO-on-TCP port
    pub const DEFAULT_PORT: u16 = 102;

    /// create a connector for the controller at `addr`
    pub fn new(addr: SocketAddr, settings: S7Settings) -> Self {
        Self { addr, settings }
    }
}

impl Connector for S7Connector {
    type Connection = S7Connection<TcpStream>;

    async fn open(&mut self) -> Result<Self::Connection, HardwareError> {
        tracing::info!("connecting to {}", self.addr);
        let stream = tokio::time::timeout(
            self.settings.connect_timeout,
            TcpStream::connect(self.addr),
        )
        .await??;
        stream.set_nodelay(true)?;
        let connection = S7Connection::handshake(stream, self.settings).await?;
        tracing::info!(
            "connected to {} (PDU length: {})",
            self.addr,
            connection.pdu_length
        );
        Ok(connection)
    }
}

/// An established S7 connection over any byte stream
pub struct S7Connection<S> {
    io: S,
    reader: FramedReader,
    settings: S7Settings,
    pdu_length: u16,
    pdu_ref: u16,
}

impl<S> S7Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// perform the COTP connect and the S7 communication setup on `io`
    pub async fn handshake(io: S, settings: S7Settings) -> Result<Self, HardwareError> {
        let mut connection = Self {
            io,
            reader: FramedReader::new(),
            settings,
            pdu_length: settings.pdu_length,
            pdu_ref: 0,
        };

        let request = frame::format_connection_request(settings.local_tsap, settings.remote_tsap)?;
        let confirm = connection.round_trip(&request).await?;
        frame::check_connection_confirm(&confirm)?;

        let pdu_ref = connection.next_ref();
        let setup = Setup {
            pdu_length: settings.pdu_length,
        };
        let request = frame::format_job(pdu_ref, &setup)?;
        let response = connection.round_trip(&request).await?;
        let negotiated = frame::parse_setup(&frame::parse_ack(&response, pdu_ref)?)?;

        if negotiated < constants::MIN_PDU_LENGTH {
            return Err(ResponseError::LengthMismatch(
                constants::MIN_PDU_LENGTH as usize,
                negotiated as usize,
            )
            .into());
        }

        connection.pdu_length = negotiated.min(settings.pdu_length);
        Ok(connection)
    }

    /// PDU length negotiated with the controller
    pub fn pdu_length(&self) -> u16 {
        self.pdu_length
    }

    fn next_ref(&mut self) -> u16 {
        self.pdu_ref = self.pdu_ref.wrapping_add(1);
        self.pdu_ref
    }

    async fn round_trip(&mut self, request: &[u8]) -> Result<Vec<u8>, HardwareError> {
        let timeout = self.settings.response_timeout;
        let exchange = async {
            self.io.write_all(request).await?;
            self.io.flush().await?;
            self.reader.next_frame(&mut self.io).await
        };
        tokio::time::timeout(timeout, exchange).await?
    }

    async fn read_chunk(&mut self, start: u16, count: usize) -> Result<Vec<u8>, HardwareError> {
        let pdu_ref = self.next_ref();
        let job = ReadVar {
            db_number: self.settings.db_number,
            start,
            count,
        };
        let response = self.round_trip(&frame::format_job(pdu_ref, &job)?).await?;
        frame::parse_read(&frame::parse_ack(&response, pdu_ref)?, count)
    }

    async fn write_chunk(&mut self, start: u16, data: &[u8]) -> Result<(), HardwareError> {
        let pdu_ref = self.next_ref();
        let job = WriteVar {
            db_number: self.settings.db_number,
            start,
            data,
        };
        let request = frame::format_job(pdu_ref, &job)?;
        let response = self.round_trip(&request).await?;
        frame::parse_write(&frame::parse_ack(&response, pdu_ref)?)
    }
}

impl<S> Connection for S7Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn read_block(&mut self, start: u16, count: usize) -> Result<Vec<u8>, HardwareError> {
        let max = self.pdu_length as usize - constants::READ_OVERHEAD;
        let mut bytes = Vec::with_capacity(count);
        let mut address = start;
        while bytes.len() < count {
            let chunk = (count - bytes.len()).min(max);
            bytes.extend(self.read_chunk(address, chunk).await?);
            address += chunk as u16;
        }
        Ok(bytes)
    }

    async fn write_block(&mut self, start: u16, data: &[u8]) -> Result<(), HardwareError> {
        let max = self.pdu_length as usize - constants::WRITE_OVERHEAD;
        let mut address = start;
        for chunk in data.chunks(max) {
            self.write_chunk(address, chunk).await?;
            address += chunk.len() as u16;
        }
        Ok(())
    }
}
