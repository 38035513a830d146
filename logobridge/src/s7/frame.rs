use scursor::{ReadCursor, WriteCursor};
use tokio::io::AsyncRead;

use crate::buffer::ReadBuffer;
use crate::error::{FrameError, HardwareError, ResponseError};

pub(crate) mod constants {
    pub(crate) const TPKT_VERSION: u8 = 0x03;
    pub(crate) const TPKT_HEADER_LENGTH: usize = 4;
    pub(crate) const MAX_TPKT_LENGTH: usize = 4096;

    /// COTP connection request with the TPDU size and both TSAPs
    pub(crate) const COTP_CONNECTION_REQUEST_LENGTH: usize = 18;
    pub(crate) const COTP_DATA_HEADER_LENGTH: usize = 3;
    pub(crate) const S7_JOB_HEADER_LENGTH: usize = 10;
    pub(crate) const ITEM_PARAMS_LENGTH: usize = 14;
    pub(crate) const DATA_ITEM_HEADER_LENGTH: usize = 4;

    pub(crate) const COTP_CONNECTION_REQUEST: u8 = 0xE0;
    pub(crate) const COTP_CONNECTION_CONFIRM: u8 = 0xD0;
    pub(crate) const COTP_DATA: u8 = 0xF0;
    pub(crate) const COTP_LAST_DATA_UNIT: u8 = 0x80;
    /// 2^10 = 1024 bytes
    pub(crate) const COTP_TPDU_SIZE_1024: u8 = 0x0A;

    pub(crate) const S7_PROTOCOL_ID: u8 = 0x32;
    pub(crate) const S7_JOB: u8 = 0x01;
    pub(crate) const S7_ACK_DATA: u8 = 0x03;

    pub(crate) const FUNCTION_SETUP_COMMUNICATION: u8 = 0xF0;
    pub(crate) const FUNCTION_READ_VAR: u8 = 0x04;
    pub(crate) const FUNCTION_WRITE_VAR: u8 = 0x05;

    pub(crate) const ITEM_SPECIFICATION: u8 = 0x12;
    pub(crate) const ITEM_LENGTH: u8 = 0x0A;
    pub(crate) const SYNTAX_ANY: u8 = 0x10;
    pub(crate) const TRANSPORT_SIZE_BYTE: u8 = 0x02;
    pub(crate) const AREA_DATA_BLOCK: u8 = 0x84;

    pub(crate) const DATA_TRANSPORT_BIT: u8 = 0x03;
    pub(crate) const DATA_TRANSPORT_BYTE: u8 = 0x04;
    pub(crate) const DATA_TRANSPORT_INTEGER: u8 = 0x05;

    pub(crate) const RETURN_CODE_SUCCESS: u8 = 0xFF;

    /// S7 header + read parameters + data item header
    pub(crate) const READ_OVERHEAD: usize = 18;
    /// S7 header + write parameters + data item header
    pub(crate) const WRITE_OVERHEAD: usize = 28;
    pub(crate) const MIN_PDU_LENGTH: u16 = 64;
}

#[derive(Clone, Copy)]
enum ParseState {
    Begin,
    Body(usize),
}

/// Parses TPKT (RFC 1006) frames off a stream and returns their payload
pub(crate) struct TpktParser {
    state: ParseState,
}

impl TpktParser {
    pub(crate) fn new() -> Self {
        Self {
            state: ParseState::Begin,
        }
    }

    fn parse_header(buffer: &mut ReadBuffer) -> Result<usize, HardwareError> {
        let mut cursor = ReadCursor::new(buffer.read(constants::TPKT_HEADER_LENGTH)?);
        let version = cursor.read_u8()?;
        let _reserved = cursor.read_u8()?;
        let length = cursor.read_u16_be()? as usize;

        if version != constants::TPKT_VERSION {
            return Err(FrameError::UnknownTpktVersion(version).into());
        }

        // must at least hold a COTP header
        if length <= constants::TPKT_HEADER_LENGTH + 1 || length > constants::MAX_TPKT_LENGTH {
            return Err(FrameError::BadTpktLength(length).into());
        }

        Ok(length - constants::TPKT_HEADER_LENGTH)
    }

    pub(crate) fn parse(&mut self, buffer: &mut ReadBuffer) -> Result<Option<Vec<u8>>, HardwareError> {
        match self.state {
            ParseState::Body(length) => {
                if buffer.len() < length {
                    return Ok(None);
                }

                let payload = buffer.read(length)?.to_vec();
                self.state = ParseState::Begin;
                Ok(Some(payload))
            }
            ParseState::Begin => {
                if buffer.peek(constants::TPKT_HEADER_LENGTH).is_none() {
                    return Ok(None);
                }

                self.state = ParseState::Body(Self::parse_header(buffer)?);
                self.parse(buffer)
            }
        }
    }
}

pub(crate) struct FramedReader {
    parser: TpktParser,
    buffer: ReadBuffer,
}

impl FramedReader {
    pub(crate) fn new() -> Self {
        Self {
            parser: TpktParser::new(),
            buffer: ReadBuffer::new(constants::MAX_TPKT_LENGTH),
        }
    }

    pub(crate) async fn next_frame<T>(&mut self, io: &mut T) -> Result<Vec<u8>, HardwareError>
    where
        T: AsyncRead + Unpin,
    {
        loop {
            match self.parser.parse(&mut self.buffer)? {
                Some(frame) => return Ok(frame),
                None => {
                    self.buffer.read_some(io).await?;
                }
            }
        }
    }
}

fn write_tpkt_header(cursor: &mut WriteCursor, length: usize) -> Result<(), HardwareError> {
    let length = u16::try_from(length).map_err(|_| HardwareError::BadRequest)?;
    cursor.write_u8(constants::TPKT_VERSION)?;
    cursor.write_u8(0x00)?;
    cursor.write_u16_be(length)?;
    Ok(())
}

fn length_u16(length: usize) -> Result<u16, HardwareError> {
    u16::try_from(length).map_err(|_| HardwareError::BadRequest)
}

/// COTP connection request carrying the calling and called TSAPs
pub(crate) fn format_connection_request(
    local_tsap: u16,
    remote_tsap: u16,
) -> Result<Vec<u8>, HardwareError> {
    let mut buffer =
        [0; constants::TPKT_HEADER_LENGTH + constants::COTP_CONNECTION_REQUEST_LENGTH];
    let mut cursor = WriteCursor::new(&mut buffer);
    write_tpkt_header(
        &mut cursor,
        constants::TPKT_HEADER_LENGTH + constants::COTP_CONNECTION_REQUEST_LENGTH,
    )?;
    // length of the remaining header
    cursor.write_u8((constants::COTP_CONNECTION_REQUEST_LENGTH - 1) as u8)?;
    cursor.write_u8(constants::COTP_CONNECTION_REQUEST)?;
    cursor.write_u16_be(0x0000)?; // destination reference
    cursor.write_u16_be(0x0001)?; // source reference
    cursor.write_u8(0x00)?; // class 0
    cursor.write_u8(0xC0)?;
    cursor.write_u8(0x01)?;
    cursor.write_u8(constants::COTP_TPDU_SIZE_1024)?;
    cursor.write_u8(0xC1)?;
    cursor.write_u8(0x02)?;
    cursor.write_u16_be(local_tsap)?;
    cursor.write_u8(0xC2)?;
    cursor.write_u8(0x02)?;
    cursor.write_u16_be(remote_tsap)?;
    Ok(buffer.to_vec())
}

pub(crate) fn check_connection_confirm(payload: &[u8]) -> Result<(), HardwareError> {
    let mut cursor = ReadCursor::new(payload);
    let length = cursor.read_u8()?;
    let kind = cursor.read_u8()?;
    if kind & 0xF0 != constants::COTP_CONNECTION_CONFIRM {
        return Err(FrameError::UnexpectedCotpType(kind).into());
    }
    if length as usize + 1 > payload.len() {
        return Err(FrameError::BadCotpLength(length).into());
    }
    Ok(())
}

/// The parameter and data sections of an S7 job
pub(crate) trait Job {
    fn params_length(&self) -> usize;
    fn data_length(&self) -> usize;
    fn serialize_params(&self, cursor: &mut WriteCursor) -> Result<(), HardwareError>;
    fn serialize_data(&self, cursor: &mut WriteCursor) -> Result<(), HardwareError>;
}

/// negotiates the PDU length
pub(crate) struct Setup {
    pub(crate) pdu_length: u16,
}

/// reads `count` bytes of a data block starting at byte `start`
pub(crate) struct ReadVar {
    pub(crate) db_number: u16,
    pub(crate) start: u16,
    pub(crate) count: usize,
}

/// writes `data` into a data block starting at byte `start`
pub(crate) struct WriteVar<'a> {
    pub(crate) db_number: u16,
    pub(crate) start: u16,
    pub(crate) data: &'a [u8],
}

impl Job for Setup {
    fn params_length(&self) -> usize {
        8
    }

    fn data_length(&self) -> usize {
        0
    }

    fn serialize_params(&self, cursor: &mut WriteCursor) -> Result<(), HardwareError> {
        cursor.write_u8(constants::FUNCTION_SETUP_COMMUNICATION)?;
        cursor.write_u8(0x00)?;
        cursor.write_u16_be(0x0001)?; // max AmQ calling
        cursor.write_u16_be(0x0001)?; // max AmQ called
        cursor.write_u16_be(self.pdu_length)?;
        Ok(())
    }

    fn serialize_data(&self, _cursor: &mut WriteCursor) -> Result<(), HardwareError> {
        Ok(())
    }
}

fn serialize_item(
    cursor: &mut WriteCursor,
    function: u8,
    db_number: u16,
    start: u16,
    count: usize,
) -> Result<(), HardwareError> {
    let bit_address = u32::from(start) * 8;
    cursor.write_u8(function)?;
    cursor.write_u8(0x01)?; // item count
    cursor.write_u8(constants::ITEM_SPECIFICATION)?;
    cursor.write_u8(constants::ITEM_LENGTH)?;
    cursor.write_u8(constants::SYNTAX_ANY)?;
    cursor.write_u8(constants::TRANSPORT_SIZE_BYTE)?;
    cursor.write_u16_be(length_u16(count)?)?;
    cursor.write_u16_be(db_number)?;
    cursor.write_u8(constants::AREA_DATA_BLOCK)?;
    // 24-bit address
    cursor.write_u8((bit_address >> 16) as u8)?;
    cursor.write_u16_be(bit_address as u16)?;
    Ok(())
}

impl Job for ReadVar {
    fn params_length(&self) -> usize {
        constants::ITEM_PARAMS_LENGTH
    }

    fn data_length(&self) -> usize {
        0
    }

    fn serialize_params(&self, cursor: &mut WriteCursor) -> Result<(), HardwareError> {
        serialize_item(
            cursor,
            constants::FUNCTION_READ_VAR,
            self.db_number,
            self.start,
            self.count,
        )
    }

    fn serialize_data(&self, _cursor: &mut WriteCursor) -> Result<(), HardwareError> {
        Ok(())
    }
}

impl Job for WriteVar<'_> {
    fn params_length(&self) -> usize {
        constants::ITEM_PARAMS_LENGTH
    }

    fn data_length(&self) -> usize {
        constants::DATA_ITEM_HEADER_LENGTH + self.data.len()
    }

    fn serialize_params(&self, cursor: &mut WriteCursor) -> Result<(), HardwareError> {
        serialize_item(
            cursor,
            constants::FUNCTION_WRITE_VAR,
            self.db_number,
            self.start,
            self.data.len(),
        )
    }

    fn serialize_data(&self, cursor: &mut WriteCursor) -> Result<(), HardwareError> {
        cursor.write_u8(0x00)?; // reserved
        cursor.write_u8(constants::DATA_TRANSPORT_BYTE)?;
        // length in bits
        cursor.write_u16_be(length_u16(self.data.len() * 8)?)?;
        for byte in self.data {
            cursor.write_u8(*byte)?;
        }
        Ok(())
    }
}

/// S7 job wrapped in a COTP data unit and a TPKT frame
pub(crate) fn format_job<J: Job>(pdu_ref: u16, job: &J) -> Result<Vec<u8>, HardwareError> {
    let params_length = job.params_length();
    let data_length = job.data_length();
    let total = constants::TPKT_HEADER_LENGTH
        + constants::COTP_DATA_HEADER_LENGTH
        + constants::S7_JOB_HEADER_LENGTH
        + params_length
        + data_length;

    let mut buffer = vec![0; total];
    let mut cursor = WriteCursor::new(buffer.as_mut_slice());
    write_tpkt_header(&mut cursor, total)?;
    cursor.write_u8(constants::COTP_DATA_HEADER_LENGTH as u8 - 1)?;
    cursor.write_u8(constants::COTP_DATA)?;
    cursor.write_u8(constants::COTP_LAST_DATA_UNIT)?;
    cursor.write_u8(constants::S7_PROTOCOL_ID)?;
    cursor.write_u8(constants::S7_JOB)?;
    cursor.write_u16_be(0x0000)?; // redundancy identification
    cursor.write_u16_be(pdu_ref)?;
    cursor.write_u16_be(length_u16(params_length)?)?;
    cursor.write_u16_be(length_u16(data_length)?)?;
    job.serialize_params(&mut cursor)?;
    job.serialize_data(&mut cursor)?;

    if cursor.position() != total {
        return Err(HardwareError::BadRequest);
    }
    Ok(buffer)
}

/// Parameter and data sections of an S7 ack-data message
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct Ack<'a> {
    pub(crate) params: &'a [u8],
    pub(crate) data: &'a [u8],
}

pub(crate) fn parse_ack(payload: &[u8], pdu_ref: u16) -> Result<Ack<'_>, HardwareError> {
    let mut cursor = ReadCursor::new(payload);

    let length = cursor.read_u8()?;
    let kind = cursor.read_u8()?;
    if kind != constants::COTP_DATA {
        return Err(FrameError::UnexpectedCotpType(kind).into());
    }
    cursor
        .read_bytes(length.saturating_sub(1) as usize)
        .map_err(|_| FrameError::BadCotpLength(length))?;

    let protocol_id = cursor.read_u8()?;
    if protocol_id != constants::S7_PROTOCOL_ID {
        return Err(ResponseError::UnknownProtocolId(protocol_id).into());
    }
    let message_type = cursor.read_u8()?;
    if message_type != constants::S7_ACK_DATA {
        return Err(ResponseError::UnexpectedMessageType(message_type).into());
    }
    let _redundancy_id = cursor.read_u16_be()?;
    let received_ref = cursor.read_u16_be()?;
    let params_length = cursor.read_u16_be()? as usize;
    let data_length = cursor.read_u16_be()? as usize;
    let error_class = cursor.read_u8()?;
    let error_code = cursor.read_u8()?;

    if received_ref != pdu_ref {
        return Err(ResponseError::PduReferenceMismatch(pdu_ref, received_ref).into());
    }
    if error_class != 0 || error_code != 0 {
        return Err(ResponseError::HeaderError(error_class, error_code).into());
    }

    let params = cursor.read_bytes(params_length)?;
    let data = cursor.read_bytes(data_length)?;
    cursor.expect_empty()?;

    Ok(Ack { params, data })
}

/// returns the negotiated PDU length
pub(crate) fn parse_setup(ack: &Ack) -> Result<u16, HardwareError> {
    let mut cursor = ReadCursor::new(ack.params);
    let function = cursor.read_u8()?;
    if function != constants::FUNCTION_SETUP_COMMUNICATION {
        return Err(ResponseError::UnexpectedFunction(function).into());
    }
    // reserved byte and both AmQ values
    cursor.read_bytes(5)?;
    let pdu_length = cursor.read_u16_be()?;
    cursor.expect_empty()?;
    Ok(pdu_length)
}

fn check_item_params(ack: &Ack, function: u8) -> Result<(), HardwareError> {
    let mut cursor = ReadCursor::new(ack.params);
    let received = cursor.read_u8()?;
    if received != function {
        return Err(ResponseError::UnexpectedFunction(received).into());
    }
    let count = cursor.read_u8()?;
    if count != 1 {
        return Err(ResponseError::ItemCount(count).into());
    }
    cursor.expect_empty()?;
    Ok(())
}

fn check_return_code(code: u8) -> Result<(), HardwareError> {
    if code != constants::RETURN_CODE_SUCCESS {
        return Err(HardwareError::Rejected(code));
    }
    Ok(())
}

pub(crate) fn parse_read(ack: &Ack, count: usize) -> Result<Vec<u8>, HardwareError> {
    check_item_params(ack, constants::FUNCTION_READ_VAR)?;

    let mut cursor = ReadCursor::new(ack.data);
    check_return_code(cursor.read_u8()?)?;
    let transport_size = cursor.read_u8()?;
    let length = cursor.read_u16_be()? as usize;

    // these transport sizes report the length in bits
    let length = match transport_size {
        constants::DATA_TRANSPORT_BIT
        | constants::DATA_TRANSPORT_BYTE
        | constants::DATA_TRANSPORT_INTEGER => length.div_ceil(8),
        _ => length,
    };

    if length != count {
        return Err(ResponseError::LengthMismatch(count, length).into());
    }

    let bytes = cursor.read_bytes(length)?;
    cursor.expect_empty()?;
    Ok(bytes.to_vec())
}

pub(crate) fn parse_write(ack: &Ack) -> Result<(), HardwareError> {
    check_item_params(ack, constants::FUNCTION_WRITE_VAR)?;

    let mut cursor = ReadCursor::new(ack.data);
    check_return_code(cursor.read_u8()?)?;
    cursor.expect_empty()?;
    Ok(())
}
