use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::ResponseError;

pub(crate) struct ReadBuffer {
    buffer: Vec<u8>,
    begin: usize,
    end: usize,
}

impl ReadBuffer {
    pub(crate) fn new(capacity: usize) -> Self {
        ReadBuffer {
            buffer: vec![0; capacity],
            begin: 0,
            end: 0,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.end - self.begin
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.begin == self.end
    }

    pub(crate) fn read(&mut self, count: usize) -> Result<&[u8], ResponseError> {
        if self.len() < count {
            return Err(ResponseError::InsufficientBytes);
        }

        match self.buffer.get(self.begin..(self.begin + count)) {
            Some(ret) => {
                self.begin += count;
                Ok(ret)
            }
            None => Err(ResponseError::InsufficientBytes),
        }
    }

    pub(crate) fn peek(&self, count: usize) -> Option<&[u8]> {
        if self.len() < count {
            return None;
        }
        self.buffer.get(self.begin..(self.begin + count))
    }

    /// move the unread bytes to the front of the storage
    fn compact(&mut self) {
        self.buffer.copy_within(self.begin..self.end, 0);
        self.end -= self.begin;
        self.begin = 0;
    }

    /// append whatever `io` has ready to the unread bytes
    pub(crate) async fn read_some<T: AsyncRead + Unpin>(
        &mut self,
        io: &mut T,
    ) -> Result<usize, std::io::Error> {
        let full = self.end == self.buffer.len();
        if self.begin > 0 && (full || self.is_empty()) {
            self.compact();
        }

        match io.read(&mut self.buffer[self.end..]).await? {
            0 => Err(std::io::ErrorKind::UnexpectedEof.into()),
            count => {
                self.end += count;
                Ok(count)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::*;

    #[test]
    fn errors_when_reading_to_many_bytes() {
        let mut buffer = ReadBuffer::new(10);
        assert_eq!(buffer.read(1), Err(ResponseError::InsufficientBytes));
        assert_eq!(buffer.peek(1), None);
    }

    #[test]
    fn shifts_contents_when_buffer_at_capacity() {
        let mut buffer = ReadBuffer::new(3);
        let mut io = io::Builder::new()
            .read(&[0x01, 0x02, 0x03])
            .read(&[0x04, 0x05])
            .build();
        assert_eq!(block_on(buffer.read_some(&mut io)).unwrap(), 3);
        assert_eq!(buffer.read(2).unwrap(), &[0x01, 0x02]);
        assert_eq!(block_on(buffer.read_some(&mut io)).unwrap(), 2);
        assert_eq!(buffer.read(3).unwrap(), &[0x03, 0x04, 0x05]);
    }

    #[test]
    fn drained_buffer_is_reused_from_the_front() {
        let mut buffer = ReadBuffer::new(4);
        let mut io = io::Builder::new()
            .read(&[0x01, 0x02, 0x03])
            .read(&[0x04, 0x05, 0x06, 0x07])
            .build();
        assert_eq!(block_on(buffer.read_some(&mut io)).unwrap(), 3);
        assert_eq!(buffer.read(3).unwrap(), &[0x01, 0x02, 0x03]);
        assert!(buffer.is_empty());
        assert_eq!(block_on(buffer.read_some(&mut io)).unwrap(), 4);
        assert_eq!(buffer.read(4).unwrap(), &[0x04, 0x05, 0x06, 0x07]);
    }

    #[test]
    fn end_of_stream_is_an_error() {
        let mut buffer = ReadBuffer::new(3);
        let mut io = io::Builder::new().build();
        assert_eq!(
            block_on(buffer.read_some(&mut io)).unwrap_err().kind(),
            std::io::ErrorKind::UnexpectedEof
        );
    }
}
