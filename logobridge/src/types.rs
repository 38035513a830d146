use std::time::Duration;

use crate::error::{InvalidRange, InvalidVariable};

/// Highest address of the local variable memory (VM) of the controller
pub const MAX_ADDRESS: u16 = 850;

/// Number of addressable bytes in the local variable memory
pub const MEMORY_SIZE: usize = MAX_ADDRESS as usize + 1;

/// Kind of a typed variable
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum VariableKind {
    /// single bit within a byte
    Bit,
    /// unsigned 8-bit integer
    Byte,
    /// signed 16-bit big-endian integer
    Integer,
    /// IEEE-754 single precision big-endian float
    Float,
}

impl VariableKind {
    /// number of bytes occupied in controller memory
    pub fn width(self) -> usize {
        match self {
            VariableKind::Bit => 1,
            VariableKind::Byte => 1,
            VariableKind::Integer => 2,
            VariableKind::Float => 4,
        }
    }
}

impl std::fmt::Display for VariableKind {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            VariableKind::Bit => f.write_str("bit"),
            VariableKind::Byte => f.write_str("byte"),
            VariableKind::Integer => f.write_str("integer"),
            VariableKind::Float => f.write_str("float"),
        }
    }
}

/// A decoded value of a typed variable
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Value {
    /// value of a bit variable
    Bit(bool),
    /// value of a byte variable
    Byte(u8),
    /// value of an integer variable
    Integer(i16),
    /// value of a float variable
    Float(f32),
}

impl Value {
    /// kind of variable this value belongs to
    pub fn kind(&self) -> VariableKind {
        match self {
            Value::Bit(_) => VariableKind::Bit,
            Value::Byte(_) => VariableKind::Byte,
            Value::Integer(_) => VariableKind::Integer,
            Value::Float(_) => VariableKind::Float,
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Value::Bit(x) => write!(f, "{}", u8::from(*x)),
            Value::Byte(x) => write!(f, "{x}"),
            Value::Integer(x) => write!(f, "{x}"),
            Value::Float(x) => write!(f, "{x}"),
        }
    }
}

/// Contiguous range of controller memory polled on a fixed cycle
///
/// Cannot be constructed with `end <= start` or `end > MAX_ADDRESS`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemoryRange {
    start: u16,
    end: u16,
    poll_interval: Duration,
}

impl MemoryRange {
    /// create a range covering `start..=end`
    pub fn new(start: u16, end: u16, poll_interval: Duration) -> Result<Self, InvalidRange> {
        if end <= start {
            return Err(InvalidRange::EndNotAfterStart(start, end));
        }
        if end > MAX_ADDRESS {
            return Err(InvalidRange::EndOutOfBounds(end));
        }
        Ok(Self {
            start,
            end,
            poll_interval,
        })
    }

    /// first address of the range
    pub fn start(&self) -> u16 {
        self.start
    }

    /// last address of the range (inclusive)
    pub fn end(&self) -> u16 {
        self.end
    }

    /// time between the start of two poll cycles
    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// number of bytes in the range
    pub fn size(&self) -> usize {
        (self.end - self.start) as usize + 1
    }

    /// true if `[address, address + width)` lies fully inside the range
    pub fn contains(&self, address: u16, width: usize) -> bool {
        let last = address as usize + width - 1;
        address >= self.start && last <= self.end as usize
    }
}

impl std::fmt::Display for MemoryRange {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "[{}, {}]", self.start, self.end)
    }
}

/// Identifies a memory range within a registry
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RangeId(pub(crate) usize);

impl std::fmt::Display for RangeId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Inclusive span of absolute addresses
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Span {
    /// first address
    pub start: u16,
    /// last address (inclusive)
    pub end: u16,
}

impl Span {
    /// create a span covering `start..=end`
    pub fn new(start: u16, end: u16) -> Self {
        Self { start, end }
    }

    /// true if the spans share at least one address
    pub fn intersects(&self, other: &Span) -> bool {
        self.start <= other.end && other.start <= self.end
    }
}

/// One maximal run of bytes that changed during a poll cycle
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChangeEvent {
    /// range the bytes belong to
    pub range: RangeId,
    /// absolute addresses that changed
    pub span: Span,
    /// new values of the changed bytes
    pub bytes: Vec<u8>,
}

/// A typed view over a fixed address of the controller memory
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TypedVariable {
    address: u16,
    kind: VariableKind,
    bit: Option<u8>,
}

impl TypedVariable {
    /// create a variable, checking the bit offset and the upper memory bound
    pub fn new(address: u16, kind: VariableKind, bit: Option<u8>) -> Result<Self, InvalidVariable> {
        match (kind, bit) {
            (VariableKind::Bit, None) => return Err(InvalidVariable::MissingBitOffset),
            (VariableKind::Bit, Some(x)) if x > 7 => return Err(InvalidVariable::BitOffset(x)),
            (VariableKind::Bit, Some(_)) => {}
            (_, Some(_)) => return Err(InvalidVariable::UnexpectedBitOffset),
            (_, None) => {}
        }

        if address as usize + kind.width() > MEMORY_SIZE {
            return Err(InvalidVariable::AddressOverflow(address));
        }

        Ok(Self { address, kind, bit })
    }

    /// bit `bit` of the byte at `address`
    pub fn bit(address: u16, bit: u8) -> Result<Self, InvalidVariable> {
        Self::new(address, VariableKind::Bit, Some(bit))
    }

    /// byte at `address`
    pub fn byte(address: u16) -> Result<Self, InvalidVariable> {
        Self::new(address, VariableKind::Byte, None)
    }

    /// integer at `address..=address + 1`
    pub fn integer(address: u16) -> Result<Self, InvalidVariable> {
        Self::new(address, VariableKind::Integer, None)
    }

    /// float at `address..=address + 3`
    pub fn float(address: u16) -> Result<Self, InvalidVariable> {
        Self::new(address, VariableKind::Float, None)
    }

    /// first address
    pub fn address(&self) -> u16 {
        self.address
    }

    /// kind of the variable
    pub fn kind(&self) -> VariableKind {
        self.kind
    }

    /// number of bytes occupied
    pub fn width(&self) -> usize {
        self.kind.width()
    }

    /// bit offset for bit variables
    pub fn bit_offset(&self) -> Option<u8> {
        self.bit
    }

    /// absolute addresses covered by the variable
    pub fn span(&self) -> Span {
        Span::new(self.address, self.address + self.width() as u16 - 1)
    }
}

impl std::fmt::Display for TypedVariable {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self.bit {
            Some(bit) => write!(f, "{}@{}.{}", self.kind, self.address, bit),
            None => write!(f, "{}@{}", self.kind, self.address),
        }
    }
}

/// Direction of a topic binding
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    /// publish the variable on every change
    Publish,
    /// write the variable on every inbound message
    Subscribe,
}

/// Association between a typed variable and a transport topic
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TopicBinding {
    /// transport topic
    pub topic: String,
    /// bound variable
    pub variable: TypedVariable,
    /// direction of the binding
    pub direction: Direction,
}

impl TopicBinding {
    /// binding that publishes `variable` on `topic`
    pub fn publish(topic: impl Into<String>, variable: TypedVariable) -> Self {
        Self {
            topic: topic.into(),
            variable,
            direction: Direction::Publish,
        }
    }

    /// binding that writes `variable` from messages on `topic`
    pub fn subscribe(topic: impl Into<String>, variable: TypedVariable) -> Self {
        Self {
            topic: topic.into(),
            variable,
            direction: Direction::Subscribe,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_ranges_that_do_not_end_after_their_start() {
        assert_eq!(
            MemoryRange::new(5, 4, Duration::from_millis(100)),
            Err(InvalidRange::EndNotAfterStart(5, 4))
        );
        assert_eq!(
            MemoryRange::new(0, 0, Duration::from_millis(100)),
            Err(InvalidRange::EndNotAfterStart(0, 0))
        );
        assert_eq!(
            MemoryRange::new(0, 1, Duration::from_millis(100)).map(|r| r.size()),
            Ok(2)
        );
    }

    #[test]
    fn rejects_ranges_past_the_end_of_memory() {
        assert_eq!(
            MemoryRange::new(0, 851, Duration::from_millis(100)),
            Err(InvalidRange::EndOutOfBounds(851))
        );
    }

    #[test]
    fn range_contains_checks_the_whole_width() {
        let range = MemoryRange::new(10, 20, Duration::from_millis(100)).unwrap();
        assert!(range.contains(10, 1));
        assert!(range.contains(17, 4));
        assert!(!range.contains(18, 4));
        assert!(!range.contains(9, 2));
        assert_eq!(range.size(), 11);
    }

    #[test]
    fn bit_variables_require_a_valid_offset() {
        assert_eq!(
            TypedVariable::new(0, VariableKind::Bit, None),
            Err(InvalidVariable::MissingBitOffset)
        );
        assert_eq!(TypedVariable::bit(0, 8), Err(InvalidVariable::BitOffset(8)));
        assert_eq!(
            TypedVariable::new(0, VariableKind::Byte, Some(1)),
            Err(InvalidVariable::UnexpectedBitOffset)
        );
    }

    #[test]
    fn variables_must_fit_into_memory() {
        assert!(TypedVariable::float(847).is_ok());
        assert_eq!(
            TypedVariable::float(848),
            Err(InvalidVariable::AddressOverflow(848))
        );
        assert_eq!(TypedVariable::integer(17).unwrap().span(), Span::new(17, 18));
    }

    #[test]
    fn spans_intersect_when_they_share_an_address() {
        assert!(Span::new(0, 5).intersects(&Span::new(5, 9)));
        assert!(Span::new(3, 3).intersects(&Span::new(0, 10)));
        assert!(!Span::new(0, 4).intersects(&Span::new(5, 9)));
    }
}
