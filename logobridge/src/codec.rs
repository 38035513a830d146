//! Conversions between typed values, controller memory and transport payloads
//!
//! Controller memory is big-endian: integers are two's complement `i16`,
//! floats are IEEE-754 single precision. Transport payloads are plain decimal
//! ASCII that does not depend on the locale.

use std::num::IntErrorKind;

use crate::error::FormatError;
use crate::types::{TypedVariable, Value, VariableKind};

/// Read the value of `variable` from `bytes`, which must hold exactly the
/// bytes of the variable's span
pub fn decode_binary(variable: &TypedVariable, bytes: &[u8]) -> Result<Value, FormatError> {
    let width = variable.width();
    if bytes.len() != width {
        return Err(FormatError::WrongWidth {
            expected: width,
            actual: bytes.len(),
        });
    }

    let value = match variable.kind() {
        VariableKind::Bit => {
            let bit = variable.bit_offset().unwrap_or(0);
            Value::Bit(get_bit(bytes[0], bit))
        }
        VariableKind::Byte => Value::Byte(bytes[0]),
        VariableKind::Integer => Value::Integer(i16::from_be_bytes([bytes[0], bytes[1]])),
        VariableKind::Float => {
            Value::Float(f32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
        }
    };

    Ok(value)
}

/// Encode a value to its controller representation
///
/// A bit is encoded as a byte with only that bit set; use [`set_bit`] to
/// preserve the sibling bits of an existing byte.
pub fn encode_binary(value: Value, bit: u8) -> Vec<u8> {
    match value {
        Value::Bit(x) => vec![set_bit(0, bit, x)],
        Value::Byte(x) => vec![x],
        Value::Integer(x) => x.to_be_bytes().to_vec(),
        Value::Float(x) => x.to_be_bytes().to_vec(),
    }
}

/// Returns the state of bit `bit` (0 = least significant) of `byte`
pub fn get_bit(byte: u8, bit: u8) -> bool {
    byte & (1 << (bit & 0x07)) != 0
}

/// Returns `byte` with bit `bit` set to `value` and every other bit unchanged
pub fn set_bit(byte: u8, bit: u8, value: bool) -> u8 {
    let mask = 1 << (bit & 0x07);
    if value {
        byte | mask
    } else {
        byte & !mask
    }
}

/// Encode a value as transport payload text
///
/// Floats use the shortest representation that parses back to the same value.
pub fn encode_text(value: Value) -> String {
    value.to_string()
}

/// Decode transport payload text as a value of `kind`
///
/// Leading and trailing whitespace is ignored.
pub fn decode_text(kind: VariableKind, payload: &[u8]) -> Result<Value, FormatError> {
    let text = std::str::from_utf8(payload).map_err(|_| FormatError::NotUtf8)?;
    let trimmed = text.trim();

    let not_a_number = || FormatError::NotANumber {
        kind,
        text: text.to_string(),
    };
    let out_of_range = || FormatError::OutOfRange {
        kind,
        text: text.to_string(),
    };
    // integers too long for i64 are still numbers
    let integer = || {
        trimmed.parse::<i64>().map_err(|err| match err.kind() {
            IntErrorKind::PosOverflow | IntErrorKind::NegOverflow => out_of_range(),
            _ => not_a_number(),
        })
    };

    match kind {
        VariableKind::Bit => match trimmed {
            "0" | "false" => Ok(Value::Bit(false)),
            "1" | "true" => Ok(Value::Bit(true)),
            _ => integer().and_then(|_| Err(out_of_range())),
        },
        VariableKind::Byte => {
            let x = integer()?;
            u8::try_from(x).map(Value::Byte).map_err(|_| out_of_range())
        }
        VariableKind::Integer => {
            let x = integer()?;
            i16::try_from(x).map(Value::Integer).map_err(|_| out_of_range())
        }
        VariableKind::Float => {
            let x = trimmed.parse::<f32>().map_err(|_| not_a_number())?;
            // overflowing literals parse as infinity
            let literal = trimmed.trim_start_matches(['+', '-']).to_ascii_lowercase();
            if x.is_infinite() && literal != "inf" && literal != "infinity" {
                return Err(out_of_range());
            }
            Ok(Value::Float(x))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_big_endian_integers() {
        let var = TypedVariable::integer(5).unwrap();
        assert_eq!(
            decode_binary(&var, &[0x05, 0x39]),
            Ok(Value::Integer(1337))
        );
        assert_eq!(decode_binary(&var, &[0xFF, 0xFE]), Ok(Value::Integer(-2)));
    }

    #[test]
    fn decodes_big_endian_floats() {
        let var = TypedVariable::float(0).unwrap();
        assert_eq!(
            decode_binary(&var, &[0x3F, 0xC0, 0x00, 0x00]),
            Ok(Value::Float(1.5))
        );
    }

    #[test]
    fn decodes_single_bits() {
        let var = TypedVariable::bit(3, 3).unwrap();
        assert_eq!(decode_binary(&var, &[0b0000_1000]), Ok(Value::Bit(true)));
        assert_eq!(decode_binary(&var, &[0b1111_0111]), Ok(Value::Bit(false)));
    }

    #[test]
    fn rejects_slices_of_the_wrong_width() {
        let var = TypedVariable::integer(0).unwrap();
        assert_eq!(
            decode_binary(&var, &[0x01]),
            Err(FormatError::WrongWidth {
                expected: 2,
                actual: 1
            })
        );
    }

    #[test]
    fn encodes_integer_1337_big_endian() {
        assert_eq!(encode_binary(Value::Integer(1337), 0), vec![0x05, 0x39]);
    }

    #[test]
    fn setting_a_bit_preserves_its_siblings() {
        assert_eq!(set_bit(0b1010_0101, 3, true), 0b1010_1101);
        assert_eq!(set_bit(0b1010_1101, 3, false), 0b1010_0101);
        assert_eq!(set_bit(0xFF, 7, false), 0x7F);
        assert_eq!(encode_binary(Value::Bit(true), 4), vec![0b0001_0000]);
    }

    #[test]
    fn binary_round_trip_for_every_byte_and_integer() {
        let byte = TypedVariable::byte(0).unwrap();
        for x in u8::MIN..=u8::MAX {
            let bytes = encode_binary(Value::Byte(x), 0);
            assert_eq!(decode_binary(&byte, &bytes), Ok(Value::Byte(x)));
        }

        let integer = TypedVariable::integer(0).unwrap();
        for x in i16::MIN..=i16::MAX {
            let bytes = encode_binary(Value::Integer(x), 0);
            assert_eq!(decode_binary(&integer, &bytes), Ok(Value::Integer(x)));
        }
    }

    #[test]
    fn float_round_trip_through_binary_and_text() {
        let var = TypedVariable::float(0).unwrap();
        for x in [0.0f32, -0.0, 1.5, -42.125, 0.1, f32::MIN_POSITIVE, f32::MAX, f32::MIN, 3.4e-20] {
            let bytes = encode_binary(Value::Float(x), 0);
            assert_eq!(decode_binary(&var, &bytes), Ok(Value::Float(x)));

            let text = encode_text(Value::Float(x));
            assert_eq!(
                decode_text(VariableKind::Float, text.as_bytes()),
                Ok(Value::Float(x)),
                "text: {text}"
            );
        }
    }

    #[test]
    fn text_round_trip_for_every_integer() {
        for x in i16::MIN..=i16::MAX {
            let text = encode_text(Value::Integer(x));
            assert_eq!(
                decode_text(VariableKind::Integer, text.as_bytes()),
                Ok(Value::Integer(x))
            );
        }
    }

    #[test]
    fn encodes_text_without_locale_formatting() {
        assert_eq!(encode_text(Value::Byte(42)), "42");
        assert_eq!(encode_text(Value::Integer(-1337)), "-1337");
        assert_eq!(encode_text(Value::Float(1234.5)), "1234.5");
        assert_eq!(encode_text(Value::Bit(true)), "1");
    }

    #[test]
    fn decodes_text_with_surrounding_whitespace() {
        assert_eq!(
            decode_text(VariableKind::Integer, b" 1337\n"),
            Ok(Value::Integer(1337))
        );
        assert_eq!(decode_text(VariableKind::Bit, b"true"), Ok(Value::Bit(true)));
    }

    #[test]
    fn rejects_text_that_is_not_a_number() {
        assert_eq!(
            decode_text(VariableKind::Integer, b"abc"),
            Err(FormatError::NotANumber {
                kind: VariableKind::Integer,
                text: "abc".to_string()
            })
        );
        assert_eq!(
            decode_text(VariableKind::Byte, &[0xFF, 0xFE]),
            Err(FormatError::NotUtf8)
        );
    }

    #[test]
    fn rejects_text_outside_of_the_width() {
        assert_eq!(
            decode_text(VariableKind::Byte, b"256"),
            Err(FormatError::OutOfRange {
                kind: VariableKind::Byte,
                text: "256".to_string()
            })
        );
        assert!(matches!(
            decode_text(VariableKind::Byte, b"-1"),
            Err(FormatError::OutOfRange { .. })
        ));
        assert!(matches!(
            decode_text(VariableKind::Integer, b"32768"),
            Err(FormatError::OutOfRange { .. })
        ));
        assert!(matches!(
            decode_text(VariableKind::Float, b"1e39"),
            Err(FormatError::OutOfRange { .. })
        ));
        assert!(matches!(
            decode_text(VariableKind::Bit, b"2"),
            Err(FormatError::OutOfRange { .. })
        ));
    }

    #[test]
    fn integers_beyond_64_bits_are_out_of_range() {
        for kind in [VariableKind::Bit, VariableKind::Byte, VariableKind::Integer] {
            assert_eq!(
                decode_text(kind, b"99999999999999999999"),
                Err(FormatError::OutOfRange {
                    kind,
                    text: "99999999999999999999".to_string()
                })
            );
            assert!(matches!(
                decode_text(kind, b"-99999999999999999999"),
                Err(FormatError::OutOfRange { .. })
            ));
        }
    }
}
