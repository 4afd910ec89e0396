//! Register <-> value codec.
//!
//! Table-driven dispatch keyed by `DataType` (channel only matters insofar
//! as it decides bit- vs word-addressing upstream, in `Tag::is_bit_indexed`).
//! Word order applies at word granularity only — byte order within a word
//! is always big-endian network order, matching `ModbusTcpClient` and the
//! `convert_from_registers`/`convert_to_registers` behavior it's grounded on.

use crate::error::{PollerError, Result};
use crate::model::{DataType, TagValue, WordOrder};

/// Reorders a 2- or 4-word group so the most significant word comes
/// first, regardless of the device's configured word order.
fn reorder_words(words: &[u16], word_order: WordOrder) -> Vec<u16> {
    match word_order {
        WordOrder::Big => words.to_vec(),
        WordOrder::Little => {
            let mut v = words.to_vec();
            v.reverse();
            v
        }
    }
}

fn words_to_be_bytes(words: &[u16]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(words.len() * 2);
    for w in words {
        bytes.extend_from_slice(&w.to_be_bytes());
    }
    bytes
}

fn be_bytes_to_words(bytes: &[u8], word_order: WordOrder) -> Vec<u16> {
    let mut words: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|c| u16::from_be_bytes([c[0], c[1]]))
        .collect();
    if word_order == WordOrder::Little {
        words.reverse();
    }
    words
}

/// Extracts the value of a single bit within a 16-bit word, MSB-relative
/// is not used here — bit 0 is the least significant bit, matching the
/// `(values >> bit_index) & 1` convention in the original poller.
pub fn get_bit(word: u16, bit_index: u8) -> bool {
    (word >> bit_index) & 1 == 1
}

/// Computes the AND/OR mask pair for a `mask_write_register` call that
/// sets exactly `bit_index` to `value` without disturbing neighboring
/// bits.
pub fn set_bit_mask(bit_index: u8, value: bool) -> (u16, u16) {
    let bit_mask = 1u16 << bit_index;
    let and_mask = !bit_mask;
    let or_mask = if value { bit_mask } else { 0 };
    (and_mask, or_mask)
}

/// Decodes `words` (already reordered to the block's native layout) into
/// a `TagValue` of `data_type`, respecting `word_order` for multi-word
/// types. Does not account for bit indexing — callers extract the bit
/// from the decoded word themselves via [`get_bit`].
pub fn decode(data_type: DataType, words: &[u16], word_order: WordOrder) -> Result<TagValue> {
    let expected = expected_word_count(data_type, words.len());
    if words.len() != expected {
        return Err(PollerError::CodecLengthMismatch {
            expected,
            actual: words.len(),
        });
    }
    match data_type {
        DataType::Bool => Ok(TagValue::Bool(words[0] != 0)),
        DataType::UInt16 => Ok(TagValue::UInt(words[0] as u64)),
        DataType::Int16 => Ok(TagValue::Int(words[0] as i16 as i64)),
        DataType::UInt32 => {
            let w = reorder_words(words, word_order);
            Ok(TagValue::UInt(((w[0] as u32) << 16 | w[1] as u32) as u64))
        }
        DataType::Int32 => {
            let w = reorder_words(words, word_order);
            Ok(TagValue::Int((((w[0] as u32) << 16 | w[1] as u32) as i32) as i64))
        }
        DataType::Float32 => {
            let w = reorder_words(words, word_order);
            let bytes = words_to_be_bytes(&w);
            Ok(TagValue::Float(f32::from_be_bytes(bytes.try_into().unwrap()) as f64))
        }
        DataType::UInt64 => {
            let w = reorder_words(words, word_order);
            let bytes = words_to_be_bytes(&w);
            Ok(TagValue::UInt(u64::from_be_bytes(bytes.try_into().unwrap())))
        }
        DataType::Int64 => {
            let w = reorder_words(words, word_order);
            let bytes = words_to_be_bytes(&w);
            Ok(TagValue::Int(i64::from_be_bytes(bytes.try_into().unwrap())))
        }
        DataType::Float64 => {
            let w = reorder_words(words, word_order);
            let bytes = words_to_be_bytes(&w);
            Ok(TagValue::Float(f64::from_be_bytes(bytes.try_into().unwrap())))
        }
        DataType::String => {
            let bytes = words_to_be_bytes(words);
            let s = String::from_utf8_lossy(&bytes)
                .trim_end_matches('\0')
                .to_string();
            Ok(TagValue::Text(s))
        }
    }
}

/// Encodes `value` as `data_type` into a word vector ready for a write
/// request, in the device's configured `word_order`.
pub fn encode(data_type: DataType, value: &TagValue, word_order: WordOrder) -> Result<Vec<u16>> {
    let range_err = || PollerError::CodecEncodeRange {
        value: format!("{value:?}"),
        data_type: format!("{data_type:?}"),
    };
    match data_type {
        DataType::Bool => {
            let b = match value {
                TagValue::Bool(b) => *b,
                other => coerce_bool(other).ok_or_else(range_err)?,
            };
            Ok(vec![if b { 1 } else { 0 }])
        }
        DataType::UInt16 => {
            let n = value.as_f64().ok_or_else(range_err)?;
            if !(0.0..=u16::MAX as f64).contains(&n) {
                return Err(range_err());
            }
            Ok(vec![n as u16])
        }
        DataType::Int16 => {
            let n = value.as_f64().ok_or_else(range_err)?;
            if !(i16::MIN as f64..=i16::MAX as f64).contains(&n) {
                return Err(range_err());
            }
            Ok(vec![n as i16 as u16])
        }
        DataType::UInt32 => {
            let n = value.as_f64().ok_or_else(range_err)?;
            if !(0.0..=u32::MAX as f64).contains(&n) {
                return Err(range_err());
            }
            let words = [((n as u32) >> 16) as u16, (n as u32) as u16];
            Ok(reorder_words(&words, word_order))
        }
        DataType::Int32 => {
            let n = value.as_f64().ok_or_else(range_err)?;
            if !(i32::MIN as f64..=i32::MAX as f64).contains(&n) {
                return Err(range_err());
            }
            let bits = n as i32 as u32;
            let words = [(bits >> 16) as u16, bits as u16];
            Ok(reorder_words(&words, word_order))
        }
        DataType::Float32 => {
            let n = value.as_f64().ok_or_else(range_err)?;
            let bytes = (n as f32).to_be_bytes();
            let words = be_bytes_to_words(&bytes, WordOrder::Big);
            Ok(reorder_words(&words, word_order))
        }
        DataType::UInt64 => {
            let n = value.as_f64().ok_or_else(range_err)?;
            let bytes = (n as u64).to_be_bytes();
            let words = be_bytes_to_words(&bytes, WordOrder::Big);
            Ok(reorder_words(&words, word_order))
        }
        DataType::Int64 => {
            let n = value.as_f64().ok_or_else(range_err)?;
            let bytes = (n as i64).to_be_bytes();
            let words = be_bytes_to_words(&bytes, WordOrder::Big);
            Ok(reorder_words(&words, word_order))
        }
        DataType::Float64 => {
            let n = value.as_f64().ok_or_else(range_err)?;
            let bytes = n.to_be_bytes();
            let words = be_bytes_to_words(&bytes, WordOrder::Big);
            Ok(reorder_words(&words, word_order))
        }
        DataType::String => {
            let s = match value {
                TagValue::Text(s) => s.clone(),
                other => return Err(PollerError::CodecEncodeRange {
                    value: format!("{other:?}"),
                    data_type: "string".into(),
                }),
            };
            let mut bytes = s.into_bytes();
            if bytes.len() % 2 != 0 {
                bytes.push(0);
            }
            Ok(be_bytes_to_words(&bytes, WordOrder::Big))
        }
    }
}

fn coerce_bool(value: &TagValue) -> Option<bool> {
    match value {
        TagValue::Bool(b) => Some(*b),
        TagValue::Int(i) => Some(*i != 0),
        TagValue::UInt(u) => Some(*u != 0),
        _ => None,
    }
}

fn expected_word_count(data_type: DataType, actual_len: usize) -> usize {
    match data_type {
        DataType::Bool | DataType::Int16 | DataType::UInt16 => 1,
        DataType::Int32 | DataType::UInt32 | DataType::Float32 => 2,
        DataType::Int64 | DataType::UInt64 | DataType::Float64 => 4,
        // String width is read-amount dependent; accept whatever was given.
        DataType::String => actual_len,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_float32_big_endian() {
        // 1234.5f32 = 0x449A5000
        let words = [0x449A, 0x5000];
        let v = decode(DataType::Float32, &words, WordOrder::Big).unwrap();
        match v {
            TagValue::Float(f) => assert!((f - 1234.5).abs() < 1e-3),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn decodes_float32_little_endian_word_order() {
        let words = [0x5000, 0x449A];
        let v = decode(DataType::Float32, &words, WordOrder::Little).unwrap();
        match v {
            TagValue::Float(f) => assert!((f - 1234.5).abs() < 1e-3),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn encode_decode_round_trip_int32() {
        let value = TagValue::Int(-42);
        let words = encode(DataType::Int32, &value, WordOrder::Big).unwrap();
        let decoded = decode(DataType::Int32, &words, WordOrder::Big).unwrap();
        assert_eq!(decoded, TagValue::Int(-42));
    }

    #[test]
    fn length_mismatch_is_rejected() {
        let err = decode(DataType::Float64, &[0, 1], WordOrder::Big).unwrap_err();
        assert_eq!(err.error_code(), 300);
    }

    #[test]
    fn bit_mask_sets_single_bit_without_disturbing_others() {
        let (and_mask, or_mask) = set_bit_mask(3, true);
        let word = 0b1010_1010_1010_1010u16;
        let result = (word & and_mask) | or_mask;
        assert!(get_bit(result, 3));
        assert_eq!(result & !(1 << 3), word & !(1 << 3));
    }
}
