//! Tag evaluator.
//!
//! Turns one read block's raw response into per-tag decoded values and
//! change flags. Grounded on `_process_block` in
//! `original_source/main/services/poll_devices.py`: slice the block's
//! raw words/bits at each tag's offset, decode per its data type, and
//! flag a change whenever the decoded value differs from what's
//! currently stored.

use std::collections::HashMap;

use tracing::warn;

use uuid::Uuid;

use crate::block::ReadBlock;
use crate::codec;
use crate::error::Result;
use crate::model::{Channel, Id, Tag, TagValue, WordOrder};
use crate::transport::Transport;

pub struct ReadTagResult {
    pub tag_id: Id,
    pub tag_external_id: Uuid,
    pub value: TagValue,
    pub changed: bool,
}

/// Issues the wire read for `block` and decodes each of its member tags.
pub async fn read_block(
    transport: &dyn Transport,
    word_order: WordOrder,
    block: &ReadBlock,
    tags: &HashMap<Id, Tag>,
) -> Result<Vec<ReadTagResult>> {
    let mut results = Vec::with_capacity(block.tag_ids.len());

    match block.channel {
        Channel::Coil | Channel::DiscreteInput => {
            let bits = transport
                .read_bits(
                    block.unit_id,
                    block.channel.read_function_code(),
                    block.start,
                    block.length,
                )
                .await?;
            for tag_id in &block.tag_ids {
                let Some(tag) = tags.get(tag_id) else { continue };
                let offset = (tag.address - block.start) as usize;
                let Some(&bit) = bits.get(offset) else {
                    warn!(
                        tag_id = tag.id,
                        offset,
                        block_len = bits.len(),
                        "tag offset out of range for block response, skipping"
                    );
                    continue;
                };
                results.push(finalize(tag, TagValue::Bool(bit)));
            }
        }
        Channel::HoldingRegister | Channel::InputRegister => {
            let words = transport
                .read_registers(
                    block.unit_id,
                    block.channel.read_function_code(),
                    block.start,
                    block.length,
                )
                .await?;
            for tag_id in &block.tag_ids {
                let Some(tag) = tags.get(tag_id) else { continue };
                let offset = (tag.address - block.start) as usize;
                let value = if tag.is_bit_indexed() {
                    let Some(&word) = words.get(offset) else {
                        warn!(
                            tag_id = tag.id,
                            offset,
                            block_len = words.len(),
                            "tag offset out of range for block response, skipping"
                        );
                        continue;
                    };
                    TagValue::Bool(codec::get_bit(word, tag.bit_index))
                } else {
                    let count = tag.read_count() as usize;
                    let Some(slice) = words.get(offset..offset + count) else {
                        warn!(
                            tag_id = tag.id,
                            offset,
                            count,
                            block_len = words.len(),
                            "tag range out of bounds for block response, skipping"
                        );
                        continue;
                    };
                    match codec::decode(tag.data_type, slice, word_order) {
                        Ok(v) => v,
                        Err(e) => {
                            warn!(tag_id = tag.id, error = %e, "decode failed for tag, skipping");
                            continue;
                        }
                    }
                };
                results.push(finalize(tag, value));
            }
        }
    }
    Ok(results)
}

fn finalize(tag: &Tag, value: TagValue) -> ReadTagResult {
    let changed = tag.current_value.as_ref() != Some(&value);
    ReadTagResult {
        tag_id: tag.id,
        tag_external_id: tag.external_id,
        value,
        changed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::DataType;
    use chrono::Duration;

    fn tag(id: Id, address: u16, data_type: DataType, bit_index: u8, current: Option<TagValue>) -> Tag {
        Tag {
            id,
            external_id: Uuid::nil(),
            device_id: 1,
            unit_id: 1,
            channel: Channel::HoldingRegister,
            data_type,
            address,
            bit_index,
            read_amount: 1,
            restricted_write: false,
            history_interval: Duration::seconds(1),
            history_retention: Duration::zero(),
            current_value: current,
            last_updated: None,
            last_history_at: None,
            is_active: true,
        }
    }

    #[test]
    fn change_detection_is_structural() {
        let t = tag(1, 0, DataType::UInt16, 0, Some(TagValue::UInt(5)));
        let same = finalize(&t, TagValue::UInt(5));
        assert!(!same.changed);
        let diff = finalize(&t, TagValue::UInt(6));
        assert!(diff.changed);
    }

    #[test]
    fn no_prior_value_counts_as_changed() {
        let t = tag(1, 0, DataType::UInt16, 0, None);
        let result = finalize(&t, TagValue::UInt(0));
        assert!(result.changed);
    }
}
