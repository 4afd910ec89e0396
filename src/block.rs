//! Read block planning.
//!
//! Groups tags sharing a `(device, channel, unit_id)` key into the
//! smallest number of contiguous register ranges, coalescing small gaps
//! so a handful of individually-addressed tags become one read call.
//! Grounded directly on `_build_read_blocks` in
//! `original_source/main/services/poll_devices.py`.

use crate::model::{Channel, Id, Tag};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadBlock {
    pub device_id: Id,
    pub unit_id: u8,
    pub channel: Channel,
    pub start: u16,
    pub length: u16,
    pub tag_ids: Vec<Id>,
}

/// Plans read blocks for `tags`. A tag whose range would start a block
/// already containing another tag extends that block whenever the gap
/// to its start is within `max_gap` and the resulting block stays within
/// `max_size` words/bits; otherwise it starts a new block.
pub fn plan_blocks(tags: &[&Tag], max_gap: u16, max_size: u16) -> Vec<ReadBlock> {
    let mut groups: std::collections::BTreeMap<(Id, u8, Channel), Vec<&Tag>> =
        std::collections::BTreeMap::new();
    for tag in tags {
        if !tag.is_active {
            continue;
        }
        groups
            .entry((tag.device_id, tag.unit_id, tag.channel))
            .or_default()
            .push(tag);
    }

    let mut blocks = Vec::new();
    for ((device_id, unit_id, _), mut group) in groups {
        group.sort_by_key(|t| t.address);
        let channel = group[0].channel;

        let mut block_start = group[0].address;
        let mut block_end = group[0].address + group[0].read_count();
        let mut tag_ids = vec![group[0].id];

        for tag in &group[1..] {
            let close_enough = tag.address.saturating_sub(block_end) <= max_gap;
            let within_size = (tag.address + tag.read_count()).saturating_sub(block_start) <= max_size;
            if close_enough && within_size {
                block_end = block_end.max(tag.address + tag.read_count());
                tag_ids.push(tag.id);
            } else {
                blocks.push(ReadBlock {
                    device_id,
                    unit_id,
                    channel,
                    start: block_start,
                    length: block_end - block_start,
                    tag_ids: std::mem::take(&mut tag_ids),
                });
                block_start = tag.address;
                block_end = tag.address + tag.read_count();
                tag_ids.push(tag.id);
            }
        }
        blocks.push(ReadBlock {
            device_id,
            unit_id,
            channel,
            start: block_start,
            length: block_end - block_start,
            tag_ids,
        });
    }
    blocks
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::DataType;
    use chrono::Duration;
    use uuid::Uuid;

    fn tag(id: Id, address: u16, read_amount: u16) -> Tag {
        Tag {
            id,
            external_id: Uuid::nil(),
            device_id: 1,
            unit_id: 1,
            channel: Channel::HoldingRegister,
            data_type: DataType::UInt16,
            address,
            bit_index: 0,
            read_amount,
            restricted_write: false,
            history_interval: Duration::seconds(1),
            history_retention: Duration::zero(),
            current_value: None,
            last_updated: None,
            last_history_at: None,
            is_active: true,
        }
    }

    #[test]
    fn coalesces_tags_within_max_gap() {
        let tags = vec![tag(1, 0, 1), tag(2, 3, 1), tag(3, 10, 1)];
        let refs: Vec<&Tag> = tags.iter().collect();
        let blocks = plan_blocks(&refs, 4, 128);
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].start, 0);
        assert_eq!(blocks[0].length, 4);
        assert_eq!(blocks[0].tag_ids, vec![1, 2]);
        assert_eq!(blocks[1].start, 10);
    }

    #[test]
    fn splits_block_when_max_size_exceeded() {
        let tags = vec![tag(1, 0, 100), tag(2, 100, 100)];
        let refs: Vec<&Tag> = tags.iter().collect();
        let blocks = plan_blocks(&refs, 8, 128);
        assert_eq!(blocks.len(), 2);
    }

    #[test]
    fn separates_by_device_unit_and_channel() {
        let mut t2 = tag(2, 0, 1);
        t2.device_id = 2;
        let tags = vec![tag(1, 0, 1), t2];
        let refs: Vec<&Tag> = tags.iter().collect();
        let blocks = plan_blocks(&refs, 4, 128);
        assert_eq!(blocks.len(), 2);
    }

}
