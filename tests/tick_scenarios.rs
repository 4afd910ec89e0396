//! End-to-end scenarios spanning block planning, decoding, change
//! detection, and bit-indexed writes against a scripted transport —
//! the multi-module flow a single device tick goes through between a
//! wire read and a persisted, change-flagged value.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Duration;
use modbus_poller::block::plan_blocks;
use modbus_poller::codec::set_bit_mask;
use modbus_poller::error::Result;
use modbus_poller::evaluator::read_block;
use modbus_poller::model::{Channel, DataType, Id, Tag, TagValue, WordOrder};
use modbus_poller::transport::Transport;
use modbus_poller::write_queue::drain_writes;
use uuid::Uuid;

/// A transport whose register contents are fixed in advance and whose
/// writes are recorded for assertions, standing in for a real MODBUS
/// device across a scripted tick.
struct ScriptedTransport {
    registers: Mutex<HashMap<u16, u16>>,
    mask_writes: Mutex<Vec<(u16, u16, u16)>>,
    register_writes: Mutex<Vec<(u16, Vec<u16>)>>,
}

impl ScriptedTransport {
    fn new(registers: HashMap<u16, u16>) -> Self {
        Self {
            registers: Mutex::new(registers),
            mask_writes: Mutex::new(Vec::new()),
            register_writes: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn connect(&self) -> Result<()> {
        Ok(())
    }
    async fn is_connected(&self) -> bool {
        true
    }
    async fn disconnect(&self) {}

    async fn read_registers(&self, _unit_id: u8, _fc: u8, address: u16, count: u16) -> Result<Vec<u16>> {
        let regs = self.registers.lock().unwrap();
        Ok((address..address + count).map(|a| *regs.get(&a).unwrap_or(&0)).collect())
    }

    async fn read_bits(&self, _unit_id: u8, _fc: u8, _address: u16, count: u16) -> Result<Vec<bool>> {
        Ok(vec![false; count as usize])
    }

    async fn write_coils(&self, _unit_id: u8, _address: u16, _values: &[bool]) -> Result<()> {
        Ok(())
    }

    async fn write_registers(&self, _unit_id: u8, address: u16, values: &[u16]) -> Result<()> {
        self.register_writes.lock().unwrap().push((address, values.to_vec()));
        let mut regs = self.registers.lock().unwrap();
        for (i, v) in values.iter().enumerate() {
            regs.insert(address + i as u16, *v);
        }
        Ok(())
    }

    async fn mask_write_register(&self, _unit_id: u8, address: u16, and_mask: u16, or_mask: u16) -> Result<()> {
        self.mask_writes.lock().unwrap().push((address, and_mask, or_mask));
        let mut regs = self.registers.lock().unwrap();
        let current = regs.entry(address).or_insert(0);
        *current = (*current & and_mask) | or_mask;
        Ok(())
    }
}

fn base_tag(id: Id, address: u16, data_type: DataType, bit_index: u8) -> Tag {
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
        current_value: None,
        last_updated: None,
        last_history_at: None,
        is_active: true,
    }
}

#[tokio::test]
async fn coalesced_block_decodes_mixed_types_and_flags_changes() {
    // Three tags close enough together to coalesce into one block: a
    // uint16 at 0, a float32 spanning 1-2 (big-endian), and a bit-indexed
    // bool packed into bit 3 of word 3.
    let mut registers = HashMap::new();
    registers.insert(0, 42u16);
    registers.insert(1, 0x449A); // high word of 1234.5f32
    registers.insert(2, 0x5000);
    registers.insert(3, 0b0000_1000); // bit 3 set

    let transport = ScriptedTransport::new(registers);

    let mut t0 = base_tag(1, 0, DataType::UInt16, 0);
    t0.current_value = Some(TagValue::UInt(42)); // unchanged
    let t1 = base_tag(2, 1, DataType::Float32, 0);
    let mut t2 = base_tag(3, 3, DataType::Bool, 3);
    t2.current_value = Some(TagValue::Bool(false)); // will flip to true

    let tags = vec![t0, t1, t2];
    let tag_refs: Vec<&Tag> = tags.iter().collect();
    let blocks = plan_blocks(&tag_refs, 8, 128);
    assert_eq!(blocks.len(), 1, "tags should coalesce into a single block");

    let tag_map: HashMap<Id, Tag> = tags.into_iter().map(|t| (t.id, t)).collect();
    let results = read_block(&transport, WordOrder::Big, &blocks[0], &tag_map)
        .await
        .unwrap();

    let by_id: HashMap<Id, _> = results.into_iter().map(|r| (r.tag_id, r)).collect();
    assert!(!by_id[&1].changed);
    assert_eq!(by_id[&1].value, TagValue::UInt(42));

    match &by_id[&2].value {
        TagValue::Float(f) => assert!((f - 1234.5).abs() < 1e-3),
        other => panic!("unexpected value {other:?}"),
    }

    assert!(by_id[&3].changed);
    assert_eq!(by_id[&3].value, TagValue::Bool(true));
}

#[tokio::test]
async fn bit_indexed_write_only_disturbs_its_own_bit() {
    let mut registers = HashMap::new();
    registers.insert(5, 0b1010_1010_1010_1010u16);
    let transport = ScriptedTransport::new(registers);

    let mut tag = base_tag(1, 5, DataType::Bool, 2);
    tag.restricted_write = false;
    let mut tags = HashMap::new();
    tags.insert(1, tag);

    let request = modbus_poller::model::TagWriteRequest {
        id: 1,
        tag_id: 1,
        value: TagValue::Bool(true),
        timestamp: chrono::Utc::now(),
        processed: false,
    };

    let outcomes = drain_writes(&transport, &tags, &[request]).await.unwrap();
    assert!(matches!(outcomes[0].1, modbus_poller::model::WriteOutcome::Accepted));

    let (address, and_mask, or_mask) = transport.mask_writes.lock().unwrap()[0];
    assert_eq!(address, 5);
    let (expected_and, expected_or) = set_bit_mask(2, true);
    assert_eq!(and_mask, expected_and);
    assert_eq!(or_mask, expected_or);

    let resulting_word = transport.registers.lock().unwrap()[&5];
    // bit 2 now set, every other bit untouched.
    assert_eq!(resulting_word & !0b100, 0b1010_1010_1010_1010u16 & !0b100);
    assert_eq!(resulting_word & 0b100, 0b100);
}

#[tokio::test]
async fn restricted_write_never_reaches_the_transport() {
    let transport = ScriptedTransport::new(HashMap::new());
    let mut tag = base_tag(1, 0, DataType::UInt16, 0);
    tag.restricted_write = true;
    let mut tags = HashMap::new();
    tags.insert(1, tag);

    let request = modbus_poller::model::TagWriteRequest {
        id: 1,
        tag_id: 1,
        value: TagValue::UInt(99),
        timestamp: chrono::Utc::now(),
        processed: false,
    };
    let outcomes = drain_writes(&transport, &tags, &[request]).await.unwrap();
    assert!(matches!(outcomes[0].1, modbus_poller::model::WriteOutcome::Rejected(_)));
    assert!(transport.register_writes.lock().unwrap().is_empty());
}
