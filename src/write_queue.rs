//! Write queue drain.
//!
//! Applies pending `TagWriteRequest` rows for one device against its
//! transport. Grounded on `_process_writes`/`_write_value` in
//! `original_source/main/services/poll_devices.py`: a request that fails
//! for protocol/coercion reasons is marked processed exactly once and
//! never retried. A transport fault is different — it leaves the
//! request unmarked for retry next tick and propagates to the caller so
//! the connection can be torn down, rather than being folded into
//! `WriteOutcome`.

use std::collections::HashMap;

use tracing::warn;

use crate::codec;
use crate::error::{PollerError, Result};
use crate::model::{Channel, Id, Tag, TagWriteRequest, WriteOutcome};
use crate::transport::Transport;

/// Applies `requests` against `transport`, using `tags` to resolve each
/// request's target. Returns one outcome per request in the same order,
/// or propagates the first transport fault encountered — everything
/// already applied this tick is discarded along with it, matching how a
/// transport fault during a read aborts the rest of the device's tick.
pub async fn drain_writes(
    transport: &dyn Transport,
    tags: &HashMap<Id, Tag>,
    requests: &[TagWriteRequest],
) -> Result<Vec<(Id, WriteOutcome)>> {
    let mut outcomes = Vec::with_capacity(requests.len());
    for request in requests {
        let outcome = apply_write(transport, tags, request).await?;
        if let WriteOutcome::Rejected(ref err) = outcome {
            warn!(tag_id = request.tag_id, error = %err, "write request rejected");
        }
        outcomes.push((request.id, outcome));
    }
    Ok(outcomes)
}

/// Returns `Ok(WriteOutcome::Rejected(_))` for a terminal (non-recoverable)
/// fault — the request should still be marked processed. Returns `Err`
/// for a transport fault, so the caller can skip marking processed and
/// propagate it instead.
async fn apply_write(
    transport: &dyn Transport,
    tags: &HashMap<Id, Tag>,
    request: &TagWriteRequest,
) -> Result<WriteOutcome> {
    let tag = match tags.get(&request.tag_id) {
        Some(t) => t,
        None => {
            return Ok(WriteOutcome::Rejected(
                PollerError::TagNotFound { tag_id: request.tag_id }.to_string(),
            ))
        }
    };

    if !tag.channel.is_writable() || tag.restricted_write {
        return Ok(WriteOutcome::Rejected(
            PollerError::ReadOnlyTag {
                tag_id: tag.id,
                channel: format!("{:?}", tag.channel),
            }
            .to_string(),
        ));
    }

    let result = match tag.channel {
        Channel::Coil => write_coil(transport, tag, request).await,
        Channel::HoldingRegister if tag.is_bit_indexed() => {
            write_bit_indexed(transport, tag, request).await
        }
        Channel::HoldingRegister => write_register(transport, tag, request).await,
        Channel::DiscreteInput | Channel::InputRegister => unreachable!("filtered by is_writable"),
    };

    match result {
        Ok(()) => Ok(WriteOutcome::Accepted),
        Err(e) if e.is_recoverable() => Err(e),
        Err(e) => Ok(WriteOutcome::Rejected(e.to_string())),
    }
}

async fn write_coil(
    transport: &dyn Transport,
    tag: &Tag,
    request: &TagWriteRequest,
) -> crate::error::Result<()> {
    let bit = match &request.value {
        crate::model::TagValue::Bool(b) => *b,
        other => other.as_f64().map(|f| f != 0.0).unwrap_or(false),
    };
    transport.write_coils(tag.unit_id, tag.address, &[bit]).await
}

async fn write_bit_indexed(
    transport: &dyn Transport,
    tag: &Tag,
    request: &TagWriteRequest,
) -> crate::error::Result<()> {
    let bit = match &request.value {
        crate::model::TagValue::Bool(b) => *b,
        other => other.as_f64().map(|f| f != 0.0).unwrap_or(false),
    };
    let (and_mask, or_mask) = codec::set_bit_mask(tag.bit_index, bit);
    transport
        .mask_write_register(tag.unit_id, tag.address, and_mask, or_mask)
        .await
}

async fn write_register(
    transport: &dyn Transport,
    tag: &Tag,
    request: &TagWriteRequest,
) -> crate::error::Result<()> {
    let words = codec::encode(tag.data_type, &request.value, crate::model::WordOrder::Big)?;
    transport.write_registers(tag.unit_id, tag.address, &words).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DataType, TagValue, WordOrder};
    use crate::transport::tcp::{TcpConfig, TcpTransport};
    use chrono::{Duration, Utc};
    use std::time::Duration as StdDuration;
    use uuid::Uuid;

    fn make_tag(channel: Channel, data_type: DataType, restricted: bool) -> Tag {
        Tag {
            id: 1,
            external_id: Uuid::nil(),
            device_id: 1,
            unit_id: 1,
            channel,
            data_type,
            address: 10,
            bit_index: 2,
            read_amount: 1,
            restricted_write: restricted,
            history_interval: Duration::seconds(1),
            history_retention: Duration::zero(),
            current_value: None,
            last_updated: None,
            last_history_at: None,
            is_active: true,
        }
    }

    #[tokio::test]
    async fn read_only_channel_is_rejected_without_touching_transport() {
        let transport = TcpTransport::new(
            "d1",
            TcpConfig {
                remote_addr: "127.0.0.1:1".parse().unwrap(),
                connect_timeout: StdDuration::from_millis(10),
                op_timeout: StdDuration::from_millis(10),
            },
        );
        let mut tags = HashMap::new();
        tags.insert(1, make_tag(Channel::InputRegister, DataType::UInt16, false));
        let request = TagWriteRequest {
            id: 1,
            tag_id: 1,
            value: TagValue::UInt(5),
            timestamp: Utc::now(),
            processed: false,
        };
        let outcomes = drain_writes(&transport, &tags, &[request]).await.unwrap();
        assert!(matches!(outcomes[0].1, WriteOutcome::Rejected(_)));
    }

    #[tokio::test]
    async fn restricted_write_is_rejected() {
        let transport = TcpTransport::new(
            "d1",
            TcpConfig {
                remote_addr: "127.0.0.1:1".parse().unwrap(),
                connect_timeout: StdDuration::from_millis(10),
                op_timeout: StdDuration::from_millis(10),
            },
        );
        let mut tags = HashMap::new();
        tags.insert(1, make_tag(Channel::HoldingRegister, DataType::UInt16, true));
        let request = TagWriteRequest {
            id: 1,
            tag_id: 1,
            value: TagValue::UInt(5),
            timestamp: Utc::now(),
            processed: false,
        };
        let outcomes = drain_writes(&transport, &tags, &[request]).await.unwrap();
        assert!(matches!(outcomes[0].1, WriteOutcome::Rejected(_)));
    }

    #[test]
    fn word_order_is_ignored_for_single_word_types() {
        // sanity: encoding a UInt16 never depends on word order
        let a = codec::encode(DataType::UInt16, &TagValue::UInt(7), WordOrder::Big).unwrap();
        let b = codec::encode(DataType::UInt16, &TagValue::UInt(7), WordOrder::Little).unwrap();
        assert_eq!(a, b);
    }
}
