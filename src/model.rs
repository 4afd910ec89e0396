//! Persisted entity model.
//!
//! These are plain value structs keyed by stable identifiers, not an
//! object graph — cross-entity lookups go through the [`crate::persistence`]
//! store rather than pointers, per the ownership note in the data model.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::net::IpAddr;
use uuid::Uuid;

/// Opaque stable identifier for persisted rows.
pub type Id = i64;

// =============================================================================
// Dynamic value
// =============================================================================

/// A dynamically typed tag/trigger value.
///
/// Internally a tagged variant; serialized as plain JSON at the wire
/// boundary (untagged) so `current_value`/`trigger_value` round-trip as
/// the bare JSON scalar or array the external API expects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TagValue {
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    Text(String),
    Sequence(Vec<TagValue>),
}

impl TagValue {
    /// Numeric projection used for alarm comparisons and scaling; `None`
    /// for non-numeric variants (string, sequence, bool is excluded too —
    /// equality on bool is handled structurally).
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(v) => Some(*v as f64),
            Self::UInt(v) => Some(*v as f64),
            Self::Float(v) => Some(*v),
            _ => None,
        }
    }

    /// Structural equality, but numeric variants compare by value so an
    /// `Int(3)` decoded from a register equals a `Float(3.0)` trigger
    /// value deserialized from JSON.
    pub fn loosely_equals(&self, other: &Self) -> bool {
        match (self.as_f64(), other.as_f64()) {
            (Some(a), Some(b)) => a == b,
            _ => self == other,
        }
    }

    /// Ordering used by the greater/less-than alarm operators. Returns
    /// `None` when either side is non-numeric (the caller treats this as
    /// "not triggered", never an error).
    pub fn partial_compare(&self, other: &Self) -> Option<Ordering> {
        let (a, b) = (self.as_f64()?, other.as_f64()?);
        a.partial_cmp(&b)
    }
}

// =============================================================================
// Device
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
    /// Forward slot only; never constructed by the supervisor (see
    /// `transport::rtu`).
    Rtu,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WordOrder {
    #[default]
    Big,
    Little,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub id: Id,
    /// Unique, used as the key for the live connection map.
    pub alias: String,
    pub host: IpAddr,
    pub port: u16,
    pub protocol: Protocol,
    pub word_order: WordOrder,
    pub is_active: bool,
}

// =============================================================================
// Tag
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Coil,
    DiscreteInput,
    HoldingRegister,
    InputRegister,
}

impl Channel {
    /// MODBUS read function code for this channel.
    pub fn read_function_code(&self) -> u8 {
        match self {
            Self::Coil => 1,
            Self::DiscreteInput => 2,
            Self::HoldingRegister => 3,
            Self::InputRegister => 4,
        }
    }

    /// Whether values on this channel are single bits (coil channels) as
    /// opposed to 16-bit words (register channels).
    pub fn is_bit_channel(&self) -> bool {
        matches!(self, Self::Coil | Self::DiscreteInput)
    }

    /// Read-only channels reject write requests outright.
    pub fn is_read_only(&self) -> bool {
        matches!(self, Self::DiscreteInput | Self::InputRegister)
    }

    /// Whether this channel accepts operator writes at all (coils and
    /// holding registers do; discrete inputs and input registers never do).
    pub fn is_writable(&self) -> bool {
        !self.is_read_only()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    Bool,
    Int16,
    UInt16,
    Int32,
    UInt32,
    Int64,
    UInt64,
    Float32,
    Float64,
    String,
}

impl DataType {
    /// Number of 16-bit words needed per logical element of this type.
    pub fn words_per_element(&self) -> u16 {
        match self {
            Self::Bool | Self::Int16 | Self::UInt16 => 1,
            Self::Int32 | Self::UInt32 | Self::Float32 => 2,
            Self::Int64 | Self::UInt64 | Self::Float64 => 4,
            // String word count is computed from `read_amount`, not fixed
            // per element; callers use `Tag::read_count` instead.
            Self::String => 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tag {
    pub id: Id,
    pub external_id: Uuid,
    pub device_id: Id,
    pub unit_id: u8,
    pub channel: Channel,
    pub data_type: DataType,
    pub address: u16,
    pub bit_index: u8,
    pub read_amount: u16,
    pub restricted_write: bool,
    pub history_interval: Duration,
    pub history_retention: Duration,
    pub current_value: Option<TagValue>,
    pub last_updated: Option<DateTime<Utc>>,
    pub last_history_at: Option<DateTime<Utc>>,
    pub is_active: bool,
}

impl Tag {
    /// Number of 16-bit words (or bits, for coil channels) this tag
    /// occupies.
    pub fn read_count(&self) -> u16 {
        match self.data_type {
            DataType::String => self.read_amount.div_ceil(2),
            _ => self.data_type.words_per_element() * self.read_amount,
        }
    }

    /// A bool tag living on a register channel is addressed by
    /// `bit_index` within the containing word rather than occupying a
    /// whole register of its own.
    pub fn is_bit_indexed(&self) -> bool {
        self.data_type == DataType::Bool && !self.channel.is_bit_channel()
    }
}

// =============================================================================
// Write requests
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TagWriteRequest {
    pub id: Id,
    pub tag_id: Id,
    pub value: TagValue,
    pub timestamp: DateTime<Utc>,
    pub processed: bool,
}

/// Terminal disposition of a drained write request, recorded in-memory
/// only (the persisted schema still only has `processed`; see DESIGN.md
/// for the Open Question this resolves). Both variants are terminal —
/// the request is marked `processed` and never retried. A transport
/// fault during a write is not representable here: it propagates as a
/// `PollerError` instead, leaving the request's `processed` flag
/// untouched so it is retried next tick.
#[derive(Debug, Clone)]
pub enum WriteOutcome {
    Accepted,
    Rejected(String),
}

// =============================================================================
// History
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TagHistoryEntry {
    pub tag_id: Id,
    pub timestamp: DateTime<Utc>,
    pub value: Option<TagValue>,
}

// =============================================================================
// Alarms
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlarmOperator {
    Equals,
    GreaterThan,
    LessThan,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreatLevel {
    Low = 1,
    High = 2,
    Crit = 3,
}

impl ThreatLevel {
    pub fn priority(&self) -> u8 {
        *self as u8
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlarmConfig {
    pub id: Id,
    pub external_id: Uuid,
    pub tag_id: Id,
    pub operator: AlarmOperator,
    pub trigger_value: TagValue,
    pub threat_level: ThreatLevel,
    pub message: String,
    pub enabled: bool,
    pub notification_cooldown: Duration,
    pub last_notified: Option<DateTime<Utc>>,
}

impl AlarmConfig {
    /// Whether this config currently fires for `value`. Type mismatches
    /// (e.g. comparing a string tag against a numeric trigger with a
    /// relational operator) never error — they simply don't trigger.
    pub fn is_activation(&self, value: &TagValue) -> bool {
        match self.operator {
            AlarmOperator::Equals => value.loosely_equals(&self.trigger_value),
            AlarmOperator::GreaterThan => {
                matches!(value.partial_compare(&self.trigger_value), Some(Ordering::Greater))
            }
            AlarmOperator::LessThan => {
                matches!(value.partial_compare(&self.trigger_value), Some(Ordering::Less))
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivatedAlarm {
    pub id: Id,
    pub config_id: Id,
    pub timestamp: DateTime<Utc>,
    pub is_active: bool,
    pub resolved_at: Option<DateTime<Utc>>,
    pub acknowledged: bool,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub acknowledged_by: Option<Id>,
}

/// A user's opt-in to be notified when a particular alarm config fires.
/// Consumed only by the notification collaborator to pick recipients;
/// the core never sends anything itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlarmSubscription {
    pub id: Id,
    pub user_id: Id,
    pub alarm_config_id: Id,
    pub email_enabled: bool,
    pub sms_enabled: bool,
}

// =============================================================================
// Dashboards (out of scope beyond their tag-id surface)
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dashboard {
    pub id: Id,
    pub alias: String,
    pub title: String,
    pub owner_id: Id,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DashboardWidget {
    pub id: Id,
    pub external_id: Uuid,
    pub dashboard_id: Id,
    pub tag_id: Option<Id>,
}
