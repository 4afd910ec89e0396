//! Serial MODBUS RTU transport — declared but never constructed.
//!
//! `Device::protocol` can be set to `Protocol::Rtu` in stored
//! configuration, but the supervisor has no branch that builds an
//! `RtuTransport`; devices in this mode are simply never connected.
//! Mirrors the `GatewayStandard`/`GatewayPremium` stubs in
//! `gateway/mod.rs`.

#[cfg(feature = "modbus-rtu")]
pub struct RtuTransport {
    _private: (),
}

#[cfg(feature = "modbus-rtu")]
impl RtuTransport {
    /// Always fails to construct; the `serialport` dependency is pulled
    /// in by the feature flag but framing is not implemented.
    pub fn new() -> Result<Self, crate::error::PollerError> {
        Err(crate::error::PollerError::Internal(
            "RTU transport is not implemented".into(),
        ))
    }
}
