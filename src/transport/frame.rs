//! MBAP header framing and PDU construction shared by the TCP and UDP
//! transports, grounded on `ModbusTcpClient::build_mbap`/`parse_mbap` and
//! `read`/`write_single`/`write_multiple` in `protocol/modbus.rs`.

use crate::error::{PollerError, Result};
use crate::transport::function_code as fc;
use std::sync::atomic::{AtomicU16, Ordering};

/// 7-byte MBAP header: transaction id, protocol id (always 0), length
/// (unit id + PDU), unit id.
pub struct Mbap {
    pub transaction_id: u16,
    pub unit_id: u8,
}

pub fn build_mbap(transaction_id: u16, unit_id: u8, pdu_len: usize) -> [u8; 7] {
    let length = (pdu_len + 1) as u16;
    let mut header = [0u8; 7];
    header[0..2].copy_from_slice(&transaction_id.to_be_bytes());
    header[2..4].copy_from_slice(&0u16.to_be_bytes());
    header[4..6].copy_from_slice(&length.to_be_bytes());
    header[6] = unit_id;
    header
}

pub fn parse_mbap(buf: &[u8]) -> Result<(Mbap, usize)> {
    if buf.len() < 7 {
        return Err(PollerError::InvalidResponse {
            device: "unknown".into(),
            reason: "response shorter than MBAP header".into(),
        });
    }
    let transaction_id = u16::from_be_bytes([buf[0], buf[1]]);
    let length = u16::from_be_bytes([buf[4], buf[5]]) as usize;
    let unit_id = buf[6];
    Ok((Mbap { transaction_id, unit_id }, length.saturating_sub(1)))
}

/// Monotonic per-connection transaction id source, never emitting 0 so a
/// stray all-zero frame is never mistaken for a real response.
pub struct TransactionCounter(AtomicU16);

impl TransactionCounter {
    pub fn new() -> Self {
        Self(AtomicU16::new(1))
    }

    pub fn next(&self) -> u16 {
        loop {
            let id = self.0.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return id;
            }
        }
    }
}

impl Default for TransactionCounter {
    fn default() -> Self {
        Self::new()
    }
}

pub fn build_read_pdu(function_code: u8, address: u16, count: u16) -> Vec<u8> {
    let mut pdu = Vec::with_capacity(5);
    pdu.push(function_code);
    pdu.extend_from_slice(&address.to_be_bytes());
    pdu.extend_from_slice(&count.to_be_bytes());
    pdu
}

pub fn build_write_registers_pdu(address: u16, values: &[u16]) -> Vec<u8> {
    if values.len() == 1 {
        let mut pdu = Vec::with_capacity(5);
        pdu.push(fc::WRITE_SINGLE_REGISTER);
        pdu.extend_from_slice(&address.to_be_bytes());
        pdu.extend_from_slice(&values[0].to_be_bytes());
        return pdu;
    }
    let mut pdu = Vec::with_capacity(6 + values.len() * 2);
    pdu.push(fc::WRITE_MULTIPLE_REGISTERS);
    pdu.extend_from_slice(&address.to_be_bytes());
    pdu.extend_from_slice(&(values.len() as u16).to_be_bytes());
    pdu.push((values.len() * 2) as u8);
    for v in values {
        pdu.extend_from_slice(&v.to_be_bytes());
    }
    pdu
}

pub fn build_write_coils_pdu(address: u16, values: &[bool]) -> Vec<u8> {
    if values.len() == 1 {
        let mut pdu = Vec::with_capacity(5);
        pdu.push(fc::WRITE_SINGLE_COIL);
        pdu.extend_from_slice(&address.to_be_bytes());
        pdu.extend_from_slice(&if values[0] { 0xFF00u16 } else { 0x0000u16 }.to_be_bytes());
        return pdu;
    }
    let byte_count = values.len().div_ceil(8);
    let mut packed = vec![0u8; byte_count];
    for (i, v) in values.iter().enumerate() {
        if *v {
            packed[i / 8] |= 1 << (i % 8);
        }
    }
    let mut pdu = Vec::with_capacity(6 + byte_count);
    pdu.push(fc::WRITE_MULTIPLE_COILS);
    pdu.extend_from_slice(&address.to_be_bytes());
    pdu.extend_from_slice(&(values.len() as u16).to_be_bytes());
    pdu.push(byte_count as u8);
    pdu.extend_from_slice(&packed);
    pdu
}

pub fn build_mask_write_register_pdu(address: u16, and_mask: u16, or_mask: u16) -> Vec<u8> {
    let mut pdu = Vec::with_capacity(7);
    pdu.push(fc::MASK_WRITE_REGISTER);
    pdu.extend_from_slice(&address.to_be_bytes());
    pdu.extend_from_slice(&and_mask.to_be_bytes());
    pdu.extend_from_slice(&or_mask.to_be_bytes());
    pdu
}

/// Parses a read response PDU into raw register words (holding/input).
pub fn parse_read_registers_response(device: &str, pdu: &[u8], expected_count: u16) -> Result<Vec<u16>> {
    check_exception(device, pdu)?;
    if pdu.len() < 2 {
        return Err(PollerError::InvalidResponse {
            device: device.into(),
            reason: "truncated read response".into(),
        });
    }
    let byte_count = pdu[1] as usize;
    let words = pdu[2..]
        .chunks_exact(2)
        .map(|c| u16::from_be_bytes([c[0], c[1]]))
        .collect::<Vec<_>>();
    if byte_count != words.len() * 2 || words.len() != expected_count as usize {
        return Err(PollerError::InvalidResponse {
            device: device.into(),
            reason: format!(
                "register count mismatch: expected {expected_count}, got {}",
                words.len()
            ),
        });
    }
    Ok(words)
}

/// Parses a read response PDU into raw bit values (coil/discrete input).
pub fn parse_read_bits_response(device: &str, pdu: &[u8], expected_count: u16) -> Result<Vec<bool>> {
    check_exception(device, pdu)?;
    if pdu.len() < 2 {
        return Err(PollerError::InvalidResponse {
            device: device.into(),
            reason: "truncated read response".into(),
        });
    }
    let byte_count = pdu[1] as usize;
    let bytes = &pdu[2..2 + byte_count.min(pdu.len() - 2)];
    let mut bits = Vec::with_capacity(expected_count as usize);
    for i in 0..expected_count as usize {
        let byte = bytes.get(i / 8).copied().unwrap_or(0);
        bits.push((byte >> (i % 8)) & 1 == 1);
    }
    Ok(bits)
}

pub fn check_exception(device: &str, pdu: &[u8]) -> Result<()> {
    if pdu.is_empty() {
        return Err(PollerError::InvalidResponse {
            device: device.into(),
            reason: "empty response PDU".into(),
        });
    }
    let function_code = pdu[0];
    if function_code & 0x80 != 0 {
        let exception_code = pdu.get(1).copied().unwrap_or(0);
        return Err(PollerError::modbus_exception(device, function_code & 0x7F, exception_code));
    }
    Ok(())
}
