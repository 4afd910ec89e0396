//! UDP MODBUS transport. Same MBAP framing as TCP; UDP's lack of a
//! stream means each request/response is a single datagram, so there is
//! no partial-read handling to speak of.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tracing::debug;

use super::frame::{
    build_mask_write_register_pdu, build_mbap, build_read_pdu, build_write_coils_pdu,
    build_write_registers_pdu, parse_mbap, parse_read_bits_response, parse_read_registers_response,
    TransactionCounter,
};
use super::Transport;
use crate::error::{PollerError, Result};

#[derive(Debug, Clone)]
pub struct UdpConfig {
    pub remote_addr: SocketAddr,
    pub op_timeout: Duration,
}

pub struct UdpTransport {
    config: UdpConfig,
    device_name: String,
    socket: Mutex<Option<UdpSocket>>,
    transaction_ids: TransactionCounter,
}

impl UdpTransport {
    pub fn new(device_name: impl Into<String>, config: UdpConfig) -> Self {
        Self {
            config,
            device_name: device_name.into(),
            socket: Mutex::new(None),
            transaction_ids: TransactionCounter::new(),
        }
    }

    async fn send_receive(&self, unit_id: u8, pdu: Vec<u8>) -> Result<Vec<u8>> {
        let transaction_id = self.transaction_ids.next();
        let header = build_mbap(transaction_id, unit_id, pdu.len());
        let mut frame = Vec::with_capacity(header.len() + pdu.len());
        frame.extend_from_slice(&header);
        frame.extend_from_slice(&pdu);

        let guard = self.socket.lock().await;
        let socket = guard.as_ref().ok_or_else(|| PollerError::NotConnected {
            device: self.device_name.clone(),
        })?;

        tokio::time::timeout(self.config.op_timeout, socket.send(&frame))
            .await
            .map_err(|_| PollerError::ResponseTimeout {
                device: self.device_name.clone(),
                timeout_ms: self.config.op_timeout.as_millis() as u64,
            })?
            .map_err(PollerError::Io)?;

        let mut buf = [0u8; 260];
        let n = tokio::time::timeout(self.config.op_timeout, socket.recv(&mut buf))
            .await
            .map_err(|_| PollerError::ResponseTimeout {
                device: self.device_name.clone(),
                timeout_ms: self.config.op_timeout.as_millis() as u64,
            })?
            .map_err(PollerError::Io)?;

        if n < 7 {
            return Err(PollerError::InvalidResponse {
                device: self.device_name.clone(),
                reason: "datagram shorter than MBAP header".into(),
            });
        }
        let (mbap, pdu_len) = parse_mbap(&buf[..n])?;
        if mbap.transaction_id != transaction_id {
            return Err(PollerError::TransactionMismatch {
                device: self.device_name.clone(),
                expected: transaction_id,
                actual: mbap.transaction_id,
            });
        }
        Ok(buf[7..7 + pdu_len.min(n - 7)].to_vec())
    }
}

#[async_trait]
impl Transport for UdpTransport {
    async fn connect(&self) -> Result<()> {
        let mut guard = self.socket.lock().await;
        if guard.is_some() {
            return Ok(());
        }
        debug!(device = %self.device_name, addr = %self.config.remote_addr, "connecting (udp)");
        let socket = UdpSocket::bind("0.0.0.0:0")
            .await
            .map_err(PollerError::Io)?;
        socket
            .connect(self.config.remote_addr)
            .await
            .map_err(|source| PollerError::ConnectionFailed {
                device: self.device_name.clone(),
                source,
            })?;
        *guard = Some(socket);
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        self.socket.lock().await.is_some()
    }

    async fn disconnect(&self) {
        *self.socket.lock().await = None;
    }

    async fn read_registers(
        &self,
        unit_id: u8,
        function_code: u8,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>> {
        let pdu = build_read_pdu(function_code, address, count);
        let response = self.send_receive(unit_id, pdu).await?;
        parse_read_registers_response(&self.device_name, &response, count)
    }

    async fn read_bits(
        &self,
        unit_id: u8,
        function_code: u8,
        address: u16,
        count: u16,
    ) -> Result<Vec<bool>> {
        let pdu = build_read_pdu(function_code, address, count);
        let response = self.send_receive(unit_id, pdu).await?;
        parse_read_bits_response(&self.device_name, &response, count)
    }

    async fn write_coils(&self, unit_id: u8, address: u16, values: &[bool]) -> Result<()> {
        let pdu = build_write_coils_pdu(address, values);
        let response = self.send_receive(unit_id, pdu).await?;
        super::frame::check_exception(&self.device_name, &response)
    }

    async fn write_registers(&self, unit_id: u8, address: u16, values: &[u16]) -> Result<()> {
        let pdu = build_write_registers_pdu(address, values);
        let response = self.send_receive(unit_id, pdu).await?;
        super::frame::check_exception(&self.device_name, &response)
    }

    async fn mask_write_register(
        &self,
        unit_id: u8,
        address: u16,
        and_mask: u16,
        or_mask: u16,
    ) -> Result<()> {
        let pdu = build_mask_write_register_pdu(address, and_mask, or_mask);
        let response = self.send_receive(unit_id, pdu).await?;
        super::frame::check_exception(&self.device_name, &response)
    }
}
