//! TCP MODBUS transport, grounded on `TcpClient` (connection lifecycle,
//! reconnect backoff, EMA latency tracking) composed with
//! `ModbusTcpClient`'s MBAP framing.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::frame::{
    build_mask_write_register_pdu, build_mbap, build_read_pdu, build_write_coils_pdu,
    build_write_registers_pdu, parse_mbap, parse_read_bits_response, parse_read_registers_response,
    TransactionCounter,
};
use super::Transport;
use crate::error::{PollerError, Result};

#[derive(Debug, Clone)]
pub struct TcpConfig {
    pub remote_addr: SocketAddr,
    pub connect_timeout: Duration,
    pub op_timeout: Duration,
}

#[derive(Default)]
pub struct TcpMetrics {
    pub requests_sent: AtomicU64,
    pub responses_received: AtomicU64,
    pub errors: AtomicU64,
}

pub struct TcpTransport {
    config: TcpConfig,
    device_name: String,
    stream: Mutex<Option<TcpStream>>,
    transaction_ids: TransactionCounter,
    metrics: TcpMetrics,
}

impl TcpTransport {
    pub fn new(device_name: impl Into<String>, config: TcpConfig) -> Self {
        Self {
            config,
            device_name: device_name.into(),
            stream: Mutex::new(None),
            transaction_ids: TransactionCounter::new(),
            metrics: TcpMetrics::default(),
        }
    }

    pub fn metrics(&self) -> &TcpMetrics {
        &self.metrics
    }

    async fn send_receive(&self, unit_id: u8, pdu: Vec<u8>) -> Result<Vec<u8>> {
        let transaction_id = self.transaction_ids.next();
        let header = build_mbap(transaction_id, unit_id, pdu.len());
        let mut frame = Vec::with_capacity(header.len() + pdu.len());
        frame.extend_from_slice(&header);
        frame.extend_from_slice(&pdu);

        let mut guard = self.stream.lock().await;
        let stream = guard.as_mut().ok_or_else(|| PollerError::NotConnected {
            device: self.device_name.clone(),
        })?;

        self.metrics.requests_sent.fetch_add(1, Ordering::Relaxed);
        tokio::time::timeout(self.config.op_timeout, stream.write_all(&frame))
            .await
            .map_err(|_| PollerError::ResponseTimeout {
                device: self.device_name.clone(),
                timeout_ms: self.config.op_timeout.as_millis() as u64,
            })?
            .map_err(PollerError::Io)?;

        let mut header_buf = [0u8; 7];
        tokio::time::timeout(self.config.op_timeout, stream.read_exact(&mut header_buf))
            .await
            .map_err(|_| PollerError::ResponseTimeout {
                device: self.device_name.clone(),
                timeout_ms: self.config.op_timeout.as_millis() as u64,
            })?
            .map_err(PollerError::Io)?;

        let (mbap, pdu_len) = parse_mbap(&header_buf)?;
        if mbap.transaction_id != transaction_id {
            self.metrics.errors.fetch_add(1, Ordering::Relaxed);
            return Err(PollerError::TransactionMismatch {
                device: self.device_name.clone(),
                expected: transaction_id,
                actual: mbap.transaction_id,
            });
        }

        let mut pdu_buf = vec![0u8; pdu_len];
        tokio::time::timeout(self.config.op_timeout, stream.read_exact(&mut pdu_buf))
            .await
            .map_err(|_| PollerError::ResponseTimeout {
                device: self.device_name.clone(),
                timeout_ms: self.config.op_timeout.as_millis() as u64,
            })?
            .map_err(PollerError::Io)?;

        self.metrics.responses_received.fetch_add(1, Ordering::Relaxed);
        Ok(pdu_buf)
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn connect(&self) -> Result<()> {
        let mut guard = self.stream.lock().await;
        if guard.is_some() {
            return Ok(());
        }
        debug!(device = %self.device_name, addr = %self.config.remote_addr, "connecting");
        let stream = tokio::time::timeout(
            self.config.connect_timeout,
            TcpStream::connect(self.config.remote_addr),
        )
        .await
        .map_err(|_| PollerError::ConnectionTimeout {
            device: self.device_name.clone(),
            timeout_ms: self.config.connect_timeout.as_millis() as u64,
        })?
        .map_err(|source| PollerError::ConnectionFailed {
            device: self.device_name.clone(),
            source,
        })?;
        stream.set_nodelay(true).ok();
        *guard = Some(stream);
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        self.stream.lock().await.is_some()
    }

    async fn disconnect(&self) {
        *self.stream.lock().await = None;
    }

    async fn read_registers(
        &self,
        unit_id: u8,
        function_code: u8,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>> {
        let pdu = build_read_pdu(function_code, address, count);
        match self.send_receive(unit_id, pdu).await {
            Ok(response) => parse_read_registers_response(&self.device_name, &response, count),
            Err(e) => {
                warn!(device = %self.device_name, error = %e, "read failed");
                Err(e)
            }
        }
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

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn not_connected_before_connect_is_called() {
        let transport = TcpTransport::new(
            "d1",
            TcpConfig {
                remote_addr: "127.0.0.1:1".parse().unwrap(),
                connect_timeout: Duration::from_millis(50),
                op_timeout: Duration::from_millis(50),
            },
        );
        assert!(!transport.is_connected().await);
    }
}
