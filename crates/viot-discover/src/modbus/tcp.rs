//! Modbus transport over a tokio TCP stream.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::trace;

use super::frame::{self, FrameError, MbapHeader, EXCEPTION_FLAG, MBAP_HEADER_LEN};
use super::{ModbusClient, ModbusError, ModbusLink};
use crate::config::{ModbusMode, RegisterKind};
use crate::session::ModbusConn;

pub struct TcpModbusClient {
    timeout: Duration,
}

impl TcpModbusClient {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl ModbusClient for TcpModbusClient {
    async fn connect(&self, conn: &ModbusConn) -> Result<Box<dyn ModbusLink>, ModbusError> {
        let addr = SocketAddr::from((conn.ip, conn.port));
        let stream = tokio::time::timeout(self.timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| ModbusError::Timeout {
                ip: conn.ip,
                port: conn.port,
            })??;
        stream.set_nodelay(true)?;

        Ok(Box::new(TcpModbusLink {
            stream,
            conn: *conn,
            timeout: self.timeout,
            transaction_id: 0,
        }))
    }
}

pub struct TcpModbusLink {
    stream: TcpStream,
    conn: ModbusConn,
    timeout: Duration,
    transaction_id: u16,
}

impl TcpModbusLink {
    async fn exchange_tcp(
        &mut self,
        kind: RegisterKind,
        address: u16,
        quantity: u16,
    ) -> Result<Vec<u8>, ModbusError> {
        self.transaction_id = self.transaction_id.wrapping_add(1);
        let request = frame::encode_tcp_request(
            self.transaction_id,
            self.conn.slave_id,
            kind,
            address,
            quantity,
        );
        self.stream.write_all(&request).await?;

        let mut raw_header = [0u8; MBAP_HEADER_LEN];
        self.stream.read_exact(&mut raw_header).await?;
        let header = MbapHeader::parse(&raw_header)?;

        let mut pdu = vec![0u8; header.pdu_len()];
        self.stream.read_exact(&mut pdu).await?;

        if header.transaction_id != self.transaction_id {
            return Err(FrameError::TransactionMismatch {
                expected: self.transaction_id,
                found: header.transaction_id,
            }
            .into());
        }
        if header.unit_id != self.conn.slave_id {
            return Err(FrameError::UnitMismatch {
                expected: self.conn.slave_id,
                found: header.unit_id,
            }
            .into());
        }

        Ok(frame::parse_read_response(kind, quantity, &pdu)?)
    }

    async fn exchange_rtu(
        &mut self,
        kind: RegisterKind,
        address: u16,
        quantity: u16,
    ) -> Result<Vec<u8>, ModbusError> {
        let request = frame::encode_rtu_request(self.conn.slave_id, kind, address, quantity);
        self.stream.write_all(&request).await?;

        // slave + function, then either exception code or byte count.
        let mut response = vec![0u8; 3];
        self.stream.read_exact(&mut response).await?;

        let remaining = if response[1] & EXCEPTION_FLAG != 0 {
            2
        } else {
            usize::from(response[2]) + 2
        };
        let start = response.len();
        response.resize(start + remaining, 0);
        self.stream.read_exact(&mut response[start..]).await?;

        let pdu = frame::check_rtu_frame(&response, self.conn.slave_id)?;
        Ok(frame::parse_read_response(kind, quantity, pdu)?)
    }
}

#[async_trait]
impl ModbusLink for TcpModbusLink {
    async fn read_registers(
        &mut self,
        kind: RegisterKind,
        address: u16,
        quantity: u16,
    ) -> Result<Vec<u8>, ModbusError> {
        let timeout = self.timeout;
        let (ip, port) = (self.conn.ip, self.conn.port);
        let exchange = async {
            match self.conn.mode {
                ModbusMode::Tcp => self.exchange_tcp(kind, address, quantity).await,
                ModbusMode::RtuOverTcp => self.exchange_rtu(kind, address, quantity).await,
            }
        };

        tokio::time::timeout(timeout, exchange)
            .await
            .map_err(|_| ModbusError::Timeout { ip, port })?
    }

    async fn close(&mut self) {
        if let Err(e) = self.stream.shutdown().await {
            trace!(ip = %self.conn.ip, port = self.conn.port, error = %e, "Modbus shutdown failed");
        }
    }
}
