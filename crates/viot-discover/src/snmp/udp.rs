//! SNMP transport over a tokio UDP socket.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tracing::{debug, trace};

use super::ber::{self, SnmpValue, PDU_RESPONSE};
use super::{SnmpClient, SnmpError};
use crate::session::SnmpConn;

const MAX_DATAGRAM: usize = 65_535;

/// One socket per request; timeouts and retries apply per request.
pub struct UdpSnmpClient {
    timeout: Duration,
    retries: u32,
    next_request_id: AtomicI32,
}

impl UdpSnmpClient {
    pub fn new(timeout: Duration, retries: u32) -> Self {
        Self {
            timeout,
            retries,
            next_request_id: AtomicI32::new(seed_request_id()),
        }
    }

    fn request_id(&self) -> i32 {
        // Keep ids positive; some agents mishandle negative request ids.
        self.next_request_id.fetch_add(1, Ordering::Relaxed) & 0x7FFF_FFFF
    }

    async fn exchange(
        &self,
        socket: &UdpSocket,
        packet: &[u8],
        request_id: i32,
    ) -> Result<ber::Message, SnmpError> {
        socket.send(packet).await?;

        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            let len = socket.recv(&mut buf).await?;
            let message = match ber::decode_message(&buf[..len]) {
                Ok(m) => m,
                Err(e) => {
                    trace!(error = %e, "Discarding undecodable datagram");
                    continue;
                }
            };

            // Stale replies from an earlier attempt carry a different id.
            if message.pdu_type != PDU_RESPONSE || message.request_id != request_id {
                trace!(
                    request_id = message.request_id,
                    expected = request_id,
                    "Discarding unrelated datagram"
                );
                continue;
            }

            return Ok(message);
        }
    }
}

#[async_trait]
impl SnmpClient for UdpSnmpClient {
    async fn get(
        &self,
        conn: &SnmpConn,
        oids: &[String],
    ) -> Result<Vec<(String, SnmpValue)>, SnmpError> {
        let target = SocketAddr::from((conn.ip, conn.port));
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect(target).await?;

        let request_id = self.request_id();
        let packet = ber::encode_get_request(
            conn.version.wire_value(),
            &conn.community,
            request_id,
            oids,
        )?;

        for attempt in 0..=self.retries {
            match tokio::time::timeout(self.timeout, self.exchange(&socket, &packet, request_id))
                .await
            {
                Ok(Ok(message)) => {
                    if message.error_status != 0 {
                        return Err(SnmpError::ErrorStatus {
                            status: message.error_status,
                            index: message.error_index,
                        });
                    }
                    return Ok(message.varbinds);
                }
                Ok(Err(e)) => return Err(e),
                Err(_) => {
                    debug!(ip = %conn.ip, attempt, "SNMP request timed out");
                }
            }
        }

        Err(SnmpError::Timeout {
            ip: conn.ip,
            attempts: self.retries + 1,
        })
    }
}

fn seed_request_id() -> i32 {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(1);
    (nanos & 0x3FFF_FFFF) as i32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SnmpVersion;
    use crate::snmp::ber::Message;
    use std::net::Ipv4Addr;

    /// Answer one GetRequest with a fixed sysDescr, after first sending a
    /// reply carrying the wrong request id.
    async fn spawn_agent(descr: &'static [u8]) -> u16 {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = socket.local_addr().unwrap().port();

        tokio::spawn(async move {
            let mut buf = vec![0u8; 2048];
            let (len, peer) = socket.recv_from(&mut buf).await.unwrap();
            let request = ber::decode_message(&buf[..len]).unwrap();

            let mut reply = Message {
                pdu_type: PDU_RESPONSE,
                request_id: request.request_id.wrapping_add(1),
                varbinds: vec![(
                    request.varbinds[0].0.clone(),
                    SnmpValue::OctetString(b"stale".to_vec()),
                )],
                ..request.clone()
            };
            let stale = ber::encode_message(&reply).unwrap();
            socket.send_to(&stale, peer).await.unwrap();

            reply.request_id = request.request_id;
            reply.varbinds[0].1 = SnmpValue::OctetString(descr.to_vec());
            let good = ber::encode_message(&reply).unwrap();
            socket.send_to(&good, peer).await.unwrap();
        });

        port
    }

    fn conn(port: u16) -> SnmpConn {
        SnmpConn {
            ip: Ipv4Addr::LOCALHOST,
            port,
            community: "public".to_string(),
            version: SnmpVersion::V2c,
        }
    }

    #[tokio::test]
    async fn get_returns_matching_response() {
        let port = spawn_agent(b"Vertiv 6PS56").await;
        let client = UdpSnmpClient::new(Duration::from_secs(2), 0);

        let binds = client
            .get(&conn(port), &["1.3.6.1.2.1.1.1.0".to_string()])
            .await
            .unwrap();

        assert_eq!(binds.len(), 1);
        assert_eq!(binds[0].1, SnmpValue::OctetString(b"Vertiv 6PS56".to_vec()));
    }

    #[tokio::test]
    async fn silent_agent_times_out_after_retries() {
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = silent.local_addr().unwrap().port();
        let client = UdpSnmpClient::new(Duration::from_millis(50), 1);

        let err = client
            .get(&conn(port), &["1.3.6.1.2.1.1.1.0".to_string()])
            .await
            .unwrap_err();

        assert!(matches!(err, SnmpError::Timeout { attempts: 2, .. }));
        drop(silent);
    }
}
