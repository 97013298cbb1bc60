//! Modbus read-request framing for TCP (MBAP) and RTU-over-TCP (CRC).

use thiserror::Error;

use crate::config::RegisterKind;

pub const MBAP_HEADER_LEN: usize = 7;
pub const MODBUS_PROTOCOL_ID: u16 = 0;
pub const EXCEPTION_FLAG: u8 = 0x80;

/// Largest PDU a Modbus ADU can carry.
pub const MAX_PDU_SIZE: usize = 253;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("device exception 0x{code:02x} for function 0x{function:02x}")]
    Exception { function: u8, code: u8 },

    #[error("CRC mismatch: computed 0x{computed:04x}, received 0x{received:04x}")]
    Crc { computed: u16, received: u16 },

    #[error("unexpected function code 0x{found:02x} (expected 0x{expected:02x})")]
    FunctionMismatch { expected: u8, found: u8 },

    #[error("transaction id {found} does not match request {expected}")]
    TransactionMismatch { expected: u16, found: u16 },

    #[error("unit id {found} does not match request {expected}")]
    UnitMismatch { expected: u8, found: u8 },

    #[error("malformed frame: {0}")]
    Malformed(&'static str),
}

pub fn function_code(kind: RegisterKind) -> u8 {
    match kind {
        RegisterKind::Holding => 0x03,
        RegisterKind::Input => 0x04,
    }
}

/// MBAP header of a Modbus TCP frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MbapHeader {
    pub transaction_id: u16,
    pub protocol_id: u16,
    /// Byte count of unit id plus PDU.
    pub length: u16,
    pub unit_id: u8,
}

impl MbapHeader {
    pub fn parse(bytes: &[u8; MBAP_HEADER_LEN]) -> Result<Self, FrameError> {
        let header = Self {
            transaction_id: u16::from_be_bytes([bytes[0], bytes[1]]),
            protocol_id: u16::from_be_bytes([bytes[2], bytes[3]]),
            length: u16::from_be_bytes([bytes[4], bytes[5]]),
            unit_id: bytes[6],
        };
        if header.protocol_id != MODBUS_PROTOCOL_ID {
            return Err(FrameError::Malformed("non-Modbus protocol id"));
        }
        if header.length < 2 || usize::from(header.length) > MAX_PDU_SIZE + 1 {
            return Err(FrameError::Malformed("MBAP length out of range"));
        }
        Ok(header)
    }

    /// PDU bytes following the header.
    pub fn pdu_len(&self) -> usize {
        usize::from(self.length) - 1
    }
}

fn read_pdu(kind: RegisterKind, address: u16, quantity: u16) -> [u8; 5] {
    let [a_hi, a_lo] = address.to_be_bytes();
    let [q_hi, q_lo] = quantity.to_be_bytes();
    [function_code(kind), a_hi, a_lo, q_hi, q_lo]
}

/// Modbus TCP read request.
pub fn encode_tcp_request(
    transaction_id: u16,
    unit_id: u8,
    kind: RegisterKind,
    address: u16,
    quantity: u16,
) -> Vec<u8> {
    let pdu = read_pdu(kind, address, quantity);
    let mut frame = Vec::with_capacity(MBAP_HEADER_LEN + pdu.len());
    frame.extend_from_slice(&transaction_id.to_be_bytes());
    frame.extend_from_slice(&MODBUS_PROTOCOL_ID.to_be_bytes());
    frame.extend_from_slice(&(pdu.len() as u16 + 1).to_be_bytes());
    frame.push(unit_id);
    frame.extend_from_slice(&pdu);
    frame
}

/// RTU read request with trailing CRC, for RTU-over-TCP gateways.
pub fn encode_rtu_request(slave_id: u8, kind: RegisterKind, address: u16, quantity: u16) -> Vec<u8> {
    let mut frame = Vec::with_capacity(8);
    frame.push(slave_id);
    frame.extend_from_slice(&read_pdu(kind, address, quantity));
    let crc = crc16(&frame);
    frame.extend_from_slice(&crc.to_le_bytes());
    frame
}

/// CRC-16/MODBUS (init 0xFFFF, reflected polynomial 0xA001).
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for byte in data {
        crc ^= u16::from(*byte);
        for _ in 0..8 {
            if crc & 0x0001 != 0 {
                crc = (crc >> 1) ^ 0xA001;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}

/// Verify an RTU frame's CRC and slave id; returns the PDU.
pub fn check_rtu_frame(frame: &[u8], slave_id: u8) -> Result<&[u8], FrameError> {
    if frame.len() < 5 {
        return Err(FrameError::Malformed("RTU frame too short"));
    }
    let (body, tail) = frame.split_at(frame.len() - 2);
    let received = u16::from_le_bytes([tail[0], tail[1]]);
    let computed = crc16(body);
    if received != computed {
        return Err(FrameError::Crc { computed, received });
    }
    if body[0] != slave_id {
        return Err(FrameError::UnitMismatch {
            expected: slave_id,
            found: body[0],
        });
    }
    Ok(&body[1..])
}

/// Extract register bytes from a read response PDU.
pub fn parse_read_response(kind: RegisterKind, quantity: u16, pdu: &[u8]) -> Result<Vec<u8>, FrameError> {
    let expected = function_code(kind);
    let Some(&function) = pdu.first() else {
        return Err(FrameError::Malformed("empty PDU"));
    };

    if function == expected | EXCEPTION_FLAG {
        let code = pdu.get(1).copied().ok_or(FrameError::Malformed("truncated exception"))?;
        return Err(FrameError::Exception { function: expected, code });
    }
    if function != expected {
        return Err(FrameError::FunctionMismatch {
            expected,
            found: function,
        });
    }

    let count = usize::from(*pdu.get(1).ok_or(FrameError::Malformed("missing byte count"))?);
    if count != usize::from(quantity) * 2 {
        return Err(FrameError::Malformed("byte count does not match quantity"));
    }
    let data = pdu
        .get(2..2 + count)
        .ok_or(FrameError::Malformed("register data truncated"))?;
    Ok(data.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc_matches_reference_vector() {
        let crc = crc16(&[0x01, 0x03, 0x00, 0x00, 0x00, 0x0A]);
        assert_eq!(crc.to_le_bytes(), [0xC5, 0xCD]);
    }

    #[test]
    fn rtu_request_carries_crc() {
        let frame = encode_rtu_request(1, RegisterKind::Holding, 0, 10);
        assert_eq!(frame, vec![0x01, 0x03, 0x00, 0x00, 0x00, 0x0A, 0xC5, 0xCD]);
    }

    #[test]
    fn tcp_request_layout() {
        let frame = encode_tcp_request(0x0102, 7, RegisterKind::Input, 1024, 8);
        assert_eq!(
            frame,
            vec![0x01, 0x02, 0x00, 0x00, 0x00, 0x06, 0x07, 0x04, 0x04, 0x00, 0x00, 0x08]
        );

        let header = MbapHeader::parse(&[0x01, 0x02, 0x00, 0x00, 0x00, 0x06, 0x07]).unwrap();
        assert_eq!(header.transaction_id, 0x0102);
        assert_eq!(header.pdu_len(), 5);
    }

    #[test]
    fn read_response_and_exception() {
        let data = parse_read_response(RegisterKind::Holding, 2, &[0x03, 0x04, b'P', b'D', b'U', 0]).unwrap();
        assert_eq!(data, b"PDU\0");

        let err = parse_read_response(RegisterKind::Input, 8, &[0x84, 0x02]).unwrap_err();
        assert_eq!(err, FrameError::Exception { function: 0x04, code: 0x02 });

        assert!(parse_read_response(RegisterKind::Input, 2, &[0x04, 0x04, 1, 2]).is_err());
    }

    #[test]
    fn rtu_frame_verification() {
        let mut frame = vec![0x01, 0x03, 0x02, 0x00, 0x2A];
        let crc = crc16(&frame);
        frame.extend_from_slice(&crc.to_le_bytes());
        assert_eq!(check_rtu_frame(&frame, 1).unwrap(), &[0x03, 0x02, 0x00, 0x2A]);
        assert!(matches!(check_rtu_frame(&frame, 2), Err(FrameError::UnitMismatch { .. })));

        let last = frame.len() - 1;
        frame[last] ^= 0xFF;
        assert!(matches!(check_rtu_frame(&frame, 1), Err(FrameError::Crc { .. })));
    }
}
