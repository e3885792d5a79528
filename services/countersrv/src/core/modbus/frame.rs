//! Modbus/TCP framing for function 3 (read holding registers).
//!
//! MBAP header: transaction id, protocol id (0), remaining length, unit id.
//! The request PDU is function code + start register + register count; the
//! response PDU is function code + byte count + big-endian register words,
//! or function | 0x80 + exception code on device errors.

use bytes::{BufMut, BytesMut};

use crate::utils::{CounterSrvError, Result};

/// Read holding registers.
pub const FUNCTION_READ_HOLDING: u8 = 0x03;

/// MBAP header length on the wire.
pub const MBAP_LEN: usize = 7;

const PROTOCOL_ID: u16 = 0;
const EXCEPTION_FLAG: u8 = 0x80;

/// Modbus exception codes a device can answer with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModbusException {
    IllegalFunction,
    IllegalDataAddress,
    IllegalDataValue,
    SlaveDeviceFailure,
    Acknowledge,
    SlaveDeviceBusy,
    GatewayPathUnavailable,
    GatewayTargetFailed,
    Unknown(u8),
}

impl ModbusException {
    pub fn from_code(code: u8) -> Self {
        match code {
            0x01 => Self::IllegalFunction,
            0x02 => Self::IllegalDataAddress,
            0x03 => Self::IllegalDataValue,
            0x04 => Self::SlaveDeviceFailure,
            0x05 => Self::Acknowledge,
            0x06 => Self::SlaveDeviceBusy,
            0x0A => Self::GatewayPathUnavailable,
            0x0B => Self::GatewayTargetFailed,
            other => Self::Unknown(other),
        }
    }

    pub fn description(&self) -> String {
        match self {
            Self::IllegalFunction => "illegal function".to_string(),
            Self::IllegalDataAddress => "illegal data address".to_string(),
            Self::IllegalDataValue => "illegal data value".to_string(),
            Self::SlaveDeviceFailure => "slave device failure".to_string(),
            Self::Acknowledge => "acknowledge".to_string(),
            Self::SlaveDeviceBusy => "slave device busy".to_string(),
            Self::GatewayPathUnavailable => "gateway path unavailable".to_string(),
            Self::GatewayTargetFailed => "gateway target failed to respond".to_string(),
            Self::Unknown(code) => format!("unknown exception 0x{code:02X}"),
        }
    }
}

/// One read-holding-registers request.
#[derive(Debug, Clone, Copy)]
pub struct ReadRequest {
    pub transaction_id: u16,
    pub unit_id: u8,
    pub start: u16,
    pub count: u16,
}

impl ReadRequest {
    /// Encode as a 12-byte MBAP frame.
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(12);
        buf.put_u16(self.transaction_id);
        buf.put_u16(PROTOCOL_ID);
        buf.put_u16(6); // unit id + PDU
        buf.put_u8(self.unit_id);
        buf.put_u8(FUNCTION_READ_HOLDING);
        buf.put_u16(self.start);
        buf.put_u16(self.count);
        buf
    }
}

/// Parsed MBAP header of a response frame.
#[derive(Debug, Clone, Copy)]
pub struct MbapHeader {
    pub transaction_id: u16,
    pub unit_id: u8,
    /// Bytes remaining after the header (the PDU).
    pub pdu_len: usize,
}

/// Decode the 7-byte MBAP header.
pub fn decode_header(bytes: &[u8; MBAP_LEN]) -> Result<MbapHeader> {
    let transaction_id = u16::from_be_bytes([bytes[0], bytes[1]]);
    let protocol_id = u16::from_be_bytes([bytes[2], bytes[3]]);
    let length = u16::from_be_bytes([bytes[4], bytes[5]]) as usize;
    let unit_id = bytes[6];

    if protocol_id != PROTOCOL_ID {
        return Err(CounterSrvError::ModbusError(format!(
            "unexpected protocol id {protocol_id}"
        )));
    }
    if length < 2 || length > 256 {
        return Err(CounterSrvError::ModbusError(format!(
            "implausible MBAP length {length}"
        )));
    }

    Ok(MbapHeader {
        transaction_id,
        unit_id,
        // Length counts the unit id byte which the header already consumed.
        pdu_len: length - 1,
    })
}

/// Decode a read-holding-registers response PDU into register words.
pub fn decode_read_response(request: &ReadRequest, pdu: &[u8]) -> Result<Vec<u16>> {
    if pdu.is_empty() {
        return Err(CounterSrvError::ModbusError("empty response PDU".to_string()));
    }

    let function = pdu[0];
    if function == FUNCTION_READ_HOLDING | EXCEPTION_FLAG {
        let code = pdu.get(1).copied().unwrap_or(0);
        return Err(CounterSrvError::ModbusError(format!(
            "device exception: {}",
            ModbusException::from_code(code).description()
        )));
    }
    if function != FUNCTION_READ_HOLDING {
        return Err(CounterSrvError::ModbusError(format!(
            "unexpected function code 0x{function:02X}"
        )));
    }

    let expected_bytes = request.count as usize * 2;
    let byte_count = pdu.get(1).copied().unwrap_or(0) as usize;
    let data = &pdu[2..];

    if byte_count != expected_bytes || data.len() != expected_bytes {
        return Err(CounterSrvError::ModbusError(format!(
            "short register payload: expected {} bytes, got {} (count {})",
            expected_bytes,
            data.len(),
            byte_count
        )));
    }

    let words = data
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect();
    Ok(words)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> ReadRequest {
        ReadRequest {
            transaction_id: 0x0102,
            unit_id: 1,
            start: 0x0010,
            count: 2,
        }
    }

    #[test]
    fn test_request_encoding() {
        let frame = request().encode();
        assert_eq!(
            frame.as_ref(),
            &[0x01, 0x02, 0x00, 0x00, 0x00, 0x06, 0x01, 0x03, 0x00, 0x10, 0x00, 0x02]
        );
    }

    #[test]
    fn test_header_roundtrip() {
        let header =
            decode_header(&[0x01, 0x02, 0x00, 0x00, 0x00, 0x07, 0x01]).unwrap();
        assert_eq!(header.transaction_id, 0x0102);
        assert_eq!(header.unit_id, 1);
        assert_eq!(header.pdu_len, 6);
    }

    #[test]
    fn test_header_rejects_bad_protocol() {
        assert!(decode_header(&[0, 1, 0, 1, 0, 7, 1]).is_err());
        assert!(decode_header(&[0, 1, 0, 0, 0, 1, 1]).is_err());
    }

    #[test]
    fn test_response_decoding() {
        // Two registers: 0x0010, 0x0000
        let pdu = [0x03, 0x04, 0x00, 0x10, 0x00, 0x00];
        let words = decode_read_response(&request(), &pdu).unwrap();
        assert_eq!(words, vec![0x0010, 0x0000]);
    }

    #[test]
    fn test_exception_response() {
        let pdu = [0x83, 0x02];
        let err = decode_read_response(&request(), &pdu).unwrap_err();
        assert!(err.to_string().contains("illegal data address"));
    }

    #[test]
    fn test_short_payload_rejected() {
        let pdu = [0x03, 0x04, 0x00, 0x10];
        assert!(decode_read_response(&request(), &pdu).is_err());

        let pdu = [0x03, 0x02, 0x00, 0x10];
        assert!(decode_read_response(&request(), &pdu).is_err());
    }

    #[test]
    fn test_wrong_function_rejected() {
        let pdu = [0x04, 0x04, 0, 0, 0, 0];
        assert!(decode_read_response(&request(), &pdu).is_err());
    }

    #[test]
    fn test_exception_code_mapping() {
        assert_eq!(
            ModbusException::from_code(0x0B),
            ModbusException::GatewayTargetFailed
        );
        assert!(ModbusException::from_code(0x7F)
            .description()
            .contains("unknown"));
    }
}
