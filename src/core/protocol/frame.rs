//! Heatmiser V3 frame codec
//!
//! Request frames (controller to thermostat):
//!
//! ```text
//! [device, frame_len, master, op, addr_lo, addr_hi, len_lo, len_hi, payload.., crc_lo, crc_hi]
//! ```
//!
//! Responses come back as either a 9-byte read header followed by the payload
//! and checksum, or a fixed 7-byte write acknowledgement.

use super::checksum::{self, Crc16, CHECKSUM_LEN};
use super::dcb::Dcb;
use thiserror::Error;

/// Controller address used by this client (the protocol allows 129-160)
pub const MASTER_ADDR: u8 = 0x81;

/// Length requested when reading the whole DCB
pub const FULL_DCB: u16 = 0xFFFF;

/// Size of a request without payload, checksum included
pub const REQUEST_OVERHEAD: usize = 10;

/// Size of the header that starts every read response
pub const READ_HEADER_LEN: usize = 9;

/// Size of a write acknowledgement
pub const WRITE_ACK_LEN: usize = 7;

/// Largest write payload that still fits the one-byte frame length field
pub const MAX_WRITE_PAYLOAD: usize = u8::MAX as usize - REQUEST_OVERHEAD;

/// Frame operation flag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Operation {
    /// Read registers (0)
    Read = 0,
    /// Write registers (1)
    Write = 1,
}

impl Operation {
    /// Get operation from its wire value
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Operation::Read),
            1 => Some(Operation::Write),
            _ => None,
        }
    }
}

/// Frame level failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// Trailer does not match the recomputed checksum
    #[error("checksum mismatch: expected {expected:02X?}, found {found:02X?}")]
    ChecksumMismatch {
        /// Checksum computed over the received bytes
        expected: [u8; 2],
        /// Checksum carried by the frame
        found: [u8; 2],
    },

    /// Fewer or more bytes than the frame announces
    #[error("frame length mismatch: expected {expected} bytes, got {actual}")]
    Truncated {
        /// Bytes the header announced
        expected: usize,
        /// Bytes actually supplied
        actual: usize,
    },

    /// Write payload does not fit in one frame
    #[error("payload of {0} bytes exceeds the 245-byte frame limit")]
    PayloadTooLarge(usize),
}

impl FrameError {
    /// True when the bytes arrived but could not be trusted
    pub fn is_checksum(&self) -> bool {
        matches!(self, FrameError::ChecksumMismatch { .. })
    }
}

// ============ Requests ============

fn encode_request(device: u8, op: Operation, address: u16, length: u16, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(REQUEST_OVERHEAD + payload.len());
    frame.push(device);
    // Bounded by MAX_WRITE_PAYLOAD in encode_write
    frame.push((REQUEST_OVERHEAD + payload.len()) as u8);
    frame.push(MASTER_ADDR);
    frame.push(op as u8);
    frame.extend_from_slice(&address.to_le_bytes());
    frame.extend_from_slice(&length.to_le_bytes());
    frame.extend_from_slice(payload);
    checksum::append(&mut frame);
    frame
}

/// Build a READ request for `length` bytes at `address`
///
/// Use [`FULL_DCB`] as the length to fetch the whole control block.
pub fn encode_read(device: u8, address: u16, length: u16) -> Vec<u8> {
    encode_request(device, Operation::Read, address, length, &[])
}

/// Build a WRITE request carrying `payload` to `address`
pub fn encode_write(device: u8, address: u16, payload: &[u8]) -> Result<Vec<u8>, FrameError> {
    if payload.len() > MAX_WRITE_PAYLOAD {
        return Err(FrameError::PayloadTooLarge(payload.len()));
    }
    // Fits in u16 by the check above
    let length = payload.len() as u16;
    Ok(encode_request(device, Operation::Write, address, length, payload))
}

// ============ Responses ============

/// Parsed 9-byte read response header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadHeader {
    raw: [u8; READ_HEADER_LEN],
}

impl ReadHeader {
    /// Wrap the raw header bytes
    pub fn parse(raw: [u8; READ_HEADER_LEN]) -> Self {
        Self { raw }
    }

    /// Controller the reply is addressed to
    pub fn destination(&self) -> u8 {
        self.raw[0]
    }

    /// Thermostat that sent the reply
    pub fn source(&self) -> u8 {
        self.raw[3]
    }

    /// Operation flag echoed from the request
    pub fn operation(&self) -> Option<Operation> {
        Operation::from_u8(self.raw[4])
    }

    /// Start address echoed from the request
    pub fn address(&self) -> u16 {
        u16::from_le_bytes([self.raw[5], self.raw[6]])
    }

    /// Whole frame length as announced, header and checksum included
    pub fn frame_len(&self) -> usize {
        usize::from(u16::from_le_bytes([self.raw[1], self.raw[2]]))
    }

    /// Header of a read reply sent to this controller, with consistent lengths
    pub fn is_well_formed(&self) -> bool {
        self.destination() == MASTER_ADDR
            && self.operation() == Some(Operation::Read)
            && self.frame_len() == READ_HEADER_LEN + self.body_len()
    }

    /// Reply to a read of `address` sent to `device`
    pub fn answers(&self, device: u8, address: u16) -> bool {
        self.source() == device && self.address() == address
    }

    /// Number of payload bytes that follow the header
    pub fn payload_len(&self) -> usize {
        usize::from(u16::from_le_bytes([self.raw[7], self.raw[8]]))
    }

    /// Bytes still to read after the header: payload plus checksum
    pub fn body_len(&self) -> usize {
        self.payload_len() + CHECKSUM_LEN
    }

    /// Raw header bytes
    pub fn as_bytes(&self) -> &[u8; READ_HEADER_LEN] {
        &self.raw
    }
}

/// Validate a read response and strip header and checksum
///
/// `body` must hold exactly [`ReadHeader::body_len`] bytes.
pub fn decode_read_response(header: &ReadHeader, body: &[u8]) -> Result<Dcb, FrameError> {
    let expected = header.body_len();
    if body.len() != expected {
        return Err(FrameError::Truncated {
            expected,
            actual: body.len(),
        });
    }

    let (payload, trailer) = body.split_at(body.len() - CHECKSUM_LEN);
    let mut crc = Crc16::new();
    crc.update_slice(header.as_bytes());
    crc.update_slice(payload);

    let computed = crc.finish();
    let found = [trailer[0], trailer[1]];
    if computed != found {
        return Err(FrameError::ChecksumMismatch {
            expected: computed,
            found,
        });
    }

    Ok(Dcb::new(payload.to_vec()))
}

/// Write acknowledgement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteAck {
    raw: [u8; WRITE_ACK_LEN],
}

impl WriteAck {
    /// Address of the thermostat that acknowledged
    pub fn source(&self) -> u8 {
        self.raw[3]
    }

    /// Acknowledgement sent to this controller for a write
    pub fn is_well_formed(&self) -> bool {
        self.raw[0] == MASTER_ADDR
            && usize::from(u16::from_le_bytes([self.raw[1], self.raw[2]])) == WRITE_ACK_LEN
            && Operation::from_u8(self.raw[4]) == Some(Operation::Write)
    }

    /// Raw acknowledgement bytes
    pub fn as_bytes(&self) -> &[u8; WRITE_ACK_LEN] {
        &self.raw
    }
}

/// Validate a write acknowledgement
pub fn decode_write_ack(raw: [u8; WRITE_ACK_LEN]) -> Result<WriteAck, FrameError> {
    let (body, trailer) = raw.split_at(WRITE_ACK_LEN - CHECKSUM_LEN);
    let computed = checksum::checksum(body);
    let found = [trailer[0], trailer[1]];
    if computed != found {
        return Err(FrameError::ChecksumMismatch {
            expected: computed,
            found,
        });
    }
    Ok(WriteAck { raw })
}

/// Format a request frame for trace output
pub fn describe(frame: &[u8]) -> String {
    if frame.len() < REQUEST_OVERHEAD {
        return format!("RAW: {}", hex::encode(frame));
    }
    let op = match Operation::from_u8(frame[3]) {
        Some(Operation::Read) => "READ",
        Some(Operation::Write) => "WRITE",
        None => "?",
    };
    format!(
        "{op}: Dev={:02} Addr={} Len={} Data={} CRC={}",
        frame[0],
        u16::from_le_bytes([frame[4], frame[5]]),
        u16::from_le_bytes([frame[6], frame[7]]),
        hex::encode(&frame[8..frame.len() - CHECKSUM_LEN]),
        hex::encode(&frame[frame.len() - CHECKSUM_LEN..])
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_response(payload: &[u8]) -> (ReadHeader, Vec<u8>) {
        reply_from(1, 0, payload)
    }

    fn reply_from(device: u8, address: u16, payload: &[u8]) -> (ReadHeader, Vec<u8>) {
        let len = (payload.len() as u16).to_le_bytes();
        let total = (READ_HEADER_LEN + payload.len() + CHECKSUM_LEN) as u16;
        let total = total.to_le_bytes();
        let addr = address.to_le_bytes();
        let header = [MASTER_ADDR, total[0], total[1], device, 0x00, addr[0], addr[1], len[0], len[1]];

        let mut frame = header.to_vec();
        frame.extend_from_slice(payload);
        let trailer = checksum::checksum(&frame);

        let mut body = payload.to_vec();
        body.extend_from_slice(&trailer);
        (ReadHeader::parse(header), body)
    }

    #[test]
    fn test_encode_full_dcb_read() {
        let frame = encode_read(1, 0, FULL_DCB);
        assert_eq!(
            frame,
            vec![0x01, 0x0A, 0x81, 0x00, 0x00, 0x00, 0xFF, 0xFF, 0x2C, 0x09]
        );
    }

    #[test]
    fn test_encode_narrow_read() {
        let frame = encode_read(1, 41, 1);
        assert_eq!(
            frame,
            vec![0x01, 0x0A, 0x81, 0x00, 0x29, 0x00, 0x01, 0x00, 0x2B, 0xE3]
        );
    }

    #[test]
    fn test_encode_write_sets_frame_length() {
        let frame = encode_write(2, 18, &[21]).unwrap();
        assert_eq!(
            frame,
            vec![0x02, 0x0B, 0x81, 0x01, 0x12, 0x00, 0x01, 0x00, 0x15, 0xFF, 0x6B]
        );

        let frame = encode_write(3, 43, &[1, 12, 30, 0]).unwrap();
        assert_eq!(frame[1], 14);
        assert_eq!(frame.len(), 14);
        assert!(checksum::verify(&frame));
    }

    #[test]
    fn test_encode_write_rejects_oversize_payload() {
        let payload = vec![0u8; MAX_WRITE_PAYLOAD + 1];
        assert_eq!(
            encode_write(1, 0, &payload),
            Err(FrameError::PayloadTooLarge(MAX_WRITE_PAYLOAD + 1))
        );
    }

    #[test]
    fn test_decode_read_response() {
        let payload: Vec<u8> = (0..64).collect();
        let (header, body) = read_response(&payload);
        assert_eq!(header.payload_len(), 64);
        assert_eq!(header.body_len(), 66);

        let dcb = decode_read_response(&header, &body).unwrap();
        assert_eq!(dcb.as_bytes(), payload.as_slice());
    }

    #[test]
    fn test_decode_read_response_rejects_corrupt_payload() {
        let (header, mut body) = read_response(&[20, 21, 22]);
        body[1] ^= 0x01;
        let err = decode_read_response(&header, &body).unwrap_err();
        assert!(err.is_checksum());
    }

    #[test]
    fn test_decode_read_response_rejects_short_body() {
        let (header, body) = read_response(&[20, 21, 22]);
        let err = decode_read_response(&header, &body[..3]).unwrap_err();
        assert_eq!(err, FrameError::Truncated { expected: 5, actual: 3 });
        assert!(!err.is_checksum());
    }

    #[test]
    fn test_read_header_identifies_the_reply() {
        let (header, _) = reply_from(2, 41, &[1]);
        assert!(header.is_well_formed());
        assert_eq!(header.source(), 2);
        assert_eq!(header.operation(), Some(Operation::Read));
        assert_eq!(header.address(), 41);
        assert_eq!(header.frame_len(), 12);

        assert!(header.answers(2, 41));
        assert!(!header.answers(1, 41));
        assert!(!header.answers(2, 0));
    }

    #[test]
    fn test_read_header_rejects_foreign_layouts() {
        let (header, _) = reply_from(1, 0, &[20, 21]);
        let mut raw = *header.as_bytes();

        raw[0] = 0x82;
        assert!(!ReadHeader::parse(raw).is_well_formed());

        let mut raw = *header.as_bytes();
        raw[4] = Operation::Write as u8;
        assert!(!ReadHeader::parse(raw).is_well_formed());

        let mut raw = *header.as_bytes();
        raw[1] += 1;
        assert!(!ReadHeader::parse(raw).is_well_formed());
    }

    #[test]
    fn test_decode_write_ack() {
        let mut raw = vec![MASTER_ADDR, 0x07, 0x00, 0x02, 0x01];
        checksum::append(&mut raw);
        let raw: [u8; WRITE_ACK_LEN] = raw.try_into().unwrap();

        let ack = decode_write_ack(raw).unwrap();
        assert_eq!(ack.source(), 2);
        assert!(ack.is_well_formed());

        let mut bad = raw;
        bad[3] = 3;
        assert!(decode_write_ack(bad).unwrap_err().is_checksum());
    }

    #[test]
    fn test_describe() {
        let frame = encode_write(2, 18, &[21]).unwrap();
        assert_eq!(describe(&frame), "WRITE: Dev=02 Addr=18 Len=1 Data=15 CRC=ff6b");
        assert!(describe(&[1, 2]).starts_with("RAW"));
    }
}
