//! Heatmiser V3 frame checksum
//!
//! A CRC-16 with polynomial 0x1021 and initial value 0xFFFF (CRC-16/CCITT-FALSE),
//! computed four bits at a time from two 16-entry lookup tables. The tables are
//! the ones published with the V3 protocol and must not be changed.
//!
//! On the wire the checksum follows the frame as `[low, high]`.

/// High byte contributions, indexed by nibble
const LOOKUP_HIGH: [u8; 16] = [
    0x00, 0x10, 0x20, 0x30, 0x40, 0x50, 0x60, 0x70,
    0x81, 0x91, 0xa1, 0xb1, 0xc1, 0xd1, 0xe1, 0xf1,
];

/// Low byte contributions, indexed by nibble
const LOOKUP_LOW: [u8; 16] = [
    0x00, 0x21, 0x42, 0x63, 0x84, 0xa5, 0xc6, 0xe7,
    0x08, 0x29, 0x4a, 0x6b, 0x8c, 0xad, 0xce, 0xef,
];

/// Length of the checksum trailer in bytes
pub const CHECKSUM_LEN: usize = 2;

/// Streaming checksum state
///
/// Lets a codec checksum a header and a payload held in separate buffers
/// without concatenating them first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Crc16 {
    high: u8,
    low: u8,
}

impl Default for Crc16 {
    fn default() -> Self {
        Self::new()
    }
}

impl Crc16 {
    /// Create a fresh checksum register (both halves 0xFF)
    pub fn new() -> Self {
        Self {
            high: 0xFF,
            low: 0xFF,
        }
    }

    /// Feed one byte, high nibble first
    pub fn update(&mut self, byte: u8) {
        self.nibble(byte >> 4);
        self.nibble(byte & 0x0F);
    }

    /// Feed a run of bytes
    pub fn update_slice(&mut self, data: &[u8]) {
        for &byte in data {
            self.update(byte);
        }
    }

    /// Wire order trailer `[low, high]`
    pub fn finish(&self) -> [u8; CHECKSUM_LEN] {
        [self.low, self.high]
    }

    /// The register as a single 16-bit value
    pub fn value(&self) -> u16 {
        u16::from_be_bytes([self.high, self.low])
    }

    fn nibble(&mut self, value: u8) {
        let index = usize::from((self.high >> 4) ^ value);
        self.high = (self.high << 4) | (self.low >> 4);
        self.low <<= 4;
        self.high ^= LOOKUP_HIGH[index];
        self.low ^= LOOKUP_LOW[index];
    }
}

/// Checksum of `data` in wire order `[low, high]`
pub fn checksum(data: &[u8]) -> [u8; CHECKSUM_LEN] {
    let mut crc = Crc16::new();
    crc.update_slice(data);
    crc.finish()
}

/// Append the checksum of everything already in `frame`
pub fn append(frame: &mut Vec<u8>) {
    let trailer = checksum(frame);
    frame.extend_from_slice(&trailer);
}

/// Verify a frame whose last two bytes are its checksum
pub fn verify(frame: &[u8]) -> bool {
    if frame.len() < CHECKSUM_LEN {
        return false;
    }
    let (body, trailer) = frame.split_at(frame.len() - CHECKSUM_LEN);
    checksum(body) == [trailer[0], trailer[1]]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_value() {
        // CRC-16/CCITT-FALSE check value
        let crc = {
            let mut crc = Crc16::new();
            crc.update_slice(b"123456789");
            crc
        };
        assert_eq!(crc.value(), 0x29B1);
        assert_eq!(checksum(b"123456789"), [0xB1, 0x29]);
    }

    #[test]
    fn test_empty_input_is_initial_register() {
        assert_eq!(checksum(&[]), [0xFF, 0xFF]);
    }

    #[test]
    fn test_full_dcb_read_request() {
        let request = [0x01, 0x0A, 0x81, 0x00, 0x00, 0x00, 0xFF, 0xFF];
        assert_eq!(checksum(&request), [0x2C, 0x09]);

        let request = [0x03, 0x0A, 0x81, 0x00, 0x00, 0x00, 0xFF, 0xFF];
        assert_eq!(checksum(&request), [0x8A, 0x86]);
    }

    #[test]
    fn test_append_then_verify() {
        let mut frame = vec![0x02, 0x0B, 0x81, 0x01, 0x12, 0x00, 0x01, 0x00, 0x15];
        append(&mut frame);
        assert_eq!(&frame[9..], &[0xFF, 0x6B]);
        assert!(verify(&frame));
    }

    #[test]
    fn test_verify_rejects_short_input() {
        assert!(!verify(&[]));
        assert!(!verify(&[0xFF]));
    }

    #[test]
    fn test_every_single_bit_flip_is_detected() {
        let mut frame: Vec<u8> = (0u8..40).map(|i| i.wrapping_mul(37)).collect();
        append(&mut frame);
        let body_len = frame.len() - CHECKSUM_LEN;

        for index in 0..body_len {
            for bit in 0..8 {
                let mut corrupted = frame.clone();
                corrupted[index] ^= 1 << bit;
                assert!(
                    !verify(&corrupted),
                    "flip of bit {bit} in byte {index} was accepted"
                );
            }
        }
    }

    #[test]
    fn test_streaming_matches_one_shot() {
        let header = [0x81, 0x4B, 0x00, 0x01, 0x00, 0x00, 0x00, 0x40, 0x00];
        let payload: Vec<u8> = (0..64).collect();

        let mut crc = Crc16::new();
        crc.update_slice(&header);
        crc.update_slice(&payload);

        let mut joined = header.to_vec();
        joined.extend_from_slice(&payload);
        assert_eq!(crc.finish(), checksum(&joined));
    }
}
