//! Frame checksum. Reference: `crc_accumulate` in the MAVLink C library
//! (`checksum.h`) and the CRC-16/MCRF4XX entry of the CRC RevEng catalogue
//! (check value 0x6F91).

/// CRC-16/MCRF4XX as used by MAVLink (X.25 polynomial, seed 0xFFFF, no final xor).
#[derive(Debug, Clone, Copy)]
pub struct Crc16(u16);

impl Crc16 {
    pub fn new() -> Self {
        Self(0xFFFF)
    }

    pub fn accumulate(&mut self, byte: u8) {
        let mut tmp = byte ^ (self.0 & 0xFF) as u8;
        tmp ^= tmp << 4;
        let tmp = tmp as u16;
        self.0 = (self.0 >> 8) ^ (tmp << 8) ^ (tmp << 3) ^ (tmp >> 4);
    }

    pub fn update(&mut self, bytes: &[u8]) {
        for b in bytes {
            self.accumulate(*b);
        }
    }

    pub fn value(self) -> u16 {
        self.0
    }
}

impl Default for Crc16 {
    fn default() -> Self {
        Self::new()
    }
}

/// Checksum of a frame: header after STX plus payload, then the message CRC extra.
pub fn frame_crc(header_and_payload: &[u8], crc_extra: u8) -> u16 {
    let mut crc = Crc16::new();
    crc.update(header_and_payload);
    crc.accumulate(crc_extra);
    crc.value()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_value() {
        let mut crc = Crc16::new();
        crc.update(b"123456789");
        assert_eq!(crc.value(), 0x6F91);
    }
}
