//! CRC-16/X.25 as used by the diag HDLC trailer: reflected polynomial `0x8408`, initial value
//! `0xFFFF`, final inversion.

const POLY: u16 = 0x8408;

const TABLE: [u16; 256] = build_table();

const fn build_table() -> [u16; 256] {
    let mut table = [0u16; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u16;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 1 != 0 { (crc >> 1) ^ POLY } else { crc >> 1 };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

/// Computes the checksum of `data`.
#[inline]
pub fn crc16(data: &[u8]) -> u16 {
    !data.iter().fold(0xFFFF, |crc: u16, &b| (crc >> 8) ^ TABLE[((crc ^ b as u16) & 0xFF) as usize])
}
