//! RFC 1071 one's-complement checksum.

/// Computes the 16-bit one's-complement checksum over `data`.
///
/// Words are read as network byte order pairs; an odd trailing byte
/// is zero-extended into the high bits of a final word. Carries are
/// folded back into the low 16 bits until none remain, then the sum
/// is complemented. Both IP and ICMP headers use this algorithm, and
/// routers validate it, so it must be bit-exact.
pub fn checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut chunks = data.chunks_exact(2);
    for chunk in &mut chunks {
        sum += u16::from_be_bytes([chunk[0], chunk[1]]) as u32;
    }
    if let Some(&tail) = chunks.remainder().first() {
        sum += (tail as u32) << 8;
    }
    while (sum >> 16) != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}
