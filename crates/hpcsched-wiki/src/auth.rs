//! Message checksums.
//!
//! - **`Des`**: CRC16 over the message followed by four rounds of the
//!   pseudo-DES mix used by SLURM's wiki plugin, keyed by a numeric seed.
//!   Rendered as 16 lowercase hex digits.
//! - **`HmacSha256`**: HMAC-SHA256 keyed by the shared secret, hex encoded.

use hmac::{Hmac, Mac};
use hpc_core::ChecksumAlgo;
use sha2::Sha256;

type Sha256Mac = Hmac<Sha256>;

const C1: [u32; 4] = [0xcba4_e531, 0x5371_58eb, 0x145c_dc3c, 0x0d3f_deb2];
const C2: [u32; 4] = [0x12be_4590, 0xab54_ce58, 0x6954_c7a6, 0x15a2_ca46];

/// CRC16 (polynomial 0x1021) step for one byte.
pub fn compute_crc(crc: u16, byte: u8) -> u16 {
    let mut ans = u32::from(crc) ^ (u32::from(byte) << 8);
    for _ in 0..8 {
        if ans & 0x8000 != 0 {
            ans = (ans << 1) ^ 4129;
        } else {
            ans <<= 1;
        }
    }
    ans as u16
}

fn des(lword: &mut u32, irword: &mut u32) {
    for (c1, c2) in C1.iter().zip(C2.iter()) {
        let iswap = *irword;
        let ia = iswap ^ c1;
        let itmpl = ia & 0xffff;
        let itmph = ia >> 16;
        let ib = itmpl
            .wrapping_mul(itmpl)
            .wrapping_add(!itmph.wrapping_mul(itmph));
        let ia = (ib >> 16) | ((ib & 0xffff) << 16);
        *irword = *lword ^ (ia ^ c2).wrapping_add(itmpl.wrapping_mul(itmph));
        *lword = iswap;
    }
}

/// Parse a numeric key the way `strtoul(key, NULL, 0)` does: `0x` prefix
/// for hex, leading `0` for octal, decimal otherwise. Trailing garbage is
/// ignored; no digits gives 0.
pub fn parse_seed(key: &str) -> u32 {
    let key = key.trim();
    let (digits, radix) = if let Some(hex) = key.strip_prefix("0x").or_else(|| key.strip_prefix("0X")) {
        (hex, 16)
    } else if key.len() > 1 && key.starts_with('0') {
        (&key[1..], 8)
    } else {
        (key, 10)
    };
    let end = digits
        .char_indices()
        .find(|(_, c)| !c.is_digit(radix))
        .map_or(digits.len(), |(i, _)| i);
    u64::from_str_radix(&digits[..end], radix).map_or(0, |v| v as u32)
}

/// SLURM-compatible checksum of `data` under `key`.
pub fn des_checksum(key: &str, data: &str) -> String {
    let crc = data.bytes().fold(0u16, compute_crc);
    let mut lword = u32::from(crc);
    let mut irword = parse_seed(key);
    des(&mut lword, &mut irword);
    format!("{lword:08x}{irword:08x}")
}

/// HMAC-SHA256 of `data` under `key`, hex encoded.
pub fn hmac_sha256(key: &str, data: &str) -> String {
    // HMAC takes keys of any length, so keying cannot fail.
    let Ok(mut mac) = Sha256Mac::new_from_slice(key.as_bytes()) else {
        return String::new();
    };
    mac.update(data.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

pub fn checksum(algo: ChecksumAlgo, key: &str, data: &str) -> String {
    match algo {
        ChecksumAlgo::Des => des_checksum(key, data),
        ChecksumAlgo::HmacSha256 => hmac_sha256(key, data),
    }
}
