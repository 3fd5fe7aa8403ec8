//! Segwit v0 bech32 address encoding (BIP-173).
//!
//! Only encoding is needed: the compiler turns a 32-byte witness program
//! into the address clients fund. Client-supplied addresses are never
//! decoded, only shape-checked by [`crate::types::Address::parse`].

const CHARSET: &[u8; 32] = b"qpzry9x8gf2tvdw0s3jn54khce6mua7l";
const GENERATOR: [u32; 5] = [
    0x3b6a_57b2,
    0x2650_8e6d,
    0x1ea1_19fa,
    0x3d42_33dd,
    0x2a14_62b3,
];

fn polymod(values: &[u8]) -> u32 {
    let mut chk: u32 = 1;
    for value in values {
        let top = chk >> 25;
        chk = ((chk & 0x01ff_ffff) << 5) ^ u32::from(*value);
        for (i, generator) in GENERATOR.iter().enumerate() {
            if (top >> i) & 1 == 1 {
                chk ^= generator;
            }
        }
    }
    chk
}

fn hrp_expand(hrp: &str) -> Vec<u8> {
    let bytes = hrp.as_bytes();
    let mut out = Vec::with_capacity(bytes.len() * 2 + 1);
    out.extend(bytes.iter().map(|b| b >> 5));
    out.push(0);
    out.extend(bytes.iter().map(|b| b & 0x1f));
    out
}

// Every narrowing below is masked to five bits first.
#[allow(clippy::cast_possible_truncation)]
fn checksum(hrp: &str, data: &[u8]) -> [u8; 6] {
    let mut values = hrp_expand(hrp);
    values.extend_from_slice(data);
    values.extend_from_slice(&[0; 6]);
    let modulus = polymod(&values) ^ 1;
    let mut out = [0u8; 6];
    for (i, slot) in out.iter_mut().enumerate() {
        *slot = ((modulus >> (5 * (5 - i))) & 0x1f) as u8;
    }
    out
}

/// Regroups 8-bit bytes into 5-bit groups, padding the final group.
#[allow(clippy::cast_possible_truncation)]
fn to_base32(bytes: &[u8]) -> Vec<u8> {
    let mut acc: u32 = 0;
    let mut bits: u32 = 0;
    let mut out = Vec::with_capacity(bytes.len() * 8 / 5 + 1);
    for byte in bytes {
        acc = ((acc << 8) | u32::from(*byte)) & 0x0fff;
        bits += 8;
        while bits >= 5 {
            bits -= 5;
            out.push(((acc >> bits) & 0x1f) as u8);
        }
    }
    if bits > 0 {
        out.push(((acc << (5 - bits)) & 0x1f) as u8);
    }
    out
}

/// Encodes a version 0 witness program as a lowercase bech32 address.
#[must_use]
pub fn encode_segwit_v0(hrp: &str, program: &[u8]) -> String {
    let mut data = Vec::with_capacity(program.len() * 8 / 5 + 2);
    data.push(0);
    data.extend(to_base32(program));
    let checksum = checksum(hrp, &data);

    let mut out = String::with_capacity(hrp.len() + 1 + data.len() + checksum.len());
    out.push_str(hrp);
    out.push('1');
    out.extend(
        data.iter()
            .chain(checksum.iter())
            .map(|d| char::from(CHARSET[usize::from(*d)])),
    );
    out
}
