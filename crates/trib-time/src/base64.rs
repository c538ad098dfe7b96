//! Fixed-radix base64 rendering of 60-bit time values.
//!
//! The alphabet is chosen so that `'0'` is the smallest character and
//! the characters are in ASCII order. A value rendered with trailing
//! zeros trimmed therefore compares lexicographically exactly like the
//! untrimmed 10-digit form, which in turn compares like the number
//! itself. Storage keys and stamp strings rely on this property.

/// 64 characters in ascending ASCII order; `'0'` is the zero digit.
pub const ALPHABET: &[u8; 64] =
    b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ_abcdefghijklmnopqrstuvwxyz~";

/// Maximum digits in a rendered value (10 * 6 = 60 bits).
pub const MAX_DIGITS: usize = 10;

/// Largest encodable value: 2^60 - 1.
pub const MAX_VALUE: u64 = (1 << 60) - 1;

/// Render a 60-bit value, most significant digit first, trailing
/// zero digits trimmed. Zero renders as `"0"`.
pub fn encode(value: u64) -> String {
    let value = value & MAX_VALUE;
    let mut out = String::with_capacity(MAX_DIGITS);
    let mut last_nonzero = 0;
    for i in 0..MAX_DIGITS {
        let shift = 6 * (MAX_DIGITS - 1 - i);
        let digit = ((value >> shift) & 0x3f) as usize;
        out.push(ALPHABET[digit] as char);
        if digit != 0 {
            last_nonzero = i + 1;
        }
    }
    out.truncate(last_nonzero.max(1));
    out
}

/// Render a plain integer in the minimum number of digits, most
/// significant first. Unlike [`encode`], this is right-aligned: used
/// for counters (session id grants), not time values.
pub fn encode_int(value: u64) -> String {
    if value == 0 {
        return "0".to_string();
    }
    let mut out = String::new();
    let mut rest = value;
    while rest > 0 {
        out.insert(0, ALPHABET[(rest & 0x3f) as usize] as char);
        rest >>= 6;
    }
    out
}

/// Parse a trimmed rendering back into its value. Returns `None` for
/// an empty string, an overlong string, or a character outside the
/// alphabet.
pub fn decode(text: &str) -> Option<u64> {
    if text.is_empty() || text.len() > MAX_DIGITS {
        return None;
    }
    let mut value = 0u64;
    let mut digits = 0;
    for ch in text.bytes() {
        let digit = digit_value(ch)?;
        value = (value << 6) | digit as u64;
        digits += 1;
    }
    // restore the trimmed trailing zeros
    value <<= 6 * (MAX_DIGITS - digits);
    Some(value)
}

/// Zero out the `n` least significant digits of a value.
pub fn truncate(value: u64, n: usize) -> u64 {
    if n >= MAX_DIGITS {
        return 0;
    }
    let mask = !((1u64 << (6 * n)) - 1);
    value & mask & MAX_VALUE
}

fn digit_value(ch: u8) -> Option<u8> {
    match ch {
        b'0'..=b'9' => Some(ch - b'0'),
        b'A'..=b'Z' => Some(ch - b'A' + 10),
        b'_' => Some(36),
        b'a'..=b'z' => Some(ch - b'a' + 37),
        b'~' => Some(63),
        _ => None,
    }
}
