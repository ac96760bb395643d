//! Branch-name encoding for docker references (§4.A).
//!
//! Encodes an arbitrary UTF-8 string into the restricted alphabet
//! `[A-Za-z0-9.-]` used for ostree-style branch names, and decodes it back.
//! Both directions are total: neither may fail on any input.

/// True for the bytes that pass through [`encode`] unchanged.
fn is_unreserved(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'.' || b == b'-'
}

/// Encode `s` into `[A-Za-z0-9.-]`, escaping every other byte as `_XX` (two
/// uppercase hex digits). Total: every byte string has an encoding.
pub fn encode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for &b in s.as_bytes() {
        if is_unreserved(b) {
            out.push(b as char);
        } else {
            out.push_str(&format!("_{:02X}", b));
        }
    }
    out
}

/// Decode the inverse of [`encode`]. On a malformed escape (not enough
/// trailing bytes, or two characters that aren't valid hex) the offending
/// `_` is dropped and scanning resumes at the next byte — decoding never
/// errors.
pub fn decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'_' {
            let hex = bytes.get(i + 1..i + 3).and_then(|h| std::str::from_utf8(h).ok());
            if let Some(byte) = hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
                out.push(byte);
                i += 3;
                continue;
            }
            // Malformed escape: drop the `_`, continue from the next byte.
            i += 1;
            continue;
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}
