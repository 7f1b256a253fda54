pub fn fmt_hex(f: &mut std::fmt::Formatter<'_>, bytes: &[u8]) -> std::fmt::Result {
    for x in bytes {
        write!(f, "{:02x}", x)?;
    }
    Ok(())
}

/// Decodes exactly `out.len()` bytes of hex. Returns `None` on a length
/// mismatch or a non-hex digit.
pub fn decode_hex_into(s: &str, out: &mut [u8]) -> Option<()> {
    if s.len() != out.len() * 2 || !s.is_ascii() {
        return None;
    }
    for (i, byte) in out.iter_mut().enumerate() {
        *byte = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16).ok()?;
    }
    Some(())
}
