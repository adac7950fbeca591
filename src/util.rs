//! Shared utilities: varints and the radix-36 names used for segments and
//! generations.

pub mod varint;

const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Format `value` in base 36, the radix of segment names and generations.
pub fn to_radix36(mut value: u64) -> String {
    if value == 0 {
        return "0".to_string();
    }
    let mut buf = Vec::new();
    while value > 0 {
        buf.push(DIGITS[(value % 36) as usize]);
        value /= 36;
    }
    buf.reverse();
    String::from_utf8(buf).unwrap_or_default()
}

/// Parse a base-36 string. Returns `None` for anything that is not one.
pub fn from_radix36(text: &str) -> Option<u64> {
    if text.is_empty() {
        return None;
    }
    u64::from_str_radix(text, 36).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_radix36() {
        assert_eq!(to_radix36(0), "0");
        assert_eq!(to_radix36(35), "z");
        assert_eq!(to_radix36(36), "10");
        for value in [1u64, 17, 1296, 99_999, u32::MAX as u64] {
            assert_eq!(from_radix36(&to_radix36(value)), Some(value));
        }
        assert_eq!(from_radix36("not-a-number"), None);
        assert_eq!(from_radix36(""), None);
    }
}
