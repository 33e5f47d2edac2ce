//! Input validation for names and free-text fields.

/// Maximum byte length for free-text fields (`content`, `role`).
pub const MAX_FIELD_LEN: usize = 32_000;

const MAX_NAME_LEN: usize = 50;

/// Check an agent/room name: `[A-Za-z0-9._- ]`, 1–50 chars, no `..`.
///
/// An empty name is accepted and means "use the default" at call sites.
pub fn validate_name(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Ok(());
    }
    let ok_charset = name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | ' '));
    if !ok_charset || name.len() > MAX_NAME_LEN {
        return Err(format!(
            "invalid name {name:?}: only [A-Za-z0-9._- ] allowed, max {MAX_NAME_LEN} chars"
        ));
    }
    if name.contains("..") {
        return Err(format!("invalid name {name:?}: '..' not allowed"));
    }
    Ok(())
}

/// Enforce the free-text byte cap on a named field.
pub fn validate_field_len(field: &str, value: &str) -> Result<(), String> {
    if value.len() > MAX_FIELD_LEN {
        return Err(format!(
            "{field} too long: {} bytes, max {MAX_FIELD_LEN}",
            value.len()
        ));
    }
    Ok(())
}

/// Strip ANSI escape sequences (CSI and OSC) and control bytes from text
/// that will be rendered back to an agent. Tab, newline and CR survive.
pub fn sanitize(s: &str) -> String {
    let b = s.as_bytes();
    let mut out = Vec::with_capacity(b.len());
    let mut i = 0;
    while i < b.len() {
        let c = b[i];
        if c == 0x1b && i + 1 < b.len() {
            match b[i + 1] {
                b'[' => {
                    // CSI: skip until a final byte in 0x40..=0x7e
                    i += 2;
                    while i < b.len() && !(0x40..=0x7e).contains(&b[i]) {
                        i += 1;
                    }
                    if i < b.len() {
                        i += 1;
                    }
                }
                b']' => {
                    // OSC: skip until BEL or ST
                    i += 2;
                    while i < b.len() {
                        if b[i] == 0x07 {
                            i += 1;
                            break;
                        }
                        if b[i] == 0x1b && i + 1 < b.len() && b[i + 1] == b'\\' {
                            i += 2;
                            break;
                        }
                        i += 1;
                    }
                }
                _ => i += 2,
            }
            continue;
        }
        if (c < 0x20 && c != b'\t' && c != b'\n' && c != b'\r') || c == 0x7f {
            i += 1;
            continue;
        }
        out.push(c);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_names() {
        for name in ["alice", "agent-1", "room.dev", "a b c", "X_9", ""] {
            assert!(validate_name(name).is_ok(), "{name:?} should be valid");
        }
    }

    #[test]
    fn invalid_names() {
        for name in [
            "a/b",
            "über",
            "..",
            "a..b",
            "name\n",
            &"x".repeat(51),
        ] {
            assert!(validate_name(name).is_err(), "{name:?} should be rejected");
        }
    }

    #[test]
    fn field_cap() {
        assert!(validate_field_len("content", &"x".repeat(MAX_FIELD_LEN)).is_ok());
        assert!(validate_field_len("content", &"x".repeat(MAX_FIELD_LEN + 1)).is_err());
    }

    #[test]
    fn sanitize_strips_csi_and_osc() {
        assert_eq!(sanitize("a\x1b[31mred\x1b[0mb"), "aredb");
        assert_eq!(sanitize("x\x1b]0;title\x07y"), "xy");
        assert_eq!(sanitize("x\x1b]0;title\x1b\\y"), "xy");
    }

    #[test]
    fn sanitize_keeps_whitespace_controls() {
        assert_eq!(sanitize("a\tb\nc\rd"), "a\tb\nc\rd");
        assert_eq!(sanitize("a\x00b\x7fc"), "abc");
    }
}
