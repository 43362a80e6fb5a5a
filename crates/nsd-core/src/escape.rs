//! DNS-SD name escaping, as produced by mdnsresponder-family daemons.
//!
//! Full service names on the legacy daemon's wire use backslash escapes:
//! `\.` and `\\` for literal dot and backslash, and `\ddd` (three decimal
//! digits) for arbitrary bytes. An instance name like `My.Printer` travels
//! as `My\.Printer._ipp._tcp.local.`.

use tracing::warn;

use crate::types::MAX_INSTANCE_NAME_BYTES;

/// Decodes mdnsresponder backslash escapes.
///
/// Characters are copied verbatim except `\`. After a backslash, `.` and
/// `\` are emitted literally; otherwise the next three characters are read
/// as a decimal triple `ddd` and the byte value `d1*100 + d2*10 + d3` is
/// emitted. A truncated escape is logged and terminates decoding at the
/// truncation point.
pub fn unescape(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut chars = name.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('.') => out.push('.'),
            Some('\\') => out.push('\\'),
            Some(d1) => {
                let (d2, d3) = (chars.next(), chars.next());
                match (d1.to_digit(10), d2.and_then(|c| c.to_digit(10)), d3.and_then(|c| c.to_digit(10))) {
                    (Some(a), Some(b), Some(c)) => {
                        out.push((a * 100 + b * 10 + c) as u8 as char);
                    }
                    _ => {
                        warn!(name, "malformed escape sequence, truncating");
                        break;
                    }
                }
            }
            None => {
                warn!(name, "dangling backslash, truncating");
                break;
            }
        }
    }
    out
}

/// Splits a fully-escaped service name into its unescaped instance name and
/// bare service type.
///
/// `My\.Printer._ipp._tcp.local.` becomes `("My.Printer", "_ipp._tcp")`.
/// The separator scan honors `\.` and `\\`, so escaped dots inside the
/// instance label never split. Returns `None` when no unescaped separator
/// exists or the remainder is not a type pair.
pub fn split_fullname(fullname: &str) -> Option<(String, String)> {
    let bytes = fullname.as_bytes();
    let mut i = 0;
    let mut split_at = None;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => i += 2,
            b'.' => {
                split_at = Some(i);
                break;
            }
            _ => i += 1,
        }
    }
    let split_at = split_at?;
    let instance = unescape(fullname.get(..split_at)?);
    let rest = fullname.get(split_at + 1..)?;

    let rest = rest.strip_suffix('.').unwrap_or(rest);
    let rest = rest.strip_suffix(".local").unwrap_or(rest);
    if !rest.ends_with("._tcp") && !rest.ends_with("._udp") {
        return None;
    }
    Some((instance, rest.to_string()))
}

/// Truncates an instance name to the RFC 6763 limit of 63 UTF-8 bytes,
/// backing off to a character boundary so the result stays valid UTF-8.
pub fn truncate_instance_name(name: &str) -> &str {
    if name.len() <= MAX_INSTANCE_NAME_BYTES {
        return name;
    }
    let mut end = MAX_INSTANCE_NAME_BYTES;
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    &name[..end]
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unescape_literal_dot() {
        assert_eq!(unescape(r"a\.b"), "a.b");
    }

    #[test]
    fn unescape_decimal_triple() {
        assert_eq!(unescape(r"x\065y"), "xAy");
        assert_eq!(unescape(r"\032"), " ");
    }

    #[test]
    fn unescape_backslash() {
        assert_eq!(unescape(r"z\\"), r"z\");
    }

    #[test]
    fn unescape_plain_passthrough() {
        assert_eq!(unescape("printer1"), "printer1");
    }

    #[test]
    fn unescape_truncated_escape_stops() {
        // Two digits then end of input: emit nothing for the escape,
        // keep what came before it.
        assert_eq!(unescape(r"ab\06"), "ab");
        assert_eq!(unescape(r"ab\"), "ab");
        assert_eq!(unescape(r"ab\0x9"), "ab");
    }

    #[test]
    fn split_plain_fullname() {
        assert_eq!(
            split_fullname("My._foo._tcp.local."),
            Some(("My".to_string(), "_foo._tcp".to_string()))
        );
    }

    #[test]
    fn split_escaped_dot_in_instance() {
        assert_eq!(
            split_fullname(r"My\.Printer._ipp._tcp.local."),
            Some(("My.Printer".to_string(), "_ipp._tcp".to_string()))
        );
    }

    #[test]
    fn split_escaped_backslash_in_instance() {
        assert_eq!(
            split_fullname(r"a\\._foo._udp.local."),
            Some((r"a\".to_string(), "_foo._udp".to_string()))
        );
    }

    #[test]
    fn split_without_local_suffix() {
        assert_eq!(
            split_fullname("svc._foo._tcp"),
            Some(("svc".to_string(), "_foo._tcp".to_string()))
        );
    }

    #[test]
    fn split_rejects_non_type_remainder() {
        assert_eq!(split_fullname("justaname"), None);
        assert_eq!(split_fullname("a.b.c"), None);
    }

    #[test]
    fn truncate_short_name_untouched() {
        assert_eq!(truncate_instance_name("printer"), "printer");
    }

    #[test]
    fn truncate_to_63_bytes() {
        let long = "x".repeat(80);
        assert_eq!(truncate_instance_name(&long).len(), 63);
    }

    #[test]
    fn truncate_respects_char_boundary() {
        // 'é' is 2 bytes; 40 of them is 80 bytes, and byte 63 falls in the
        // middle of a character, so the cut backs off to 62.
        let name = "é".repeat(40);
        let truncated = truncate_instance_name(&name);
        assert_eq!(truncated.len(), 62);
        assert_eq!(truncated, "é".repeat(31));
    }
}
