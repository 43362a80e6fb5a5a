//! DNS-SD service-type selector parsing.
//!
//! A selector names a service type and optionally one subtype, in either
//! the leading-label form or the trailing-comma form:
//!
//! ```text
//! _ipp._tcp                  type only
//! _ipp._tcp.local.           trailing .local and dot are tolerated
//! _sub._ipp._tcp             leading subtype
//! _ipp._tcp,_sub             comma subtype
//! ```
//!
//! Grammar (anchored):
//!
//! ```text
//! (leading-subtype ".")? type (".local")? "."? ("," subtype)?
//! label   := "_" [A-Za-z0-9-_]{1,61} [A-Za-z0-9]
//! type    := label "." "_" ("tcp" | "udp")
//! subtype := label
//! ```
//!
//! The parser is pure and total: any input that does not match the grammar
//! yields `None`, never a panic. When both subtype forms are present, the
//! leading one wins.

/// A parsed service-type selector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedServiceType {
    /// The bare type pair, e.g. `_ipp._tcp`. No trailing dot, no `.local`.
    pub service_type: String,
    /// The subtype label, if the selector carried one.
    pub subtype: Option<String>,
}

impl ParsedServiceType {
    /// The selector the modern engine listens on: subtype-qualified when a
    /// subtype is present (`_print._sub._ipp._tcp` per RFC 6763 §7.1), the
    /// bare type otherwise.
    pub fn listen_selector(&self) -> String {
        match &self.subtype {
            Some(sub) => format!("{sub}._sub.{}", self.service_type),
            None => self.service_type.clone(),
        }
    }
}

/// Parses a service-type selector. Returns `None` if the input does not
/// match the grammar.
pub fn parse_type_and_subtype(input: &str) -> Option<ParsedServiceType> {
    if input.is_empty() {
        return None;
    }

    // Split off the trailing-comma subtype first; at most one comma.
    let (head, comma_subtype) = match input.split_once(',') {
        Some((head, sub)) => {
            if sub.contains(',') || !is_service_label(sub) {
                return None;
            }
            (head, Some(sub))
        }
        None => (input, None),
    };

    // Tolerate one trailing dot, then an optional ".local" suffix.
    let head = head.strip_suffix('.').unwrap_or(head);
    let head = head.strip_suffix(".local").unwrap_or(head);

    // The remainder is dot-separated labels ending in the protocol label.
    let labels: Vec<&str> = head.split('.').collect();
    let (leading, type_labels) = match labels.len() {
        2 => (None, &labels[0..2]),
        3 => (Some(labels[0]), &labels[1..3]),
        _ => return None,
    };

    let (name_label, proto_label) = (type_labels[0], type_labels[1]);
    if !is_service_label(name_label) {
        return None;
    }
    if proto_label != "_tcp" && proto_label != "_udp" {
        return None;
    }
    if let Some(sub) = leading {
        if !is_service_label(sub) {
            return None;
        }
    }

    // When both forms are present the leading subtype wins.
    let subtype = leading.or(comma_subtype).map(str::to_string);

    Some(ParsedServiceType {
        service_type: format!("{name_label}.{proto_label}"),
        subtype,
    })
}

/// A service label: underscore, then 1-61 characters from `[A-Za-z0-9-_]`,
/// then a final alphanumeric character.
fn is_service_label(label: &str) -> bool {
    let bytes = label.as_bytes();
    if bytes.len() < 3 || bytes.len() > 63 {
        return false;
    }
    if bytes[0] != b'_' {
        return false;
    }
    let last = bytes[bytes.len() - 1];
    if !last.is_ascii_alphanumeric() {
        return false;
    }
    bytes[1..bytes.len() - 1]
        .iter()
        .all(|b| b.is_ascii_alphanumeric() || *b == b'-' || *b == b'_')
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(s: &str) -> Option<(String, Option<String>)> {
        parse_type_and_subtype(s).map(|p| (p.service_type, p.subtype))
    }

    #[test]
    fn bare_type() {
        assert_eq!(parse("_ipp._tcp"), Some(("_ipp._tcp".into(), None)));
        assert_eq!(parse("_ipp._udp"), Some(("_ipp._udp".into(), None)));
    }

    #[test]
    fn trailing_local_and_dot_tolerated() {
        assert_eq!(parse("_type._tcp.local."), Some(("_type._tcp".into(), None)));
        assert_eq!(parse("_type._tcp.local"), Some(("_type._tcp".into(), None)));
        assert_eq!(parse("_type._tcp."), Some(("_type._tcp".into(), None)));
    }

    #[test]
    fn leading_subtype() {
        assert_eq!(
            parse("_sub._type._tcp"),
            Some(("_type._tcp".into(), Some("_sub".into())))
        );
    }

    #[test]
    fn comma_subtype() {
        assert_eq!(
            parse("_type._tcp,_sub"),
            Some(("_type._tcp".into(), Some("_sub".into())))
        );
    }

    #[test]
    fn leading_subtype_wins_over_comma() {
        assert_eq!(
            parse("_lead._type._tcp,_trail"),
            Some(("_type._tcp".into(), Some("_lead".into())))
        );
    }

    #[test]
    fn subtype_with_local_suffix() {
        assert_eq!(
            parse("_sub._type._tcp.local."),
            Some(("_type._tcp".into(), Some("_sub".into())))
        );
    }

    #[test]
    fn empty_rejected() {
        assert_eq!(parse(""), None);
    }

    #[test]
    fn bad_protocol_rejected() {
        assert_eq!(parse("_type._sctp"), None);
        assert_eq!(parse("_type.tcp"), None);
    }

    #[test]
    fn missing_underscore_rejected() {
        assert_eq!(parse("type._tcp"), None);
    }

    #[test]
    fn label_must_end_alphanumeric() {
        assert_eq!(parse("_type-._tcp"), None);
        assert_eq!(parse("_type_._tcp"), None);
    }

    #[test]
    fn too_many_labels_rejected() {
        assert_eq!(parse("_a._b._type._tcp"), None);
    }

    #[test]
    fn double_comma_rejected() {
        assert_eq!(parse("_type._tcp,_a,_b"), None);
    }

    #[test]
    fn label_length_bounds() {
        // 1 middle char + final alnum is the minimum
        assert_eq!(parse("_ab._tcp"), Some(("_ab._tcp".into(), None)));
        // Single char after underscore is too short
        assert_eq!(parse("_a._tcp"), None);
        // 61 middle chars + final char is the maximum (63 total)
        let max_label = format!("_{}x", "a".repeat(61));
        assert!(parse(&format!("{max_label}._tcp")).is_some());
        let over = format!("_{}x", "a".repeat(62));
        assert_eq!(parse(&format!("{over}._tcp")), None);
    }

    #[test]
    fn listen_selector_qualifies_subtype() {
        let parsed = parse_type_and_subtype("_print._ipp._tcp").unwrap();
        assert_eq!(parsed.listen_selector(), "_print._sub._ipp._tcp");
        let bare = parse_type_and_subtype("_ipp._tcp").unwrap();
        assert_eq!(bare.listen_selector(), "_ipp._tcp");
    }
}
