//! Wire helpers for the kernel's conntrack dictionary pseudo-files
//! (spec.md §4.4, §6).

/// Comma is the field separator on the wire; substitute commas in values
/// with hyphens before writing (spec.md §4.4).
pub fn escape_value(value: &str) -> String {
    value.replace(',', "-")
}

/// Render a `write` pseudo-file line: `id=<d>,field=<s>,value=<s>`.
pub fn write_line(ctid: u32, field: &str, value: &str) -> String {
    format!("id={},field={},value={}\n", ctid, field, escape_value(value))
}

/// Parse one `<field>: <value>` line from a `read`/`all` snapshot.
pub fn parse_kv_line(line: &str) -> Option<(&str, &str)> {
    let line = line.trim_end_matches(['\n', '\r']);
    let (field, value) = line.split_once(": ")?;
    if field.is_empty() {
        return None;
    }
    Some((field, value))
}

/// Parse a full multi-line snapshot into an ordered list of (field, value).
pub fn parse_snapshot(body: &str) -> Vec<(String, String)> {
    body.lines()
        .filter_map(parse_kv_line)
        .map(|(f, v)| (f.to_string(), v.to_string()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commas_become_hyphens() {
        assert_eq!(escape_value("a,b,c"), "a-b-c");
    }

    #[test]
    fn write_line_format() {
        assert_eq!(
            write_line(42, "certificate_subject_cn", "exa,mple.com"),
            "id=42,field=certificate_subject_cn,value=exa-mple.com\n"
        );
    }

    #[test]
    fn parse_snapshot_skips_malformed_lines() {
        let body = "a: 1\nnotkv\nb: two\n";
        let parsed = parse_snapshot(body);
        assert_eq!(
            parsed,
            vec![
                ("a".to_string(), "1".to_string()),
                ("b".to_string(), "two".to_string()),
            ]
        );
    }
}
