/// Canonical comparison key for account labels and sheet headers.
///
/// Lowercased, trimmed, internal whitespace collapsed to single spaces, and
/// `401 k` folded into `401k`. Empty input yields the empty key, which never
/// matches a header.
pub fn normalize(label: &str) -> String {
    let collapsed = label
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase();
    collapsed.replace("401 k", "401k")
}

/// Ticker symbol encoded in an instrument sheet name: `"AVGO(AT1)"` is `AVGO`.
pub fn symbol_from_sheet_name(name: &str) -> String {
    name.trim()
        .split(|c: char| c.is_whitespace() || matches!(c, '(' | '-' | ':'))
        .next()
        .unwrap_or_default()
        .to_uppercase()
}
