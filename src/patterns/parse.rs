use regex::Regex;
use std::fs;
use std::net::Ipv4Addr;
use std::path::Path;
use tracing::{info, warn};

use crate::domain::Transaction;

use super::backend::PatternError;
use super::pattern::{Pattern, PatternKind};

/// Number of transaction fields screened per transaction.
pub const MATCH_FIELD_COUNT: usize = 10;

/// Classify a trimmed pattern line.
pub fn classify(line: &str) -> PatternKind {
    if line.contains('/') && (line.contains('.') || line.contains(':')) {
        PatternKind::Cidr
    } else if line.contains('*') {
        PatternKind::Wildcard
    } else {
        PatternKind::Exact
    }
}

/// Parse newline-delimited pattern text.
///
/// Lines are trimmed; blank lines and `#` comments are skipped. Ids are
/// assigned sequentially from `first_id`. A CIDR line that cannot be
/// translated is kept as an exact literal.
pub fn parse_patterns(text: &str, category: &str, first_id: u32) -> Vec<Pattern> {
    let mut patterns = Vec::new();
    let mut id = first_id;

    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let pattern = match classify(line) {
            PatternKind::Cidr => match cidr_to_regex(line) {
                Ok(regex) => {
                    Pattern::build(id, regex, category.to_string(), PatternKind::Cidr, true)
                }
                Err(e) => {
                    warn!(
                        pattern = %line,
                        error = %e,
                        "CIDR conversion failed, keeping as literal"
                    );
                    Pattern::exact(id, line, category)
                }
            },
            PatternKind::Wildcard => Pattern::wildcard(id, line, category),
            PatternKind::Exact => Pattern::exact(id, line, category),
        };

        patterns.push(pattern);
        id += 1;
    }

    patterns
}

/// Read and parse a pattern file.
pub fn parse_pattern_file(
    path: impl AsRef<Path>,
    category: &str,
    first_id: u32,
) -> Result<Vec<Pattern>, PatternError> {
    let path = path.as_ref();
    let content = fs::read_to_string(path).map_err(|e| PatternError::Io {
        path: path.display().to_string(),
        source: e,
    })?;

    let patterns = parse_patterns(&content, category, first_id);
    info!(
        path = %path.display(),
        category,
        count = patterns.len(),
        "Parsed pattern file"
    );
    Ok(patterns)
}

/// Translate a glob into an anchored regex.
///
/// `*` matches any run of characters, `?` exactly one; other regex
/// metacharacters are escaped.
pub fn wildcard_to_regex(wildcard: &str) -> String {
    let mut out = String::with_capacity(wildcard.len() * 2 + 2);
    out.push('^');

    for c in wildcard.chars() {
        match c {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            '.' | '^' | '$' | '+' | '(' | ')' | '[' | ']' | '{' | '}' | '|' | '\\' => {
                out.push('\\');
                out.push(c);
            }
            _ => out.push(c),
        }
    }

    out.push('$');
    out
}

/// Approximate an IPv4 CIDR block with an anchored regex.
///
/// Only octet-aligned prefixes are modelled: /24 and longer keep three
/// octets, /16 to /23 keep two, anything shorter keeps one. The remaining
/// octets match any one to three digits.
pub fn cidr_to_regex(cidr: &str) -> Result<String, PatternError> {
    let invalid = |reason: &str| PatternError::InvalidCidr {
        cidr: cidr.to_string(),
        reason: reason.to_string(),
    };

    let (ip_part, prefix_part) = cidr
        .split_once('/')
        .ok_or_else(|| invalid("missing prefix length"))?;

    let prefix: u8 = prefix_part
        .trim()
        .parse()
        .map_err(|_| invalid("prefix length is not a number"))?;
    if prefix > 32 {
        return Err(invalid("prefix length out of range"));
    }

    let ip: Ipv4Addr = ip_part
        .trim()
        .parse()
        .map_err(|_| invalid("not an IPv4 address"))?;
    let octets = ip.octets();

    let kept = match prefix {
        24..=32 => 3,
        16..=23 => 2,
        _ => 1,
    };

    let mut out = String::from("^");
    for (i, octet) in octets.iter().take(kept).enumerate() {
        if i > 0 {
            out.push_str(r"\.");
        }
        out.push_str(&octet.to_string());
    }
    for _ in kept..4 {
        out.push_str(r"\.\d{1,3}");
    }
    out.push('$');

    Ok(out)
}

/// Whether a pattern is usable. Regexes must compile.
pub fn validate_pattern(pattern: &str, is_regex: bool) -> bool {
    if pattern.is_empty() {
        return false;
    }
    !is_regex || Regex::new(pattern).is_ok()
}

/// Transaction fields screened against the pattern set, in scan order.
pub fn extract_match_fields(tx: &Transaction) -> [(&'static str, &str); MATCH_FIELD_COUNT] {
    [
        ("ip_address", tx.device.ip.as_str()),
        ("device_fingerprint", tx.device.fingerprint.as_str()),
        ("user_agent", tx.device.user_agent.as_str()),
        ("merchant_id", tx.transaction.merchant_id.as_str()),
        ("card_token", tx.card.token.as_str()),
        ("issuer_country", tx.card.issuer_country.as_str()),
        ("card_brand", tx.card.card_brand.as_str()),
        ("customer_id", tx.customer.id.as_str()),
        ("currency", tx.transaction.currency.as_str()),
        ("pos_entry_mode", tx.transaction.pos_entry_mode.as_str()),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::transaction::tests::sample_transaction;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_classify() {
        assert_eq!(classify("192.168.0.0/16"), PatternKind::Cidr);
        assert_eq!(classify("2001:db8::/32"), PatternKind::Cidr);
        assert_eq!(classify("MERCH_*"), PatternKind::Wildcard);
        assert_eq!(classify("a/b"), PatternKind::Exact);
        assert_eq!(classify("tok_123"), PatternKind::Exact);
    }

    #[test]
    fn test_parse_patterns() {
        let text = "\
# blocked infrastructure
192.168.1.1

  MERCH_*
10.0.0.0/8
2001:db8::/32
";
        let patterns = parse_patterns(text, "blacklist", 1);

        assert_eq!(patterns.len(), 4);

        assert_eq!(patterns[0].id, 1);
        assert_eq!(patterns[0].kind, PatternKind::Exact);
        assert_eq!(patterns[0].name, "blacklist_exact_1");
        assert_eq!(patterns[0].priority, 10);
        assert!(patterns[0].case_sensitive);

        assert_eq!(patterns[1].pattern, "MERCH_*");
        assert_eq!(patterns[1].name, "blacklist_wildcard_2");

        assert_eq!(patterns[2].kind, PatternKind::Cidr);
        assert!(patterns[2].is_regex);
        assert_eq!(patterns[2].name, "blacklist_cidr_3");

        // IPv6 block falls back to a literal
        assert_eq!(patterns[3].kind, PatternKind::Exact);
        assert!(!patterns[3].is_regex);
        assert_eq!(patterns[3].pattern, "2001:db8::/32");
    }

    #[test]
    fn test_wildcard_to_regex() {
        assert_eq!(wildcard_to_regex("MERCH_*"), "^MERCH_.*$");
        assert_eq!(wildcard_to_regex("a?c"), "^a.c$");
        assert_eq!(wildcard_to_regex("*.tor.net"), r"^.*\.tor\.net$");
        assert_eq!(wildcard_to_regex("(x)|[y]"), r"^\(x\)\|\[y\]$");

        let re = Regex::new(&wildcard_to_regex("MERCH_*")).unwrap();
        assert!(re.is_match("MERCH_999"));
        assert!(!re.is_match("XMERCH_999"));
    }

    #[test]
    fn test_cidr_to_regex() {
        assert_eq!(
            cidr_to_regex("192.168.1.0/24").unwrap(),
            r"^192\.168\.1\.\d{1,3}$"
        );
        assert_eq!(
            cidr_to_regex("172.16.0.0/20").unwrap(),
            r"^172\.16\.\d{1,3}\.\d{1,3}$"
        );
        assert_eq!(
            cidr_to_regex("10.0.0.0/8").unwrap(),
            r"^10\.\d{1,3}\.\d{1,3}\.\d{1,3}$"
        );
        assert_eq!(
            cidr_to_regex("203.0.113.7/32").unwrap(),
            r"^203\.0\.113\.\d{1,3}$"
        );

        let re = Regex::new(&cidr_to_regex("10.0.0.0/8").unwrap()).unwrap();
        assert!(re.is_match("10.20.30.40"));
        assert!(!re.is_match("11.20.30.40"));
    }

    #[test]
    fn test_cidr_failures() {
        assert!(cidr_to_regex("10.0.0.0").is_err());
        assert!(cidr_to_regex("10.0.0.0/33").is_err());
        assert!(cidr_to_regex("10.0.0.0/abc").is_err());
        assert!(cidr_to_regex("10.0/8").is_err());
        assert!(cidr_to_regex("2001:db8::/32").is_err());
    }

    #[test]
    fn test_validate_pattern() {
        assert!(validate_pattern("abc", false));
        assert!(validate_pattern("(abc", false));
        assert!(!validate_pattern("(abc", true));
        assert!(validate_pattern("^a+$", true));
        assert!(!validate_pattern("", false));
    }

    #[test]
    fn test_extract_match_fields_order() {
        let tx = sample_transaction();
        let fields = extract_match_fields(&tx);

        let names: Vec<_> = fields.iter().map(|(name, _)| *name).collect();
        assert_eq!(
            names,
            vec![
                "ip_address",
                "device_fingerprint",
                "user_agent",
                "merchant_id",
                "card_token",
                "issuer_country",
                "card_brand",
                "customer_id",
                "currency",
                "pos_entry_mode",
            ]
        );
        assert_eq!(fields[0].1, "10.20.30.40");
        assert_eq!(fields[3].1, "MERCH_001");
    }

    #[test]
    fn test_parse_pattern_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "# whitelist\nMERCH_TRUSTED\n").unwrap();

        let patterns = parse_pattern_file(file.path(), "whitelist", 100).unwrap();
        assert_eq!(patterns.len(), 1);
        assert_eq!(patterns[0].id, 100);
        assert_eq!(patterns[0].name, "whitelist_exact_100");

        assert!(matches!(
            parse_pattern_file("/nonexistent/patterns.txt", "blacklist", 1),
            Err(PatternError::Io { .. })
        ));
    }
}
