//! Prompt masking: collapse volatile concrete values to placeholder tokens.
//!
//! Masking turns `"Summarize https://example.com/article-123"` into
//! `"Summarize {URL}"` so that structurally identical prompts share a
//! template form. Patterns apply in a fixed priority order; when matches
//! overlap, the earlier pattern wins and the later match is discarded.
//!
//! Inside fenced or backtick code spans, identifier tokens are additionally
//! collapsed to `{VAR}`, preserving a reserved keyword set, so code-bearing
//! prompts mask to their syntactic shape.

use std::collections::HashSet;

use once_cell::sync::Lazy;
use regex::Regex;

/// One masking rule. Order in `MASK_RULES` is priority order.
struct MaskRule {
    label: &'static str,
    regex: Regex,
    /// Whether a match counts as personally identifying.
    pii: bool,
}

static MASK_RULES: Lazy<Vec<MaskRule>> = Lazy::new(|| {
    let rule = |label: &'static str, pattern: &str, pii: bool| MaskRule {
        label,
        regex: Regex::new(pattern).expect("static mask regex"),
        pii,
    };
    vec![
        rule(
            "UUID",
            r"\b[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}\b",
            false,
        ),
        rule("URL", r#"https?://[^\s<>"'`]+"#, false),
        rule(
            "EMAIL",
            r"\b[A-Za-z0-9._%+-]+@[A-Za-z0-9](?:[A-Za-z0-9-]*[A-Za-z0-9])?(?:\.[A-Za-z]{2,})+\b",
            true,
        ),
        rule("DATE", r"\b\d{4}-\d{2}-\d{2}\b", false),
        rule("DATE", r"\b\d{1,2}/\d{1,2}/\d{2,4}\b", false),
        rule("IP", r"\b(?:\d{1,3}\.){3}\d{1,3}\b", false),
        // Grouped card and phone forms take priority over the bare number
        // rules: a 4-digit run inside "4242 4242 4242 4242" must not be
        // claimed as {NUM} before the grouping is recognized.
        rule("CARD", r"\b\d{4}[ -]\d{4}[ -]\d{4}[ -]\d{4}\b", true),
        rule(
            "PHONE",
            r"(?:\+\d{1,3}[ .-]?)?(?:\(\d{2,4}\)[ .-]?)?\d{2,4}[ .-]\d{3,4}[ .-]\d{3,4}\b",
            true,
        ),
        rule("NUM", r"\b\d+\.\d+\b", false),
        rule("NUM", r"\b\d{4,}\b", false),
        rule("HASH", r"\b[0-9a-fA-F]{32,}\b", false),
        rule(
            "PATH",
            r"(?:~?/[A-Za-z0-9._-]+){2,}/?|\b[A-Za-z]:\\[^\s`]+",
            false,
        ),
    ]
});

/// Fenced block or inline backtick span.
static CODE_SPAN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)```.*?```|`[^`\n]+`").expect("static code-span regex"));

/// Identifier token inside a code span.
static IDENTIFIER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{[A-Z]+\}|[A-Za-z_][A-Za-z0-9_]{2,}").expect("static ident regex"));

/// Reserved words preserved during code-span masking: common programming
/// keywords plus boolean/null literals.
static KEYWORDS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "abstract", "and", "as", "assert", "async", "await", "bool", "break", "case", "catch",
        "char", "class", "const", "continue", "def", "default", "del", "do", "double", "elif",
        "else", "enum", "except", "export", "extends", "false", "final", "finally", "float",
        "fn", "for", "from", "function", "global", "goto", "if", "impl", "implements", "import",
        "in", "int", "interface", "is", "lambda", "let", "long", "loop", "match", "mod", "move",
        "mut", "new", "nil", "none", "not", "null", "or", "package", "pass", "print", "private",
        "protected", "pub", "public", "raise", "ref", "return", "self", "short", "static",
        "str", "struct", "super", "switch", "then", "this", "throw", "throws", "trait", "true",
        "try", "type", "typeof", "undefined", "union", "unsigned", "use", "var", "void",
        "volatile", "where", "while", "with", "yield",
    ]
    .into_iter()
    .collect()
});

/// Result of masking a prompt.
#[derive(Debug, Clone)]
pub struct MaskOutcome {
    /// Template form of the prompt.
    pub masked: String,
    /// True if any EMAIL, PHONE or CARD pattern matched.
    pub pii_present: bool,
}

/// Mask a prompt to its template form.
pub fn mask_prompt(text: &str) -> MaskOutcome {
    let mut claimed: Vec<(usize, usize, &'static str)> = Vec::new();
    let mut pii_present = false;

    for rule in MASK_RULES.iter() {
        for m in rule.regex.find_iter(text) {
            let overlaps = claimed
                .iter()
                .any(|&(start, end, _)| m.start() < end && start < m.end());
            if overlaps {
                continue;
            }
            claimed.push((m.start(), m.end(), rule.label));
            if rule.pii {
                pii_present = true;
            }
        }
    }

    claimed.sort_by_key(|&(start, _, _)| start);

    let mut masked = String::with_capacity(text.len());
    let mut cursor = 0;
    for (start, end, label) in claimed {
        masked.push_str(&text[cursor..start]);
        masked.push('{');
        masked.push_str(label);
        masked.push('}');
        cursor = end;
    }
    masked.push_str(&text[cursor..]);

    let masked = mask_code_spans(&masked);

    MaskOutcome { masked, pii_present }
}

/// Replace identifier tokens inside code spans with `{VAR}`.
fn mask_code_spans(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut cursor = 0;
    for span in CODE_SPAN.find_iter(text) {
        out.push_str(&text[cursor..span.start()]);
        out.push_str(&mask_identifiers(span.as_str()));
        cursor = span.end();
    }
    out.push_str(&text[cursor..]);
    out
}

fn mask_identifiers(code: &str) -> String {
    IDENTIFIER
        .replace_all(code, |caps: &regex::Captures<'_>| {
            let token = &caps[0];
            // Placeholders from the primary pass stay as-is.
            if token.starts_with('{') {
                return token.to_string();
            }
            if KEYWORDS.contains(token.to_ascii_lowercase().as_str()) {
                return token.to_string();
            }
            "{VAR}".to_string()
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case("see https://example.com/article-123 now", "see {URL} now")]
    #[case("id 550e8400-e29b-41d4-a716-446655440000 here", "id {UUID} here")]
    #[case("mail me at bob@example.com", "mail me at {EMAIL}")]
    #[case("due 2024-05-13 sharp", "due {DATE} sharp")]
    #[case("due 5/13/2024 sharp", "due {DATE} sharp")]
    #[case("host 192.168.0.1 down", "host {IP} down")]
    #[case("pi is 3.14159 ok", "pi is {NUM} ok")]
    #[case("order 123456 shipped", "order {NUM} shipped")]
    #[case("card 4242 4242 4242 4242 declined", "card {CARD} declined")]
    #[case("see /usr/local/bin/tool for details", "see {PATH} for details")]
    fn masks_concrete_values(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(mask_prompt(input).masked, expected);
    }

    #[test]
    fn earlier_pattern_wins_on_overlap() {
        // The UUID would otherwise partially match the hex and number rules.
        let outcome = mask_prompt("550e8400-e29b-41d4-a716-446655440000");
        assert_eq!(outcome.masked, "{UUID}");
        // A URL containing digits masks as one URL, not URL + NUM fragments.
        let outcome = mask_prompt("https://x.test/a/123456/b");
        assert_eq!(outcome.masked, "{URL}");
    }

    #[test]
    fn masking_is_deterministic_and_idempotent() {
        let input = "email a@b.com then visit https://x.test/1234";
        let first = mask_prompt(input).masked;
        let second = mask_prompt(&first).masked;
        assert_eq!(first, second);
    }

    #[test]
    fn pii_flag_tracks_email_phone_card() {
        assert!(mask_prompt("reach me at a@b.com").pii_present);
        assert!(mask_prompt("call +1 555-123-4567 today").pii_present);
        assert!(mask_prompt("card 4242-4242-4242-4242").pii_present);
        assert!(!mask_prompt("visit https://example.com").pii_present);
    }

    #[test]
    fn hash_masks_long_hex() {
        let digest = "a".repeat(40);
        assert_eq!(mask_prompt(&digest).masked, "{HASH}");
    }

    #[test]
    fn code_spans_mask_identifiers_but_keep_keywords() {
        let outcome = mask_prompt("run `let counter = increment(counter)` now");
        assert_eq!(outcome.masked, "run `let {VAR} = {VAR}({VAR})` now");
    }

    #[test]
    fn fenced_blocks_mask_identifiers() {
        let input = "```\nfn compute_total(items) {\n  return items\n}\n```";
        let masked = mask_prompt(input).masked;
        assert!(masked.contains("fn {VAR}({VAR})"));
        assert!(masked.contains("return {VAR}"));
    }

    #[test]
    fn placeholders_survive_code_span_masking() {
        let outcome = mask_prompt("`fetch(https://x.test/abc)`");
        assert!(outcome.masked.contains("{URL}"));
        assert!(!outcome.masked.contains("{VAR}}"));
    }

    #[test]
    fn distinct_urls_collapse_to_same_template() {
        let a = mask_prompt("Summarize https://example.com/article-123").masked;
        let b = mask_prompt("Summarize https://example.com/article-456").masked;
        assert_eq!(a, b);
    }
}
