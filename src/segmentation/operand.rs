//! Right-hand side operands of segmentation leaves: `lower(x)`, `wildcard(*x*)`, `regex(x)`,
//! `gt(n)`, `gte(n)`, `lt(n)`, `lte(n)` and plain equality.
use std::cmp::Ordering;
use std::sync::OnceLock;

use regex::Regex;

use crate::context::format_number;

#[derive(Debug, Clone)]
pub(crate) enum OperandKind {
    Lower,
    Contains,
    StartsWith,
    EndsWith,
    /// `None` when the pattern failed to compile. Such operands never match.
    Regex(Option<Regex>),
    Gt,
    Gte,
    Lt,
    Lte,
    Equal,
}

/// A compiled operand.
#[derive(Debug, Clone)]
pub(crate) struct Operand {
    kind: OperandKind,
    value: String,
}

struct Patterns {
    lower: Regex,
    wildcard: Regex,
    regex: Regex,
    gt: Regex,
    gte: Regex,
    lt: Regex,
    lte: Regex,
    version: Regex,
    leading_digits: Regex,
}

fn patterns() -> &'static Patterns {
    static PATTERNS: OnceLock<Patterns> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        let compile = |pattern: &str| Regex::new(pattern).expect("static pattern must compile");
        Patterns {
            lower: compile(r"^lower\((.*)\)"),
            wildcard: compile(r"^wildcard\((.*)\)"),
            regex: compile(r"^regex\((.*)\)"),
            gt: compile(r"^gt\((\d+\.?\d*|\.\d+)\)"),
            gte: compile(r"^gte\((\d+\.?\d*|\.\d+)\)"),
            lt: compile(r"^lt\((\d+\.?\d*|\.\d+)\)"),
            lte: compile(r"^lte\((\d+\.?\d*|\.\d+)\)"),
            version: compile(r"^(\d+\.)*\d+$"),
            leading_digits: compile(r"^\d+"),
        }
    })
}

fn capture<'a>(pattern: &Regex, s: &'a str) -> Option<&'a str> {
    pattern
        .captures(s)
        .and_then(|captures| captures.get(1))
        .map(|m| m.as_str())
}

/// Quotes are not significant in operand values.
fn clean(value: &str) -> String {
    value.replace('"', "").trim().to_owned()
}

impl Operand {
    pub(crate) fn parse(operand: &str) -> Operand {
        let p = patterns();

        let (kind, value) = if let Some(value) = capture(&p.lower, operand) {
            (OperandKind::Lower, clean(value))
        } else if let Some(value) = capture(&p.wildcard, operand) {
            let starting_star = value.starts_with('*');
            let ending_star = value.ends_with('*');
            let inner = value.strip_prefix('*').unwrap_or(value);
            let inner = inner.strip_suffix('*').unwrap_or(inner);
            // Asterisks inside the pattern are literal characters.
            let kind = match (starting_star, ending_star) {
                (true, true) => OperandKind::Contains,
                (true, false) => OperandKind::EndsWith,
                (false, true) => OperandKind::StartsWith,
                (false, false) => OperandKind::Equal,
            };
            (kind, clean(inner))
        } else if let Some(value) = capture(&p.regex, operand) {
            let value = clean(value);
            (OperandKind::Regex(Regex::new(&value).ok()), value)
        } else if let Some(value) = capture(&p.gt, operand) {
            (OperandKind::Gt, clean(value))
        } else if let Some(value) = capture(&p.gte, operand) {
            (OperandKind::Gte, clean(value))
        } else if let Some(value) = capture(&p.lt, operand) {
            (OperandKind::Lt, clean(value))
        } else if let Some(value) = capture(&p.lte, operand) {
            (OperandKind::Lte, clean(value))
        } else {
            (OperandKind::Equal, clean(operand))
        };

        Operand { kind, value }
    }

    /// Match a tag value coming from user-supplied custom variables. Numeric-looking tags are
    /// canonicalized together with the operand so that `123` matches `123.0`.
    pub(crate) fn matches(&self, tag: &str) -> bool {
        let tag = preprocess_tag(tag);
        let (operand, tag) = canonicalize_numbers(&self.value, &tag);
        self.extract_result(&operand, &tag)
    }

    /// Match a raw string (IP address, browser or OS version) without numeric canonicalization.
    pub(crate) fn matches_raw(&self, tag: &str) -> bool {
        self.extract_result(&self.value, tag)
    }

    fn extract_result(&self, operand: &str, tag: &str) -> bool {
        match &self.kind {
            OperandKind::Lower => operand.to_lowercase() == tag.to_lowercase(),
            OperandKind::Contains => tag.contains(operand),
            OperandKind::StartsWith => tag.starts_with(operand),
            OperandKind::EndsWith => tag.ends_with(operand),
            OperandKind::Regex(regex) => regex.as_ref().is_some_and(|regex| regex.is_match(tag)),
            OperandKind::Gt => compare(tag, operand).is_some_and(Ordering::is_gt),
            OperandKind::Gte => compare(tag, operand).is_some_and(Ordering::is_ge),
            OperandKind::Lt => compare(tag, operand).is_some_and(Ordering::is_lt),
            OperandKind::Lte => compare(tag, operand).is_some_and(Ordering::is_le),
            OperandKind::Equal => {
                if is_version(tag) && is_version(operand) {
                    compare_versions(tag, operand) == Ordering::Equal
                } else {
                    tag == operand
                }
            }
        }
    }
}

fn preprocess_tag(tag: &str) -> String {
    tag.trim().to_owned()
}

/// If `tag` consists only of digits and dots and both values parse as numbers, print both in
/// canonical form.
fn canonicalize_numbers(operand: &str, tag: &str) -> (String, String) {
    let numeric_tag = tag.chars().all(|c| c.is_ascii_digit() || c == '.');
    if numeric_tag {
        if let (Ok(operand_number), Ok(tag_number)) = (operand.parse::<f64>(), tag.parse::<f64>()) {
            return (format_number(operand_number), format_number(tag_number));
        }
    }
    (operand.to_owned(), tag.to_owned())
}

/// Compare as dotted versions when both sides look like versions, as doubles otherwise.
fn compare(tag: &str, operand: &str) -> Option<Ordering> {
    if is_version(tag) && is_version(operand) {
        return Some(compare_versions(tag, operand));
    }
    let tag: f64 = tag.parse().ok()?;
    let operand: f64 = operand.parse().ok()?;
    tag.partial_cmp(&operand)
}

fn is_version(s: &str) -> bool {
    patterns().version.is_match(s)
}

fn compare_versions(v1: &str, v2: &str) -> Ordering {
    let parse_part = |part: Option<&str>| -> u64 {
        part.and_then(|part| patterns().leading_digits.find(part))
            .and_then(|digits| digits.as_str().parse().ok())
            .unwrap_or(0)
    };

    let parts1: Vec<&str> = v1.split('.').collect();
    let parts2: Vec<&str> = v2.split('.').collect();
    let len = parts1.len().max(parts2.len());

    (0..len)
        .map(|i| {
            parse_part(parts1.get(i).copied()).cmp(&parse_part(parts2.get(i).copied()))
        })
        .find(|ordering| ordering.is_ne())
        .unwrap_or(Ordering::Equal)
}
