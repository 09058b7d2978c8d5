//! Tolerant readers for agent replies written as `- field: value` lines.
//!
//! Agents decorate their output freely (bullets, `**bold**` names, units,
//! `~` approximations), so every reader here returns `Option` and callers
//! choose their own default.

use crate::incident::TerminalStatus;

/// Value of the first line whose name matches `name`, case-insensitively.
///
/// Accepted shapes include `- name: v`, `* **name**: v`, `**name:** v` and
/// `name : v`. Asterisks are removed from the value; an empty value counts as
/// absent.
pub fn field(text: &str, name: &str) -> Option<String> {
    let wanted = name.to_ascii_lowercase();
    for line in text.lines() {
        let clean = line.trim_start_matches(|c: char| c.is_whitespace() || c == '-' || c == '*');
        let clean = clean.trim_start_matches('*');
        if clean.len() < wanted.len() || !clean.is_char_boundary(wanted.len()) {
            continue;
        }
        let (head, rest) = clean.split_at(wanted.len());
        if head.to_ascii_lowercase() != wanted {
            continue;
        }
        let rest = rest.trim_start_matches('*').trim_start();
        let Some(value) = rest.strip_prefix(':') else {
            continue;
        };
        let value = value.replace('*', "");
        let value = value.trim();
        if !value.is_empty() {
            return Some(value.to_string());
        }
    }
    None
}

/// Non-negative number leading the field, ignoring `~`, `%` and trailing units.
pub fn number(text: &str, name: &str) -> Option<f64> {
    let raw = field(text, name)?;
    leading_number(&raw)
}

/// Confidence normalised to `0.0..=1.0`. Values above 1 are read as
/// percentages.
pub fn confidence(text: &str, name: &str) -> Option<f64> {
    let v = number(text, name)?;
    let v = if v > 1.0 { v / 100.0 } else { v };
    Some(v.clamp(0.0, 1.0))
}

/// `true`/`false`, `yes`/`no`.
pub fn flag(text: &str, name: &str) -> Option<bool> {
    let raw = field(text, name)?.to_ascii_lowercase();
    match raw.split_whitespace().next()? {
        "true" | "yes" => Some(true),
        "false" | "no" => Some(false),
        _ => None,
    }
}

/// A terminal verdict, only when the field is exactly `RESOLVED` or
/// `ESCALATE` (ignoring case and markup).
pub fn verdict(text: &str, name: &str) -> Option<TerminalStatus> {
    match field(text, name)?.trim().to_ascii_uppercase().as_str() {
        "RESOLVED" => Some(TerminalStatus::Resolved),
        "ESCALATE" => Some(TerminalStatus::Escalate),
        _ => None,
    }
}

/// Number at the very start of the value, after an optional `~`. Commas may
/// group the whole part in threes. A sign, a prefix such as `p95` or any other
/// malformed literal makes the value unreadable.
fn leading_number(raw: &str) -> Option<f64> {
    let raw = raw.trim_start().trim_start_matches('~').trim_start();
    if !raw.starts_with(|c: char| c.is_ascii_digit()) {
        return None;
    }
    let end = raw
        .find(|c: char| !(c.is_ascii_digit() || c == ',' || c == '.'))
        .unwrap_or(raw.len());
    let literal = raw[..end].trim_end_matches(|c: char| c == ',' || c == '.');

    let (whole, fraction) = match literal.split_once('.') {
        Some((whole, fraction)) => (whole, Some(fraction)),
        None => (literal, None),
    };
    let groups: Vec<&str> = whole.split(',').collect();
    if groups.len() > 1 && (groups[0].len() > 3 || groups[1..].iter().any(|g| g.len() != 3)) {
        return None;
    }

    let digits = groups.concat();
    let text = match fraction {
        Some(fraction) => format!("{}.{}", digits, fraction),
        None => digits,
    };
    text.parse::<f64>().ok().filter(|v| v.is_finite())
}
