use std::sync::LazyLock;

use regex::Regex;

use super::{
    non_empty,
    severity::{classify_text, configuration_finding, is_security_related},
    truncate_chars, ParsedFragment,
};
use crate::{
    config::SeverityCvss,
    models::{SecurityFinding, Severity},
};

static HARDENING_INDEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Hardening index\s*:\s*(\d{1,3})").expect("static regex"));
static TESTS_PERFORMED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Tests performed\s*:\s*(\d+)").expect("static regex"));
static TEST_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s*\[([A-Z]+-\d{4})\]\s*$").expect("static regex"));
static INLINE_WARNING: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Warning:\s*(.+)$").expect("static regex"));
static INLINE_SUGGESTION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Suggestion:\s*(.+)$").expect("static regex"));
static CONTINUATION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^-\s*(Details|Solution)\s*:\s*(.+)$").expect("static regex"));

const NAME_LIMIT: usize = 100;

/// Section of the lynis report currently being read.
///
/// `Warnings (N):` and `Suggestions (N):` headers switch into the item lists,
/// `Follow-up:` returns to `Body`, and `Lynis security scan details:` enters
/// the summary block holding the hardening index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LynisState {
    Body,
    Warnings,
    Suggestions,
    Details,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ItemKind {
    Warning,
    Suggestion,
}

struct Item {
    kind: ItemKind,
    text: String,
    test_id: Option<String>,
    details: Option<String>,
    solution: Option<String>,
}

impl Item {
    fn new(kind: ItemKind, raw: &str) -> Option<Self> {
        let test_id = TEST_ID.captures(raw).map(|c| c[1].to_string());
        let text = non_empty(&TEST_ID.replace(raw, ""))?;
        Some(Self {
            kind,
            text,
            test_id,
            details: None,
            solution: None,
        })
    }
}

pub fn parse_lynis(raw: &str, cvss: &SeverityCvss) -> ParsedFragment {
    let mut fragment = ParsedFragment::default();
    let mut items: Vec<Item> = Vec::new();
    let mut state = LynisState::Body;

    for line in raw.lines() {
        let trimmed = line.trim();

        if trimmed.starts_with("Warnings (") {
            state = LynisState::Warnings;
            continue;
        }
        if trimmed.starts_with("Suggestions (") {
            state = LynisState::Suggestions;
            continue;
        }
        if trimmed.starts_with("Follow-up:") {
            state = LynisState::Body;
            continue;
        }
        if trimmed.starts_with("Lynis security scan details") {
            state = LynisState::Details;
            continue;
        }

        match state {
            LynisState::Body => {
                if let Some(caps) = INLINE_WARNING.captures(trimmed) {
                    items.extend(Item::new(ItemKind::Warning, &caps[1]));
                } else if let Some(caps) = INLINE_SUGGESTION.captures(trimmed) {
                    items.extend(Item::new(ItemKind::Suggestion, &caps[1]));
                }
            }
            LynisState::Warnings | LynisState::Suggestions => {
                let marker = if state == LynisState::Warnings { '!' } else { '*' };
                let kind = if state == LynisState::Warnings {
                    ItemKind::Warning
                } else {
                    ItemKind::Suggestion
                };
                if let Some(rest) = trimmed.strip_prefix(marker) {
                    items.extend(Item::new(kind, rest));
                } else if let Some(caps) = CONTINUATION.captures(trimmed) {
                    if let Some(last) = items.last_mut() {
                        let value = caps[2].trim().to_string();
                        match &caps[1] {
                            "Details" => last.details = Some(value),
                            _ => last.solution = Some(value),
                        }
                    }
                }
            }
            LynisState::Details => {}
        }

        if let Some(caps) = HARDENING_INDEX.captures(trimmed) {
            fragment.hardening_index = caps[1].parse::<u8>().ok().filter(|v| *v <= 100);
        }
        if let Some(caps) = TESTS_PERFORMED.captures(trimmed) {
            fragment.tests_performed = caps[1].parse().ok();
        }
    }

    fragment.findings = items
        .into_iter()
        .filter(|item| item.kind == ItemKind::Warning || is_security_related(&item.text))
        .map(|item| into_finding(item, cvss))
        .collect();
    fragment
}

fn into_finding(item: Item, cvss: &SeverityCvss) -> SecurityFinding {
    let severity = match item.kind {
        ItemKind::Warning => classify_text(&item.text),
        ItemKind::Suggestion => Severity::Low,
    };
    let mut description = match &item.details {
        Some(details) => format!("{}: {details}", item.text),
        None => item.text.clone(),
    };
    if let Some(id) = &item.test_id {
        description.push_str(&format!(" [{id}]"));
    }
    let recommendation = match (item.solution, item.kind) {
        (Some(solution), _) => solution,
        (None, ItemKind::Warning) => "Follow system hardening best practices".to_string(),
        (None, ItemKind::Suggestion) => item.text.clone(),
    };
    configuration_finding(
        truncate_chars(&item.text, NAME_LIMIT),
        severity,
        cvss,
        description,
        recommendation,
    )
}
