//! Line-oriented extraction of tool output into typed fragments.
//!
//! Every parser makes a single pass over the text and keeps one state value
//! that says which part of the output it is in. Parsers never fail: anything
//! they cannot recognise is skipped and the corresponding fields stay empty.

pub mod inventory;
pub mod lynis;
pub mod nmap;
pub mod severity;

use crate::models::{ApplicationRecord, HostFacts, SecurityFinding, ServiceRecord};

pub use inventory::parse_inventory;
pub use lynis::parse_lynis;
pub use nmap::parse_nmap;

/// What one tool contributed to a scan.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParsedFragment {
    pub host: HostFacts,
    pub services: Vec<ServiceRecord>,
    pub applications: Vec<ApplicationRecord>,
    pub findings: Vec<SecurityFinding>,
    pub hardening_index: Option<u8>,
    pub tests_performed: Option<u32>,
}

impl ParsedFragment {
    pub fn is_empty(&self) -> bool {
        self == &ParsedFragment::default()
    }
}

/// Cuts `text` to at most `max` characters without splitting a code point.
pub(crate) fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}

pub(crate) fn non_empty(text: &str) -> Option<String> {
    let trimmed = text.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}
