//! Signal routing: classifies an incoming signal into a section.
//!
//! Routing is a pure, total function over `(category, name)`: it never
//! fails and has no side effects. Unknown categories fall back to the
//! system section.

use serde::{Deserialize, Serialize};

/// The internal bucket a signal is routed into.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SectionKey {
    Programs,
    Network,
    Behaviour,
    Files,
    System,
}

impl SectionKey {
    /// Stable string form used in unique keys and aggregate segments.
    pub fn as_str(&self) -> &'static str {
        match self {
            SectionKey::Programs => "programs",
            SectionKey::Network => "network",
            SectionKey::Behaviour => "behaviour",
            SectionKey::Files => "files",
            SectionKey::System => "system",
        }
    }

    /// All routable sections, in display order.
    pub fn all() -> [SectionKey; 5] {
        [
            SectionKey::Programs,
            SectionKey::Network,
            SectionKey::Behaviour,
            SectionKey::Files,
            SectionKey::System,
        ]
    }
}

impl std::fmt::Display for SectionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Declarative category → section rules; first prefix match wins.
const CATEGORY_RULES: &[(&str, SectionKey)] = &[
    ("programs", SectionKey::Programs),
    ("process", SectionKey::Programs),
    ("proc", SectionKey::Programs),
    ("automation", SectionKey::Programs),
    ("auto", SectionKey::Programs),
    ("macro", SectionKey::Programs),
    ("network", SectionKey::Network),
    ("net", SectionKey::Network),
    ("dns", SectionKey::Network),
    ("conn", SectionKey::Network),
    ("traffic", SectionKey::Network),
    ("behaviour", SectionKey::Behaviour),
    ("behavior", SectionKey::Behaviour),
    ("input", SectionKey::Behaviour),
    ("activity", SectionKey::Behaviour),
    ("files", SectionKey::Files),
    ("file", SectionKey::Files),
    ("fs", SectionKey::Files),
    ("system", SectionKey::System),
    ("sys", SectionKey::System),
];

/// Routes a signal into a section from its category and name.
///
/// A `dns:`-style name wins over the category so DNS-class detections
/// land in the network section even when reported under a generic
/// category.
pub fn route(category: &str, name: &str) -> SectionKey {
    if name.to_ascii_lowercase().starts_with("dns:") {
        return SectionKey::Network;
    }

    let category = category.trim().to_ascii_lowercase();
    for (prefix, section) in CATEGORY_RULES {
        if category.starts_with(prefix) {
            return *section;
        }
    }
    SectionKey::System
}

/// Whether a category participates in cross-category program
/// consolidation.
pub fn is_program_category(category: &str) -> bool {
    let category = category.trim().to_ascii_lowercase();
    ["programs", "process", "proc", "automation", "auto", "macro"]
        .iter()
        .any(|p| category.starts_with(p))
}
