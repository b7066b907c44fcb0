//! Unique-key and program-identity derivation.
//!
//! The unique key is the deduplication identity of a signal; the program
//! identity is a normalized executable/script name that lets detections of
//! the same artifact reported through different categories collapse into
//! one record. Extraction is an ordered list of matchers where the first
//! match wins, so each heuristic stays independently testable.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::model::Signal;
use crate::router::SectionKey;

/// Maximum length of the artifact fragment kept from a details string.
const ARTIFACT_MAX_LEN: usize = 48;

static PROC_HINT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)proc=([A-Za-z0-9_.\-]+)").expect("proc hint regex"));

static FILE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b([A-Za-z0-9_\-]+)\.(exe|dll|bat|cmd|ps1|psm1|py|pyw|js|vbs|sh|jar|scr|msi|ahk)\b")
        .expect("file regex")
});

static PID_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)pid=(\d+)").expect("pid regex"));

static VIA_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)via=([A-Za-z0-9_.\-]+)").expect("via regex"));

static VOLATILE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(pid|port|hash|ts|timestamp|score)=[0-9a-fx.\-:]+").expect("volatile regex")
});

static MULTIPLIER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\s*\[x\d+\]").expect("multiplier regex"));

/// Generic suffix words stripped from a name before identity extraction.
const GENERIC_SUFFIXES: &[&str] = &["bot", "tool", "launcher", "script", "detected", "running"];

/// Descriptive prefixes stripped together with their following noun.
const DESCRIPTIVE_PREFIXES: &[&str] = &["suspicious", "possible", "unknown", "detected"];
const PREFIX_NOUNS: &[&str] = &["code", "entropy", "process"];

/// Identity results equal to these are too generic to merge on.
const GENERIC_IDENTITIES: &[&str] = &["script", "process", "program"];

/// Alias table applied to resolved identities.
const ALIASES: &[(&str, &str)] = &[
    ("pwsh", "powershell"),
    ("powershell_ise", "powershell"),
    ("py", "python"),
    ("python3", "python"),
    ("pythonw", "python"),
    ("node", "nodejs"),
    ("wscript", "wsh"),
    ("cscript", "wsh"),
];

/// Messaging applications that surface under multiple detection paths;
/// all their signals merge into one key per device.
const MESSAGING_KEYWORDS: &[&str] = &["telegram", "discord", "whatsapp", "skype", "viber"];

/// Allow-listed generic DNS detection patterns. Signals named
/// `dns:<pattern> …` are keyed by pattern only, so many domains of one
/// class collapse into a single record.
const DNS_PATTERNS: &[&str] = &["tunnel", "dga", "beacon", "fastflux", "exfil"];

/// Strips any `[xN]` multiplier markers from a details string.
pub fn strip_multiplier(details: &str) -> String {
    MULTIPLIER_RE.replace_all(details, "").trim().to_string()
}

/// True if the details already embed their own multiplier marker.
pub fn has_multiplier(details: &str) -> bool {
    MULTIPLIER_RE.is_match(details)
}

/// Matcher 1: explicit `proc=<name>` hint in details.
fn match_proc_hint(details: &str) -> Option<String> {
    PROC_HINT_RE
        .captures(details)
        .map(|c| stem(&c[1]).to_ascii_lowercase())
}

/// Matchers 2/3: filename with a known executable/script extension.
fn match_filename(text: &str) -> Option<String> {
    FILE_RE.captures(text).map(|c| c[1].to_ascii_lowercase())
}

/// Matcher 4: normalize the free-form name down to a candidate identity.
fn match_normalized_name(name: &str) -> Option<String> {
    let mut words: Vec<String> = name
        .to_ascii_lowercase()
        .split(|c: char| c.is_whitespace())
        .filter(|w| !w.is_empty())
        .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric() && c != ':' && c != '-' && c != '.').to_string())
        .filter(|w| !w.is_empty())
        .collect();

    // Strip descriptive prefixes plus their following noun.
    while let Some(first) = words.first() {
        let first = first.trim_end_matches(':');
        if DESCRIPTIVE_PREFIXES.contains(&first) {
            words.remove(0);
            if let Some(next) = words.first() {
                if PREFIX_NOUNS.contains(&next.trim_end_matches(':')) {
                    words.remove(0);
                }
            }
        } else {
            break;
        }
    }

    // Strip trailing generic suffix words.
    while let Some(last) = words.last() {
        if GENERIC_SUFFIXES.contains(&last.as_str()) {
            words.pop();
        } else {
            break;
        }
    }

    let mut candidate = words.join(" ").trim().to_string();
    if candidate.is_empty() {
        return None;
    }

    // Drop a file extension if one survived.
    candidate = stem(&candidate).to_string();

    // If a separator remains, the identity is the last delimited token.
    if candidate.contains(':') || candidate.contains('-') {
        if let Some(tail) = candidate.rsplit([':', '-']).next() {
            candidate = tail.trim().to_string();
        }
    }

    // Suffix words can reappear after tokenization.
    for suffix in GENERIC_SUFFIXES {
        if let Some(prefix) = candidate.strip_suffix(suffix) {
            if !prefix.is_empty() {
                candidate = prefix.trim().to_string();
            }
        }
    }

    if candidate.is_empty() {
        None
    } else {
        Some(candidate)
    }
}

/// Matcher 5: alias and rejection filter.
fn finalize_identity(candidate: String) -> Option<String> {
    let mut identity = candidate;
    for (from, to) in ALIASES {
        if identity == *from {
            identity = to.to_string();
        }
    }
    if GENERIC_IDENTITIES.contains(&identity.as_str()) {
        return None;
    }
    if identity
        .chars()
        .any(|c| !(c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == ' '))
    {
        return None;
    }
    Some(identity)
}

fn stem(name: &str) -> &str {
    match name.rsplit_once('.') {
        Some((base, ext)) if !base.is_empty() && ext.len() <= 4 => base,
        _ => name,
    }
}

/// Resolves the program identity of a signal, if any.
///
/// Matchers run in priority order: an explicit `proc=` hint beats a
/// filename in the details, which beats a filename in the name, which
/// beats name normalization. The alias/rejection filter applies to all.
pub fn program_identity(signal: &Signal) -> Option<String> {
    let candidate = match_proc_hint(&signal.details)
        .or_else(|| match_filename(&signal.details))
        .or_else(|| match_filename(&signal.name))
        .or_else(|| match_normalized_name(&signal.name))?;
    finalize_identity(candidate)
}

/// Extracts the messaging-app keyword mentioned by a signal, if any.
fn messaging_app(signal: &Signal) -> Option<&'static str> {
    let name = signal.name.to_ascii_lowercase();
    let details = signal.details.to_ascii_lowercase();
    MESSAGING_KEYWORDS
        .iter()
        .find(|kw| name.contains(*kw) || details.contains(*kw))
        .copied()
}

/// Matches `dns:<pattern> …` names against the pattern allow-list.
fn dns_pattern(name: &str) -> Option<&'static str> {
    let lower = name.to_ascii_lowercase();
    let rest = lower.strip_prefix("dns:")?;
    let token = rest.split_whitespace().next()?;
    DNS_PATTERNS.iter().find(|p| token.starts_with(*p)).copied()
}

/// Derives the stable artifact fragment of a details string: a `via=`
/// tag, a process/file reference, or the details with volatile tokens
/// stripped and digits squashed, truncated.
pub fn artifact(signal: &Signal) -> String {
    if let Some(c) = VIA_RE.captures(&signal.details) {
        return format!("via:{}", c[1].to_ascii_lowercase());
    }
    if let Some(hint) = match_proc_hint(&signal.details) {
        return format!("proc:{hint}");
    }
    if let Some(file) = match_filename(&signal.details) {
        return format!("file:{file}");
    }

    let stripped = VOLATILE_RE.replace_all(&signal.details, "");
    let stripped = strip_multiplier(&stripped);
    let squashed: String = stripped
        .chars()
        .map(|c| if c.is_ascii_digit() { '#' } else { c })
        .collect();
    let mut fragment = squashed.trim().to_ascii_lowercase();
    if fragment.len() > ARTIFACT_MAX_LEN {
        fragment.truncate(ARTIFACT_MAX_LEN);
    }
    fragment
}

/// Derives the deduplication key for a signal.
///
/// Priority: messaging-app merge, DNS-pattern collapse, program-identity
/// key for process/automation categories, then the generic
/// device/category/section/name/artifact key.
pub fn unique_key(signal: &Signal, section: SectionKey, identity: Option<&str>) -> String {
    if let Some(app) = messaging_app(signal) {
        return match PID_RE.captures(&signal.details) {
            Some(c) => format!("{}:messaging:{}:{}", signal.device_id, app, &c[1]),
            None => format!("{}:messaging:{}", signal.device_id, app),
        };
    }

    if let Some(pattern) = dns_pattern(&signal.name) {
        return format!("{}:dns:{}", signal.device_id, pattern);
    }

    if crate::router::is_program_category(&signal.category) {
        if let Some(identity) = identity {
            return format!(
                "{}:program:{}:{}",
                signal.device_id,
                identity,
                artifact(signal)
            );
        }
    }

    format!(
        "{}:{}:{}:{}:{}",
        signal.device_id,
        signal.category.to_ascii_lowercase(),
        section,
        signal.name.to_ascii_lowercase(),
        artifact(signal)
    )
}

/// Canonical key a consolidated program record is re-keyed under.
pub fn program_key(device_id: &str, identity: &str) -> String {
    format!("{device_id}:program:{identity}")
}
