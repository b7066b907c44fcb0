//! Cross-category program consolidation.
//!
//! Two agents (or two scan paths on one agent) can report the same
//! program under different categories, producing records with different
//! unique keys. When a program identity resolves, all live records for
//! that device and identity are folded into a single record so the
//! snapshot shows one entry per program.

use std::collections::HashMap;

use crate::dedup;
use crate::keys;
use crate::model::StoredDetection;
use crate::router::SectionKey;

/// Folds every live record sharing `identity` on `device_id` into
/// `base`, removing them from their sections.
///
/// The merged record keeps the newest name and timestamp (from `base`),
/// the earliest `first_seen`, the highest severity, and the sum of
/// repeat counts. Detail strings are unioned with any multiplier
/// markers stripped, then a single marker reflecting the combined count
/// is re-applied.
pub fn merge_program_records(
    sections: &mut HashMap<SectionKey, Vec<StoredDetection>>,
    device_id: &str,
    identity: &str,
    mut base: StoredDetection,
) -> StoredDetection {
    let mut details: Vec<String> = Vec::new();
    let base_detail = keys::strip_multiplier(&base.details);
    if !base_detail.is_empty() {
        details.push(base_detail);
    }

    for section in sections.values_mut() {
        let mut idx: Vec<usize> = section
            .iter()
            .enumerate()
            .filter(|(_, d)| {
                d.device_id == device_id
                    && d.id != base.id
                    && d.program_identity.as_deref() == Some(identity)
            })
            .map(|(i, _)| i)
            .collect();

        // Remove from the back so earlier indices stay valid.
        idx.reverse();
        for i in idx {
            let absorbed = section.remove(i);
            base.status = base.status.max(absorbed.status);
            base.detections += absorbed.detections;
            base.first_seen = base.first_seen.min(absorbed.first_seen);
            let d = keys::strip_multiplier(&absorbed.details);
            if !d.is_empty() && !details.contains(&d) {
                details.push(d);
            }
        }
    }

    base.details = dedup::apply_multiplier(&details.join(" | "), base.detections);
    base.unique_key = keys::program_key(device_id, identity);
    base.program_identity = Some(identity.to_string());
    base
}

/// Finds the section and index of a live record for `identity` on
/// `device_id`, preferring the programs section.
pub fn find_program_record(
    sections: &HashMap<SectionKey, Vec<StoredDetection>>,
    device_id: &str,
    identity: &str,
) -> Option<(SectionKey, usize)> {
    let mut order = vec![SectionKey::Programs];
    order.extend(SectionKey::all().into_iter().filter(|s| *s != SectionKey::Programs));
    for section in order {
        if let Some(list) = sections.get(&section) {
            if let Some(i) = list.iter().position(|d| {
                d.device_id == device_id && d.program_identity.as_deref() == Some(identity)
            }) {
                return Some((section, i));
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SignalStatus;

    fn record(
        id: &str,
        section: SectionKey,
        status: SignalStatus,
        identity: Option<&str>,
        details: &str,
        detections: u32,
    ) -> StoredDetection {
        StoredDetection {
            id: id.to_string(),
            timestamp: 100,
            category: section.as_str().to_string(),
            name: format!("detection {id}"),
            status,
            details: details.to_string(),
            device_id: "d1".to_string(),
            section,
            unique_key: format!("d1:{section}:{id}"),
            artifact: "a".to_string(),
            program_identity: identity.map(String::from),
            first_seen: 100,
            detections,
        }
    }

    #[test]
    fn test_merge_sums_counts_and_takes_max_severity() {
        let mut sections: HashMap<SectionKey, Vec<StoredDetection>> = HashMap::new();
        sections.entry(SectionKey::Programs).or_default().push(record(
            "r1",
            SectionKey::Programs,
            SignalStatus::Alert,
            Some("foo"),
            "spawned from temp",
            1,
        ));
        let base = record(
            "r2",
            SectionKey::Programs,
            SignalStatus::Critical,
            Some("foo"),
            "high entropy section",
            1,
        );

        let merged = merge_program_records(&mut sections, "d1", "foo", base);

        assert_eq!(merged.status, SignalStatus::Critical);
        assert_eq!(merged.detections, 2);
        assert!(merged.details.contains("high entropy section"));
        assert!(merged.details.contains("spawned from temp"));
        assert!(merged.details.ends_with("[x2]"));
        assert_eq!(merged.unique_key, "d1:program:foo");
        assert!(sections.get(&SectionKey::Programs).unwrap().is_empty());
    }

    #[test]
    fn test_merge_reaches_across_sections() {
        let mut sections: HashMap<SectionKey, Vec<StoredDetection>> = HashMap::new();
        sections.entry(SectionKey::System).or_default().push(record(
            "r1",
            SectionKey::System,
            SignalStatus::Warn,
            Some("foo"),
            "loaded driver",
            2,
        ));
        let base = record(
            "r2",
            SectionKey::Programs,
            SignalStatus::Alert,
            Some("foo"),
            "",
            1,
        );

        let merged = merge_program_records(&mut sections, "d1", "foo", base);
        assert_eq!(merged.detections, 3);
        assert_eq!(merged.status, SignalStatus::Alert);
        assert!(sections.get(&SectionKey::System).unwrap().is_empty());
    }

    #[test]
    fn test_merge_ignores_other_devices_and_identities() {
        let mut sections: HashMap<SectionKey, Vec<StoredDetection>> = HashMap::new();
        let mut other_dev = record("r1", SectionKey::Programs, SignalStatus::Warn, Some("foo"), "", 1);
        other_dev.device_id = "d2".to_string();
        sections.entry(SectionKey::Programs).or_default().push(other_dev);
        sections.entry(SectionKey::Programs).or_default().push(record(
            "r3",
            SectionKey::Programs,
            SignalStatus::Warn,
            Some("bar"),
            "",
            1,
        ));

        let base = record("r2", SectionKey::Programs, SignalStatus::Alert, Some("foo"), "", 1);
        let merged = merge_program_records(&mut sections, "d1", "foo", base);
        assert_eq!(merged.detections, 1);
        assert_eq!(sections.get(&SectionKey::Programs).unwrap().len(), 2);
    }

    #[test]
    fn test_merge_strips_stacked_markers() {
        let mut sections: HashMap<SectionKey, Vec<StoredDetection>> = HashMap::new();
        sections.entry(SectionKey::Programs).or_default().push(record(
            "r1",
            SectionKey::Programs,
            SignalStatus::Warn,
            Some("foo"),
            "seen [x4]",
            4,
        ));
        let base = record("r2", SectionKey::Programs, SignalStatus::Warn, Some("foo"), "seen", 1);
        let merged = merge_program_records(&mut sections, "d1", "foo", base);
        assert_eq!(merged.detections, 5);
        assert_eq!(merged.details, "seen [x5]");
    }

    #[test]
    fn test_find_prefers_programs_section() {
        let mut sections: HashMap<SectionKey, Vec<StoredDetection>> = HashMap::new();
        sections.entry(SectionKey::System).or_default().push(record(
            "r1",
            SectionKey::System,
            SignalStatus::Warn,
            Some("foo"),
            "",
            1,
        ));
        sections.entry(SectionKey::Programs).or_default().push(record(
            "r2",
            SectionKey::Programs,
            SignalStatus::Warn,
            Some("foo"),
            "",
            1,
        ));

        let found = find_program_record(&sections, "d1", "foo");
        assert_eq!(found, Some((SectionKey::Programs, 0)));
    }
}
