use crate::catalog::ClipRecord;
use std::collections::HashSet;

/// Outcome of checking a clip object's size
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClipDecision {
    /// Object is large enough to hold a recording
    Accepted,
    /// Object is blank or truncated
    TooSmall { size: u64 },
}

/// Classify an object by size; `size == threshold` is rejected
pub fn classify(size: u64, threshold: u64) -> ClipDecision {
    if size <= threshold {
        ClipDecision::TooSmall { size }
    } else {
        ClipDecision::Accepted
    }
}

/// Blank out age and gender for rows of minority locales
pub fn scrub(mut record: ClipRecord, is_minority: bool) -> ClipRecord {
    if is_minority {
        record.age = Some(String::new());
        record.gender = Some(String::new());
    }
    record
}

/// Row-level policy shared by every row of a run
///
/// Holds the size threshold and the set of locales whose demographics are
/// scrubbed because they have too few speakers to stay anonymous.
#[derive(Debug, Clone)]
pub struct ClipClassifier {
    min_clip_bytes: u64,
    minority_locales: HashSet<String>,
}

impl ClipClassifier {
    pub fn new(min_clip_bytes: u64, minority_locales: HashSet<String>) -> Self {
        Self {
            min_clip_bytes,
            minority_locales,
        }
    }

    pub fn is_minority(&self, locale: &str) -> bool {
        self.minority_locales.contains(locale)
    }

    pub fn classify(&self, size: u64) -> ClipDecision {
        classify(size, self.min_clip_bytes)
    }

    pub fn scrub(&self, record: ClipRecord) -> ClipRecord {
        let is_minority = self.is_minority(&record.locale);
        scrub(record, is_minority)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_record(locale: &str) -> ClipRecord {
        ClipRecord {
            id: 1,
            client_id: "client-a".to_string(),
            path: "client-a/1.mp3".to_string(),
            sentence: "A sentence.".to_string(),
            up_votes: Some(2),
            down_votes: Some(0),
            age: Some("twenties".to_string()),
            gender: Some("male".to_string()),
            accent: Some("us".to_string()),
            locale: locale.to_string(),
            segment: None,
        }
    }

    #[test]
    fn test_classify_boundary_is_closed() {
        assert_eq!(classify(256, 256), ClipDecision::TooSmall { size: 256 });
        assert_eq!(classify(257, 256), ClipDecision::Accepted);
        assert_eq!(classify(0, 256), ClipDecision::TooSmall { size: 0 });
    }

    #[test]
    fn test_classify_uses_configured_threshold() {
        let classifier = ClipClassifier::new(128, HashSet::new());
        assert_eq!(classifier.classify(129), ClipDecision::Accepted);
        assert_eq!(classifier.classify(128), ClipDecision::TooSmall { size: 128 });
    }

    #[test]
    fn test_classify_all_sizes_around_threshold() {
        for size in 0..=512u64 {
            let expected = if size <= 300 {
                ClipDecision::TooSmall { size }
            } else {
                ClipDecision::Accepted
            };
            assert_eq!(classify(size, 300), expected, "size {size}");
        }
    }

    #[test]
    fn test_scrub_minority_only_touches_age_and_gender() {
        let original = create_test_record("fr");
        let scrubbed = scrub(original.clone(), true);

        assert_eq!(scrubbed.age.as_deref(), Some(""));
        assert_eq!(scrubbed.gender.as_deref(), Some(""));
        assert_eq!(
            ClipRecord {
                age: original.age.clone(),
                gender: original.gender.clone(),
                ..scrubbed
            },
            original
        );
    }

    #[test]
    fn test_scrub_majority_is_identity() {
        let original = create_test_record("en");
        assert_eq!(scrub(original.clone(), false), original);
    }

    #[test]
    fn test_classifier_scrubs_by_locale() {
        let classifier = ClipClassifier::new(256, HashSet::from(["fr".to_string()]));

        let fr = classifier.scrub(create_test_record("fr"));
        let en = classifier.scrub(create_test_record("en"));

        assert!(classifier.is_minority("fr"));
        assert_eq!(fr.age.as_deref(), Some(""));
        assert_eq!(en.age.as_deref(), Some("twenties"));
    }
}
