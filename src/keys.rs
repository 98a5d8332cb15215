//! # Keys Module
//!
//! Derives composite business keys from the ordered identity terms configured
//! for a dataset, plus the two well-known key forms (triplet and occurrenceID)
//! used when remediating identifier collisions.

use crate::model::{dwc, CompositeKey, OccurrenceRecord, Term};
use thiserror::Error;
use tracing::warn;

/// Failure to derive a key for a single record.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyGenerationError {
    /// Every configured identity term was empty for the record.
    #[error("all identity terms ({terms}) were empty for record {record_id} in dataset {dataset_id}")]
    AllTermsEmpty {
        dataset_id: String,
        record_id: String,
        terms: String,
    },
    /// The dataset has no identity terms configured.
    #[error("no identity terms configured for dataset {dataset_id}")]
    NoTerms { dataset_id: String },
}

/// Collect the trimmed, non-empty values of `terms` in order.
fn extract_values<'r>(record: &'r OccurrenceRecord, terms: &[Term]) -> Vec<&'r str> {
    terms.iter().filter_map(|term| record.value(term)).collect()
}

fn term_list(terms: &[Term]) -> String {
    terms
        .iter()
        .map(Term::simple_name)
        .collect::<Vec<_>>()
        .join(",")
}

/// Build the composite key for `record`, failing when every term is empty.
pub fn build_key(
    dataset_id: &str,
    record: &OccurrenceRecord,
    terms: &[Term],
) -> Result<CompositeKey, KeyGenerationError> {
    if terms.is_empty() {
        return Err(KeyGenerationError::NoTerms {
            dataset_id: dataset_id.to_string(),
        });
    }
    let values = extract_values(record, terms);
    if values.is_empty() {
        let err = KeyGenerationError::AllTermsEmpty {
            dataset_id: dataset_id.to_string(),
            record_id: record.id.clone(),
            terms: term_list(terms),
        };
        warn!(dataset_id, record_id = %record.id, "{err}");
        return Err(err);
    }
    Ok(CompositeKey::join(dataset_id, values))
}

/// Build the composite key for a validation scan.
///
/// `None` is the empty sentinel: the record has no usable identity values.
/// Never fails, so one bad record cannot abort a bulk scan.
pub fn build_key_for_validation(
    dataset_id: &str,
    record: &OccurrenceRecord,
    terms: &[Term],
) -> Option<CompositeKey> {
    let values = extract_values(record, terms);
    if values.is_empty() {
        None
    } else {
        Some(CompositeKey::join(dataset_id, values))
    }
}

/// Key builder bound to one dataset and its ordered identity terms.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyBuilder {
    dataset_id: String,
    terms: Vec<Term>,
}

impl KeyBuilder {
    pub fn new(dataset_id: impl Into<String>, terms: Vec<Term>) -> Self {
        Self {
            dataset_id: dataset_id.into().trim().to_string(),
            terms,
        }
    }

    pub fn dataset_id(&self) -> &str {
        &self.dataset_id
    }

    pub fn terms(&self) -> &[Term] {
        &self.terms
    }

    /// Whether any identity term is configured for the dataset.
    pub fn has_terms(&self) -> bool {
        !self.terms.is_empty()
    }

    pub fn build_key(&self, record: &OccurrenceRecord) -> Result<CompositeKey, KeyGenerationError> {
        build_key(&self.dataset_id, record, &self.terms)
    }

    pub fn build_key_for_validation(&self, record: &OccurrenceRecord) -> Option<CompositeKey> {
        build_key_for_validation(&self.dataset_id, record, &self.terms)
    }
}

/// The two identity forms a record may be reachable by.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyForms {
    /// `dataset|institutionCode|collectionCode|catalogNumber`, when all three are present
    pub triplet: Option<CompositeKey>,
    /// `dataset|occurrenceID`, when present
    pub occurrence_id: Option<CompositeKey>,
}

impl KeyForms {
    pub fn for_record(dataset_id: &str, record: &OccurrenceRecord) -> Self {
        Self {
            triplet: triplet_key(dataset_id, record),
            occurrence_id: occurrence_id_key(dataset_id, record),
        }
    }

    /// Whether both forms could be derived.
    pub fn is_complete(&self) -> bool {
        self.triplet.is_some() && self.occurrence_id.is_some()
    }
}

/// Triplet-form key; all three triplet terms must be non-empty.
pub fn triplet_key(dataset_id: &str, record: &OccurrenceRecord) -> Option<CompositeKey> {
    let terms = [
        Term::new(dwc::INSTITUTION_CODE),
        Term::new(dwc::COLLECTION_CODE),
        Term::new(dwc::CATALOG_NUMBER),
    ];
    let values = extract_values(record, &terms);
    if values.len() == terms.len() {
        Some(CompositeKey::join(dataset_id, values))
    } else {
        None
    }
}

/// OccurrenceID-form key.
pub fn occurrence_id_key(dataset_id: &str, record: &OccurrenceRecord) -> Option<CompositeKey> {
    build_key_for_validation(dataset_id, record, &[Term::new(dwc::OCCURRENCE_ID)])
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn terms(names: &[&str]) -> Vec<Term> {
        names.iter().map(Term::new).collect()
    }

    #[test]
    fn test_build_key_skips_empty_terms() {
        let record = OccurrenceRecord::new("1")
            .with_term("catalogNumber", " C-100 ")
            .with_term("recordNumber", "")
            .with_term("fieldNumber", "F7");
        let key = build_key(
            "dr1",
            &record,
            &terms(&["catalogNumber", "recordNumber", "fieldNumber"]),
        )
        .unwrap();
        assert_eq!(key.as_str(), "dr1|C-100|F7");
    }

    #[test]
    fn test_build_key_order_is_significant() {
        let record = OccurrenceRecord::new("1")
            .with_term("catalogNumber", "C")
            .with_term("fieldNumber", "F");
        let a = build_key("dr1", &record, &terms(&["catalogNumber", "fieldNumber"])).unwrap();
        let b = build_key("dr1", &record, &terms(&["fieldNumber", "catalogNumber"])).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_all_empty_terms_fail() {
        let record = OccurrenceRecord::new("rec-9").with_term("catalogNumber", "  ");
        let err = build_key("dr1", &record, &terms(&["catalogNumber", "occurrenceID"]))
            .unwrap_err();
        assert_eq!(
            err,
            KeyGenerationError::AllTermsEmpty {
                dataset_id: "dr1".to_string(),
                record_id: "rec-9".to_string(),
                terms: "catalogNumber,occurrenceID".to_string(),
            }
        );
        assert!(err.to_string().contains("rec-9"));
        assert_eq!(
            build_key_for_validation("dr1", &record, &terms(&["catalogNumber", "occurrenceID"])),
            None
        );
    }

    #[test]
    fn test_no_terms_configured() {
        let record = OccurrenceRecord::new("1").with_term("catalogNumber", "C");
        let err = build_key("dr1", &record, &[]).unwrap_err();
        assert!(matches!(err, KeyGenerationError::NoTerms { .. }));
    }

    #[test]
    fn test_key_forms() {
        let record = OccurrenceRecord::new("1")
            .with_term("institutionCode", "NHM")
            .with_term("collectionCode", "Birds")
            .with_term("catalogNumber", "42")
            .with_term("occurrenceID", "urn:occ:42");
        let forms = KeyForms::for_record("ds", &record);
        assert!(forms.is_complete());
        assert_eq!(forms.triplet.unwrap().as_str(), "ds|NHM|Birds|42");
        assert_eq!(forms.occurrence_id.unwrap().as_str(), "ds|urn:occ:42");

        let partial = OccurrenceRecord::new("2")
            .with_term("institutionCode", "NHM")
            .with_term("catalogNumber", "42");
        let forms = KeyForms::for_record("ds", &partial);
        assert_eq!(forms.triplet, None);
        assert_eq!(forms.occurrence_id, None);
    }

    proptest! {
        #[test]
        fn prop_build_key_is_deterministic(values in proptest::collection::vec("[a-zA-Z0-9 |\\\\]{0,12}", 1..6)) {
            let names: Vec<String> = (0..values.len()).map(|i| format!("term{i}")).collect();
            let term_list: Vec<Term> = names.iter().map(Term::new).collect();
            let mut first = OccurrenceRecord::new("a");
            let mut second = OccurrenceRecord::new("b");
            for (name, value) in names.iter().zip(&values) {
                first = first.with_term(name.as_str(), value.clone());
                second = second.with_term(name.as_str(), value.clone());
            }
            let a = build_key_for_validation("ds", &first, &term_list);
            let b = build_key_for_validation("ds", &second, &term_list);
            prop_assert_eq!(&a, &b);
            let all_empty = values.iter().all(|v| {
                let v = v.trim();
                v.is_empty() || v.eq_ignore_ascii_case("null")
            });
            prop_assert_eq!(a.is_none(), all_empty);
            prop_assert_eq!(build_key("ds", &first, &term_list).is_err(), all_empty);
        }
    }
}
