//! Field validation: raw form fields → [`SubmissionRecord`].
//!
//! The check is presence-only. A key that is missing entirely is a schema
//! violation; a key with an empty value is accepted and left for the
//! renderer to display as a placeholder. Validation runs before any file
//! or subprocess work so a bad request costs nothing.

use crate::error::CertError;
use crate::pipeline::upload::ImageUpload;
use std::collections::{BTreeMap, HashMap};

/// Form keys every submission must carry, in the order they are checked.
pub const REQUIRED_FIELDS: &[&str] = &[
    "child_name",
    "guardian_name",
    "birthday",
    "child_id",
    "child_phone",
    "location",
    "donor_name",
    "donor_phone",
    "address",
    "month",
    "amount",
];

/// A submission exactly as received, before validation.
#[derive(Debug, Clone, Default)]
pub struct Submission {
    /// Text fields by form key. The first value wins when a key repeats.
    pub fields: HashMap<String, String>,
    /// Optional photo attachment.
    pub image: Option<ImageUpload>,
}

impl Submission {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style helper for tests and the CLI.
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.entry(key.into()).or_insert_with(|| value.into());
        self
    }

    pub fn with_image(mut self, image: ImageUpload) -> Self {
        self.image = Some(image);
        self
    }

    /// Bytes the submission occupies, checked against the upload ceiling.
    pub fn payload_size(&self) -> usize {
        let text: usize = self.fields.iter().map(|(k, v)| k.len() + v.len()).sum();
        let image = self.image.as_ref().map_or(0, |img| {
            img.bytes.len() + img.filename.as_ref().map_or(0, String::len)
        });
        text + image
    }
}

/// A validated submission: every required key present, nothing else.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmissionRecord {
    fields: BTreeMap<String, String>,
}

impl SubmissionRecord {
    /// Value of a required field (possibly empty).
    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }

    pub fn child_name(&self) -> &str {
        self.get("child_name").unwrap_or_default()
    }

    pub fn fields(&self) -> &BTreeMap<String, String> {
        &self.fields
    }
}

/// Check `submission` against [`REQUIRED_FIELDS`].
///
/// # Errors
/// [`CertError::Validation`] naming the first missing key.
pub fn validate(submission: &Submission) -> Result<SubmissionRecord, CertError> {
    let mut fields = BTreeMap::new();
    for &key in REQUIRED_FIELDS {
        let value = submission
            .fields
            .get(key)
            .ok_or_else(|| CertError::Validation {
                field: key.to_string(),
            })?;
        fields.insert(key.to_string(), value.clone());
    }
    Ok(SubmissionRecord { fields })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn complete_submission() -> Submission {
        REQUIRED_FIELDS
            .iter()
            .fold(Submission::new(), |s, key| s.with_field(*key, format!("{key}-value")))
    }

    #[test]
    fn complete_submission_validates() {
        let record = validate(&complete_submission()).expect("valid");
        assert_eq!(record.fields().len(), REQUIRED_FIELDS.len());
        assert_eq!(record.child_name(), "child_name-value");
    }

    #[test]
    fn every_missing_key_is_reported() {
        for &missing in REQUIRED_FIELDS {
            let mut s = complete_submission();
            s.fields.remove(missing);
            match validate(&s) {
                Err(CertError::Validation { field }) => assert_eq!(field, missing),
                other => panic!("expected validation error for {missing}, got {other:?}"),
            }
        }
    }

    #[test]
    fn empty_values_are_accepted() {
        let mut s = complete_submission();
        s.fields.insert("amount".into(), String::new());
        let record = validate(&s).expect("empty value is still present");
        assert_eq!(record.get("amount"), Some(""));
    }

    #[test]
    fn unknown_keys_are_dropped() {
        let s = complete_submission().with_field("csrf_token", "abc");
        let record = validate(&s).unwrap();
        assert_eq!(record.get("csrf_token"), None);
    }

    #[test]
    fn first_value_wins() {
        let s = Submission::new()
            .with_field("child_name", "first")
            .with_field("child_name", "second");
        assert_eq!(s.fields["child_name"], "first");
    }
}
