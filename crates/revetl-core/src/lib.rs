//! Core domain model and error taxonomy for revetl.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "revetl-core";

/// Human-readable review date format used by the source dataset ("01 15, 2014").
pub const REVIEW_TIME_FORMAT: &str = "%m %d, %Y";

/// Error taxonomy shared across every loader and the analytics engine.
///
/// All variants are fatal to the current operation; nothing is caught and
/// retried. Store crates map driver errors into these variants through the
/// constructor helpers (orphan rules prevent `From` impls on foreign types).
#[derive(Debug, Error)]
pub enum EtlError {
    #[error("store unreachable: {0}")]
    Connectivity(String),
    #[error("invalid record: {0}")]
    Validation(String),
    #[error("schema integrity: {0}")]
    Integrity(String),
    #[error("not found: {0}")]
    NotFound(String),
}

impl EtlError {
    pub fn connectivity(err: impl std::fmt::Display) -> Self {
        Self::Connectivity(err.to_string())
    }

    pub fn validation(err: impl std::fmt::Display) -> Self {
        Self::Validation(err.to_string())
    }

    pub fn integrity(err: impl std::fmt::Display) -> Self {
        Self::Integrity(err.to_string())
    }

    pub fn not_found(err: impl std::fmt::Display) -> Self {
        Self::NotFound(err.to_string())
    }
}

/// One line of a source review file, decoded leniently: absent fields fall
/// back to their defaults rather than rejecting the record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawReview {
    #[serde(rename = "reviewerID", default)]
    pub reviewer_id: String,
    #[serde(rename = "reviewerName", default)]
    pub reviewer_name: String,
    #[serde(default)]
    pub asin: String,
    /// `[helpful_votes, total_votes]` pair as shipped in the dataset.
    #[serde(default)]
    pub helpful: Vec<i64>,
    #[serde(default)]
    pub overall: f64,
    #[serde(default)]
    pub summary: String,
    #[serde(rename = "reviewText", default)]
    pub review_text: String,
    #[serde(rename = "reviewTime", default)]
    pub review_time: String,
    #[serde(rename = "unixReviewTime", default)]
    pub unix_review_time: i64,
}

impl RawReview {
    /// Parses the human-readable review date, e.g. "01 15, 2014" -> 2014-01-15.
    pub fn review_date(&self) -> Result<NaiveDate, EtlError> {
        parse_review_time(&self.review_time)
    }
}

/// All records of one source file together with the category derived from
/// its filename.
#[derive(Debug, Clone, PartialEq)]
pub struct CategoryBatch {
    pub category: String,
    pub records: Vec<RawReview>,
}

/// Row of the relational `Reviewers` table. Identity key is `id`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct ReviewerRow {
    pub id: String,
    pub name: String,
}

/// Row of the relational `Products` table: one per ingested category.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProductTypeRow {
    pub id: i64,
    pub label: String,
}

/// Row of the relational `Items` table; `product_type` references
/// `Products.id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemRow {
    pub id: i64,
    pub asin: String,
    pub product_type: i64,
}

pub fn parse_review_time(raw: &str) -> Result<NaiveDate, EtlError> {
    NaiveDate::parse_from_str(raw, REVIEW_TIME_FORMAT)
        .map_err(|err| EtlError::Validation(format!("review time {raw:?}: {err}")))
}

/// Renders a parsed review date the way the graph store carries it.
pub fn format_review_date(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn review_time_round_trips() {
        let date = parse_review_time("01 15, 2014").expect("valid date");
        assert_eq!(date, NaiveDate::from_ymd_opt(2014, 1, 15).unwrap());
        assert_eq!(format_review_date(date), "2014-01-15");
    }

    #[test]
    fn review_time_accepts_unpadded_day() {
        let date = parse_review_time("07 3, 2013").expect("valid date");
        assert_eq!(format_review_date(date), "2013-07-03");
    }

    #[test]
    fn malformed_review_time_is_a_validation_error() {
        let err = parse_review_time("2014-01-15").unwrap_err();
        assert!(matches!(err, EtlError::Validation(_)));
    }

    #[test]
    fn missing_fields_decode_to_defaults() {
        let record: RawReview =
            serde_json::from_str(r#"{"asin": "B000123", "overall": 4.0}"#).expect("decodes");
        assert_eq!(record.reviewer_id, "");
        assert_eq!(record.reviewer_name, "");
        assert_eq!(record.asin, "B000123");
        assert!(record.helpful.is_empty());
        assert_eq!(record.unix_review_time, 0);
    }

    #[test]
    fn full_record_decodes() {
        let line = r#"{"reviewerID": "A1", "reviewerName": "Alice", "asin": "B0001",
            "helpful": [2, 3], "overall": 5.0, "summary": "Great",
            "reviewText": "Loved it", "reviewTime": "01 15, 2014",
            "unixReviewTime": 1389744000}"#;
        let record: RawReview = serde_json::from_str(line).expect("decodes");
        assert_eq!(record.reviewer_id, "A1");
        assert_eq!(record.helpful, vec![2, 3]);
        assert_eq!(record.review_date().unwrap().to_string(), "2014-01-15");
    }
}
