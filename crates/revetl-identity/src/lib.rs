//! Identity extraction: deduplicated reviewer / product-type / item rows
//! derived from raw record batches, with incremental-merge rules.
//!
//! Everything here is pure; the caller supplies the previously persisted
//! identity set (existing reviewer ids, current table row counts) and gets
//! back exactly the rows to insert. Outputs are deterministic: reviewers
//! sort by id, items by asin.

use std::collections::{BTreeSet, HashMap, HashSet};

use revetl_core::{CategoryBatch, ItemRow, ProductTypeRow, RawReview, ReviewerRow};
use tracing::debug;

pub const CRATE_NAME: &str = "revetl-identity";

/// Outcome of merging candidate reviewers against the persisted set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReviewerMerge {
    /// Rows to insert, sorted by reviewer id.
    pub rows: Vec<ReviewerRow>,
    /// Distinct reviewer ids observed in the batch.
    pub candidates: usize,
    /// Candidates dropped because their id already exists in the store.
    pub skipped_existing: usize,
}

/// Identity rows for a one-time bulk load of a whole dataset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkIdentities {
    pub reviewers: Vec<ReviewerRow>,
    pub product_types: Vec<ProductTypeRow>,
    pub items: Vec<ItemRow>,
}

/// Builds the deduplicated (id, name) candidate set for a batch.
///
/// A reviewer id that ever appears with a non-empty name keeps that name
/// (first occurrence in input order wins when several distinct names show
/// up); an id only ever seen unnamed is kept as (id, ""). A record with no
/// id field contributes the degenerate id "" rather than being rejected.
pub fn reviewer_rows(records: &[RawReview]) -> Vec<ReviewerRow> {
    let mut name_by_id: HashMap<&str, &str> = HashMap::new();
    for record in records {
        let entry = name_by_id.entry(record.reviewer_id.as_str()).or_default();
        if entry.is_empty() && !record.reviewer_name.is_empty() {
            *entry = record.reviewer_name.as_str();
        }
    }

    let mut rows: Vec<ReviewerRow> = name_by_id
        .into_iter()
        .map(|(id, name)| ReviewerRow {
            id: id.to_string(),
            name: name.to_string(),
        })
        .collect();
    rows.sort();
    rows
}

/// Subtracts reviewers already persisted. An id present in the store blocks
/// any new row for that id, regardless of the stored name.
pub fn merge_new_reviewers(
    candidates: Vec<ReviewerRow>,
    existing_ids: &HashSet<String>,
) -> ReviewerMerge {
    let total = candidates.len();
    let rows: Vec<ReviewerRow> = candidates
        .into_iter()
        .filter(|row| !existing_ids.contains(&row.id))
        .collect();
    let skipped_existing = total - rows.len();
    debug!(candidates = total, inserted = rows.len(), skipped_existing, "reviewer merge");
    ReviewerMerge {
        rows,
        candidates: total,
        skipped_existing,
    }
}

/// One product-type row per load operation; the id continues the 0-based
/// sequence after the current `Products` row count.
pub fn product_type_row(label: &str, existing_count: i64) -> ProductTypeRow {
    ProductTypeRow {
        id: existing_count,
        label: label.to_string(),
    }
}

/// Distinct asins of a batch, sorted lexicographically, with ids continuing
/// the sequence after the current `Items` row count: a batch of k new asins
/// against n existing rows yields ids n+1 ..= n+k.
pub fn item_rows(records: &[RawReview], product_type: i64, existing_count: i64) -> Vec<ItemRow> {
    let asins: BTreeSet<&str> = records.iter().map(|r| r.asin.as_str()).collect();
    asins
        .into_iter()
        .enumerate()
        .map(|(offset, asin)| ItemRow {
            id: existing_count + 1 + offset as i64,
            asin: asin.to_string(),
            product_type,
        })
        .collect()
}

/// Derives all identity rows for a bulk load of an entire dataset.
///
/// Product-type ids follow batch order (the reader yields batches in sorted
/// filename order); item ids thread across batches starting at 1. Asins are
/// deduplicated per batch only: the same asin under two categories yields
/// two item rows, as in incremental loads.
pub fn extract_bulk(batches: &[CategoryBatch]) -> BulkIdentities {
    let all_records: Vec<RawReview> = batches
        .iter()
        .flat_map(|batch| batch.records.iter().cloned())
        .collect();
    let reviewers = reviewer_rows(&all_records);

    let mut product_types = Vec::with_capacity(batches.len());
    let mut items = Vec::new();
    let mut item_count = 0i64;
    for (index, batch) in batches.iter().enumerate() {
        let type_row = product_type_row(&batch.category, index as i64);
        let batch_items = item_rows(&batch.records, type_row.id, item_count);
        item_count += batch_items.len() as i64;
        product_types.push(type_row);
        items.extend(batch_items);
    }

    BulkIdentities {
        reviewers,
        product_types,
        items,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, name: &str, asin: &str) -> RawReview {
        RawReview {
            reviewer_id: id.to_string(),
            reviewer_name: name.to_string(),
            asin: asin.to_string(),
            ..RawReview::default()
        }
    }

    #[test]
    fn named_record_wins_in_either_order() {
        let forward = vec![record("1", "", "B01"), record("1", "Alice", "B02")];
        let backward = vec![record("1", "Alice", "B02"), record("1", "", "B01")];

        for records in [forward, backward] {
            let rows = reviewer_rows(&records);
            assert_eq!(
                rows,
                vec![ReviewerRow {
                    id: "1".to_string(),
                    name: "Alice".to_string()
                }]
            );
        }
    }

    #[test]
    fn unnamed_only_id_is_retained() {
        let rows = reviewer_rows(&[record("A9", "", "B01"), record("A9", "", "B02")]);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, "A9");
        assert_eq!(rows[0].name, "");
    }

    #[test]
    fn first_nonempty_name_wins() {
        let rows = reviewer_rows(&[record("A1", "Alice", "B01"), record("A1", "Alicia", "B02")]);
        assert_eq!(rows[0].name, "Alice");
    }

    #[test]
    fn missing_id_contributes_degenerate_empty_id() {
        let rows = reviewer_rows(&[record("", "Ghost", "B01")]);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, "");
        assert_eq!(rows[0].name, "Ghost");
    }

    #[test]
    fn merge_is_idempotent() {
        let records = vec![
            record("A1", "Alice", "B01"),
            record("A2", "", "B02"),
            record("A3", "Carol", "B03"),
        ];
        let mut existing: HashSet<String> = HashSet::new();

        let first = merge_new_reviewers(reviewer_rows(&records), &existing);
        assert_eq!(first.rows.len(), 3);
        assert_eq!(first.skipped_existing, 0);

        existing.extend(first.rows.iter().map(|r| r.id.clone()));
        let second = merge_new_reviewers(reviewer_rows(&records), &existing);
        assert!(second.rows.is_empty());
        assert_eq!(second.skipped_existing, 3);
    }

    #[test]
    fn existing_id_blocks_any_new_row_regardless_of_name() {
        let existing: HashSet<String> = ["A1".to_string()].into_iter().collect();
        let merge = merge_new_reviewers(reviewer_rows(&[record("A1", "Alice", "B01")]), &existing);
        assert!(merge.rows.is_empty());
        assert_eq!(merge.candidates, 1);
        assert_eq!(merge.skipped_existing, 1);
    }

    #[test]
    fn item_ids_continue_after_existing_rows_without_gaps() {
        let records = vec![
            record("A1", "", "B03"),
            record("A2", "", "B01"),
            record("A3", "", "B02"),
            record("A4", "", "B01"),
        ];
        let rows = item_rows(&records, 2, 10);
        let ids: Vec<i64> = rows.iter().map(|r| r.id).collect();
        let asins: Vec<&str> = rows.iter().map(|r| r.asin.as_str()).collect();
        assert_eq!(ids, vec![11, 12, 13]);
        assert_eq!(asins, vec!["B01", "B02", "B03"]);
        assert!(rows.iter().all(|r| r.product_type == 2));
    }

    #[test]
    fn product_type_id_is_current_row_count() {
        let row = product_type_row("Pet_Supplies", 4);
        assert_eq!(row.id, 4);
        assert_eq!(row.label, "Pet_Supplies");
    }

    #[test]
    fn bulk_extraction_threads_ids_across_batches() {
        let batches = vec![
            CategoryBatch {
                category: "Digital_Music".to_string(),
                records: vec![record("A1", "Alice", "M1"), record("A2", "", "M2")],
            },
            CategoryBatch {
                category: "Video_Games".to_string(),
                records: vec![record("A1", "", "G1"), record("A3", "Carol", "M1")],
            },
        ];

        let identities = extract_bulk(&batches);

        let type_ids: Vec<i64> = identities.product_types.iter().map(|t| t.id).collect();
        assert_eq!(type_ids, vec![0, 1]);

        let ids: Vec<i64> = identities.items.iter().map(|i| i.id).collect();
        assert_eq!(ids, vec![1, 2, 3, 4]);
        // Same asin in a second category is a distinct item row.
        assert_eq!(identities.items[0].asin, "M1");
        assert_eq!(identities.items[3].asin, "M1");
        assert_eq!(identities.items[3].product_type, 1);

        // Reviewer A1 keeps the name seen in the first batch.
        let a1 = identities.reviewers.iter().find(|r| r.id == "A1").unwrap();
        assert_eq!(a1.name, "Alice");
        assert_eq!(identities.reviewers.len(), 3);
    }
}
