//! Document loader: projects raw review records into MongoDB collections
//! with bounded batch flushing and date normalization.

use chrono::NaiveTime;
use mongodb::bson::{doc, DateTime, Document};
use mongodb::{Client, Database};
use revetl_core::{CategoryBatch, EtlError, RawReview};
use tracing::info;

pub const CRATE_NAME: &str = "revetl-document";

pub const DEFAULT_BATCH_SIZE: usize = 1000;

/// Collection used by the reporting-preparation mode, which merges every
/// category into one collection with a `type` discriminator field.
pub const SHARED_COLLECTION: &str = "reviews_collection";

/// Connection settings for the document store.
#[derive(Debug, Clone)]
pub struct DocumentConfig {
    pub connection_string: String,
    pub database: String,
}

impl DocumentConfig {
    pub fn from_env() -> Self {
        Self {
            connection_string: std::env::var("REVETL_MONGO_URL")
                .unwrap_or_else(|_| "mongodb://localhost:27017".to_string()),
            database: std::env::var("REVETL_MONGO_DATABASE")
                .unwrap_or_else(|_| "reviews".to_string()),
        }
    }
}

/// Insert counters for one collection load.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DocumentLoadSummary {
    pub documents: u64,
    pub flushes: u64,
}

/// Bounded accumulation buffer. `push` hands back a full batch exactly when
/// the configured size is reached; `finish` drains whatever remains.
#[derive(Debug)]
pub struct BatchBuffer<T> {
    capacity: usize,
    items: Vec<T>,
}

impl<T> BatchBuffer<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            items: Vec::new(),
        }
    }

    pub fn push(&mut self, item: T) -> Option<Vec<T>> {
        self.items.push(item);
        if self.items.len() >= self.capacity {
            Some(std::mem::take(&mut self.items))
        } else {
            None
        }
    }

    pub fn finish(mut self) -> Option<Vec<T>> {
        if self.items.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.items))
        }
    }
}

/// Projects one record onto the fixed document column set, parsing the
/// human-readable review date into a real date value. A malformed date is a
/// validation error that aborts the whole file.
pub fn project_document(record: &RawReview, category: Option<&str>) -> Result<Document, EtlError> {
    let date = record.review_date()?;
    let millis = date.and_time(NaiveTime::MIN).and_utc().timestamp_millis();

    let mut document = doc! {
        "reviewerID": &record.reviewer_id,
        "asin": &record.asin,
        "helpful": record.helpful.clone(),
        "overall": record.overall,
        "summary": &record.summary,
        "reviewText": &record.review_text,
        "reviewTime": DateTime::from_millis(millis),
        "unixReviewTime": record.unix_review_time,
    };
    if let Some(category) = category {
        document.insert("type", category);
    }
    Ok(document)
}

/// Handle to the review document database.
#[derive(Debug, Clone)]
pub struct DocumentStore {
    db: Database,
}

impl DocumentStore {
    pub async fn connect(config: &DocumentConfig) -> Result<Self, EtlError> {
        let client = Client::with_uri_str(&config.connection_string)
            .await
            .map_err(EtlError::connectivity)?;
        Ok(Self {
            db: client.database(&config.database),
        })
    }

    /// Loads one record stream into a collection, preserving input order and
    /// flushing on every full buffer plus once at stream exhaustion.
    pub async fn load_records(
        &self,
        collection: &str,
        records: &[RawReview],
        category: Option<&str>,
        batch_size: usize,
    ) -> Result<DocumentLoadSummary, EtlError> {
        let target = self.db.collection::<Document>(collection);
        let mut buffer = BatchBuffer::new(batch_size);
        let mut summary = DocumentLoadSummary::default();

        for record in records {
            let document = project_document(record, category)?;
            if let Some(batch) = buffer.push(document) {
                summary.documents += batch.len() as u64;
                summary.flushes += 1;
                target
                    .insert_many(batch)
                    .await
                    .map_err(EtlError::connectivity)?;
            }
        }

        if let Some(batch) = buffer.finish() {
            summary.documents += batch.len() as u64;
            summary.flushes += 1;
            target
                .insert_many(batch)
                .await
                .map_err(EtlError::connectivity)?;
        }

        info!(collection, documents = summary.documents, flushes = summary.flushes, "document load");
        Ok(summary)
    }

    /// Load mode: one collection per category, no discriminator field.
    pub async fn load_category_collections(
        &self,
        batches: &[CategoryBatch],
        batch_size: usize,
    ) -> Result<DocumentLoadSummary, EtlError> {
        let mut total = DocumentLoadSummary::default();
        for batch in batches {
            let summary = self
                .load_records(&batch.category, &batch.records, None, batch_size)
                .await?;
            total.documents += summary.documents;
            total.flushes += summary.flushes;
        }
        Ok(total)
    }

    /// Reporting-preparation mode: everything into one shared collection,
    /// each document tagged with its category.
    pub async fn load_shared_collection(
        &self,
        batches: &[CategoryBatch],
        collection: &str,
        batch_size: usize,
    ) -> Result<DocumentLoadSummary, EtlError> {
        let mut total = DocumentLoadSummary::default();
        for batch in batches {
            let summary = self
                .load_records(collection, &batch.records, Some(&batch.category), batch_size)
                .await?;
            total.documents += summary.documents;
            total.flushes += summary.flushes;
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(reviewer: &str, time: &str) -> RawReview {
        RawReview {
            reviewer_id: reviewer.to_string(),
            asin: "B0001".to_string(),
            helpful: vec![1, 2],
            overall: 4.0,
            review_time: time.to_string(),
            unix_review_time: 1389744000,
            ..RawReview::default()
        }
    }

    #[test]
    fn buffer_flushes_exactly_on_batch_boundaries() {
        let mut buffer = BatchBuffer::new(1000);
        let mut flushes = Vec::new();
        for i in 0..2500u32 {
            if let Some(batch) = buffer.push(i) {
                flushes.push(batch.len());
            }
        }
        if let Some(batch) = buffer.finish() {
            flushes.push(batch.len());
        }
        assert_eq!(flushes, vec![1000, 1000, 500]);
        assert_eq!(flushes.iter().sum::<usize>(), 2500);
    }

    #[test]
    fn buffer_finish_is_empty_after_exact_fit() {
        let mut buffer = BatchBuffer::new(2);
        assert!(buffer.push(1).is_none());
        assert!(buffer.push(2).is_some());
        assert!(buffer.finish().is_none());
    }

    #[test]
    fn projection_normalizes_the_review_date() {
        let document = project_document(&record("A1", "01 15, 2014"), None).expect("projects");
        let date = document.get_datetime("reviewTime").expect("datetime field");
        assert_eq!(date.try_to_rfc3339_string().unwrap(), "2014-01-15T00:00:00Z");
        assert_eq!(document.get_str("reviewerID").unwrap(), "A1");
        assert!(document.get("type").is_none());
    }

    #[test]
    fn shared_mode_tags_documents_with_category() {
        let document =
            project_document(&record("A1", "01 15, 2014"), Some("Pet_Supplies")).expect("projects");
        assert_eq!(document.get_str("type").unwrap(), "Pet_Supplies");
    }

    #[test]
    fn malformed_date_aborts_projection() {
        let err = project_document(&record("A1", "not a date"), None).unwrap_err();
        assert!(matches!(err, EtlError::Validation(_)));
    }
}
