//! Record reader: newline-delimited JSON review files + category catalog.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use revetl_core::{CategoryBatch, EtlError, RawReview};
use tracing::info;

pub const CRATE_NAME: &str = "revetl-ingest";

/// Filename suffix the dataset uses for its category files.
pub const CATEGORY_FILE_SUFFIX: &str = "_5.json";

/// One source file together with the category derived from its name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CategoryFile {
    pub path: PathBuf,
    pub category: String,
}

/// Derives the category name from a dataset filename, stripping the
/// `_5.json` convention suffix (falling back to the `.json` stem).
pub fn category_from_filename(filename: &str) -> String {
    filename
        .strip_suffix(CATEGORY_FILE_SUFFIX)
        .or_else(|| filename.strip_suffix(".json"))
        .unwrap_or(filename)
        .to_string()
}

/// Lists the category files of a data directory, sorted by filename so
/// multi-file loads are reproducible regardless of directory listing order.
pub fn list_category_files(dir: &Path) -> Result<Vec<CategoryFile>, EtlError> {
    let entries = std::fs::read_dir(dir)
        .map_err(|err| EtlError::NotFound(format!("data directory {}: {err}", dir.display())))?;

    let mut files = Vec::new();
    for entry in entries {
        let entry = entry.map_err(EtlError::connectivity)?;
        let path = entry.path();
        let Some(filename) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if !filename.ends_with(".json") {
            continue;
        }
        files.push(CategoryFile {
            category: category_from_filename(filename),
            path,
        });
    }

    if files.is_empty() {
        return Err(EtlError::NotFound(format!(
            "no .json category files in {}",
            dir.display()
        )));
    }

    files.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(files)
}

/// Reads one newline-delimited JSON file into records. A syntactically
/// malformed line aborts the whole file with a validation error naming the
/// offending line.
pub fn read_records(path: &Path) -> Result<Vec<RawReview>, EtlError> {
    let file = File::open(path)
        .map_err(|err| EtlError::NotFound(format!("{}: {err}", path.display())))?;
    let reader = BufReader::new(file);

    let mut records = Vec::new();
    for (index, line) in reader.lines().enumerate() {
        let line = line.map_err(|err| {
            EtlError::Validation(format!("{} line {}: {err}", path.display(), index + 1))
        })?;
        if line.trim().is_empty() {
            continue;
        }
        let record: RawReview = serde_json::from_str(&line).map_err(|err| {
            EtlError::Validation(format!("{} line {}: {err}", path.display(), index + 1))
        })?;
        records.push(record);
    }

    info!(path = %path.display(), records = records.len(), "read category file");
    Ok(records)
}

/// Reads every category file of a directory, in sorted filename order.
pub fn read_dataset(dir: &Path) -> Result<Vec<CategoryBatch>, EtlError> {
    let files = list_category_files(dir)?;
    let mut batches = Vec::with_capacity(files.len());
    for file in files {
        let records = read_records(&file.path)?;
        batches.push(CategoryBatch {
            category: file.category,
            records,
        });
    }
    Ok(batches)
}
