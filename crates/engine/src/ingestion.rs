//! Ingestion preprocessor
//!
//! Reads a project's uploaded CSV files in bounded chunks and separates them
//! into the catalog stream and the interaction stream. Interaction rows are
//! counted per `(user, item)` pair across chunk boundaries, so only the
//! aggregated counts and one chunk of raw rows are held in memory.
//!
//! The [`ColumnMapping`] is validated before any file is opened and every
//! mapped header is checked before the first row is read.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use recommdo_core::{FileKind, FileLocation, PipelineConfig, Project};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use crate::dataset::{CatalogRow, InteractionCount, InteractionDataset};
use crate::error::{PipelineError, PipelineResult};

/// Where catalog fields live in the catalog file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogColumns {
    pub file_name: String,
    pub id_header: String,
    pub name_header: Option<String>,
    /// Extra columns stored as the item's JSON payload
    #[serde(default)]
    pub payload_headers: Vec<String>,
}

/// Where interaction fields live in the interaction file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InteractionColumns {
    pub file_name: String,
    pub user_id_header: String,
    pub item_id_header: String,
    /// Start of the interaction period. Checked for presence, not analysed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at_header: Option<String>,
    /// End of the interaction period. Checked for presence, not analysed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at_header: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnMapping {
    pub catalog: CatalogColumns,
    pub interactions: InteractionColumns,
}

impl ColumnMapping {
    pub fn validate(&self) -> PipelineResult<()> {
        let required = [
            ("catalog file name", &self.catalog.file_name),
            ("catalog id header", &self.catalog.id_header),
            ("interactions file name", &self.interactions.file_name),
            ("interactions user id header", &self.interactions.user_id_header),
            ("interactions item id header", &self.interactions.item_id_header),
        ];
        for (label, value) in required {
            if value.trim().is_empty() {
                return Err(PipelineError::InvalidColumnMapping(format!(
                    "{} must not be empty",
                    label
                )));
            }
        }

        if self.catalog.file_name == self.interactions.file_name {
            return Err(PipelineError::InvalidColumnMapping(
                "catalog and interactions must be different files".to_string(),
            ));
        }

        if self.interactions.user_id_header == self.interactions.item_id_header {
            return Err(PipelineError::InvalidColumnMapping(
                "user id and item id must be different columns".to_string(),
            ));
        }

        if self
            .catalog
            .name_header
            .as_deref()
            .is_some_and(|h| h.trim().is_empty())
        {
            return Err(PipelineError::InvalidColumnMapping(
                "catalog name header must not be blank".to_string(),
            ));
        }

        let timestamps = [
            ("interactions start header", &self.interactions.started_at_header),
            ("interactions end header", &self.interactions.ended_at_header),
        ];
        for (label, header) in timestamps {
            let Some(header) = header.as_deref() else {
                continue;
            };
            if header.trim().is_empty() {
                return Err(PipelineError::InvalidColumnMapping(format!(
                    "{} must not be blank",
                    label
                )));
            }
            if header == self.interactions.user_id_header
                || header == self.interactions.item_id_header
            {
                return Err(PipelineError::InvalidColumnMapping(format!(
                    "{} must not reuse an id column",
                    label
                )));
            }
        }

        Ok(())
    }

    /// Role of an uploaded file, by its original name
    pub fn classify(&self, file_name: &str) -> Option<FileKind> {
        if file_name == self.catalog.file_name {
            Some(FileKind::Catalog)
        } else if file_name == self.interactions.file_name {
            Some(FileKind::Interactions)
        } else {
            None
        }
    }
}

/// Aggregates interaction pairs, keeping first-appearance order
#[derive(Default)]
struct PairCounter {
    positions: HashMap<(i64, i64), usize>,
    counts: Vec<InteractionCount>,
}

impl PairCounter {
    fn absorb(&mut self, chunk: &mut Vec<(i64, i64)>) {
        for (user_id, item_id) in chunk.drain(..) {
            match self.positions.get(&(user_id, item_id)) {
                Some(&i) => self.counts[i].count += 1,
                None => {
                    self.positions.insert((user_id, item_id), self.counts.len());
                    self.counts.push(InteractionCount::new(user_id, item_id, 1));
                }
            }
        }
    }
}

fn column_index(headers: &csv::StringRecord, name: &str, path: &Path) -> PipelineResult<usize> {
    headers
        .iter()
        .position(|h| h == name.trim())
        .ok_or_else(|| {
            PipelineError::InvalidColumnMapping(format!(
                "column '{}' not found in {}",
                name,
                path.display()
            ))
        })
}

fn parse_id(raw: &str, line: u64, column: &str) -> PipelineResult<i64> {
    if let Ok(id) = raw.parse::<i64>() {
        return Ok(id);
    }

    // Exported spreadsheets often write integral ids as `12.0`
    match raw.parse::<f64>() {
        Ok(value) if value.is_finite() && value.fract() == 0.0 && value.abs() < 9.0e18 => {
            Ok(value as i64)
        }
        _ => Err(PipelineError::MalformedIdentifier {
            line,
            column: column.to_string(),
            value: raw.to_string(),
        }),
    }
}

fn open(path: &Path) -> PipelineResult<csv::Reader<std::fs::File>> {
    Ok(csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_path(path)?)
}

#[derive(Debug, Clone)]
pub struct IngestionPreprocessor {
    upload_root: PathBuf,
    chunk_size: usize,
}

impl IngestionPreprocessor {
    pub fn new(upload_root: impl Into<PathBuf>, chunk_size: usize) -> Self {
        Self {
            upload_root: upload_root.into(),
            chunk_size: chunk_size.max(1),
        }
    }

    pub fn from_config(config: &PipelineConfig) -> Self {
        Self::new(config.upload_root.clone(), config.chunk_size)
    }

    /// Absolute path of a project file
    pub fn resolve(&self, file: &FileLocation) -> PathBuf {
        let location = Path::new(&file.location);
        if location.is_absolute() {
            location.to_path_buf()
        } else {
            self.upload_root.join(location)
        }
    }

    /// Read both streams of a project. A stream whose file was never
    /// uploaded is `None`.
    #[instrument(skip(self, project, mapping), fields(project_id = %project.id))]
    pub fn scan(
        &self,
        project: &Project,
        mapping: &ColumnMapping,
    ) -> PipelineResult<InteractionDataset> {
        mapping.validate()?;

        let catalog = project
            .file(FileKind::Catalog)
            .map(|file| self.read_catalog(&self.resolve(file), &mapping.catalog))
            .transpose()?;

        let interactions = project
            .file(FileKind::Interactions)
            .map(|file| self.read_interactions(&self.resolve(file), &mapping.interactions))
            .transpose()?;

        Ok(InteractionDataset {
            catalog,
            interactions,
        })
    }

    /// Read catalog rows; a repeated id keeps its first position and the
    /// values of its last row.
    pub fn read_catalog(
        &self,
        path: &Path,
        columns: &CatalogColumns,
    ) -> PipelineResult<Vec<CatalogRow>> {
        let mut reader = open(path)?;
        let headers = reader.headers()?.clone();

        let id_col = column_index(&headers, &columns.id_header, path)?;
        let name_col = columns
            .name_header
            .as_deref()
            .map(|h| column_index(&headers, h, path))
            .transpose()?;
        let payload_cols = columns
            .payload_headers
            .iter()
            .map(|h| Ok((h.clone(), column_index(&headers, h, path)?)))
            .collect::<PipelineResult<Vec<_>>>()?;

        let mut positions: HashMap<i64, usize> = HashMap::new();
        let mut rows: Vec<CatalogRow> = Vec::new();
        let mut record = csv::StringRecord::new();
        let mut read = 0usize;

        while reader.read_record(&mut record)? {
            let line = record.position().map(|p| p.line()).unwrap_or(0);
            let meta_id = parse_id(record.get(id_col).unwrap_or(""), line, &columns.id_header)?;

            let name = name_col
                .and_then(|i| record.get(i))
                .filter(|v| !v.is_empty())
                .map(str::to_string);

            let payload = if payload_cols.is_empty() {
                None
            } else {
                let fields: serde_json::Map<String, serde_json::Value> = payload_cols
                    .iter()
                    .map(|(header, i)| {
                        let value = record.get(*i).unwrap_or("").to_string();
                        (header.clone(), serde_json::Value::String(value))
                    })
                    .collect();
                Some(serde_json::Value::Object(fields))
            };

            let row = CatalogRow {
                meta_id,
                name,
                payload,
            };
            match positions.get(&meta_id) {
                Some(&i) => rows[i] = row,
                None => {
                    positions.insert(meta_id, rows.len());
                    rows.push(row);
                }
            }

            read += 1;
            if read % self.chunk_size == 0 {
                debug!(rows = read, "Catalog chunk read");
            }
        }

        info!(rows = read, items = rows.len(), path = %path.display(), "Catalog read");
        Ok(rows)
    }

    /// Read and count interaction rows in chunks of `chunk_size`
    pub fn read_interactions(
        &self,
        path: &Path,
        columns: &InteractionColumns,
    ) -> PipelineResult<Vec<InteractionCount>> {
        let mut reader = open(path)?;
        let headers = reader.headers()?.clone();

        let user_col = column_index(&headers, &columns.user_id_header, path)?;
        let item_col = column_index(&headers, &columns.item_id_header, path)?;
        for header in [&columns.started_at_header, &columns.ended_at_header]
            .into_iter()
            .flatten()
        {
            column_index(&headers, header, path)?;
        }

        let mut counter = PairCounter::default();
        let mut chunk: Vec<(i64, i64)> = Vec::with_capacity(self.chunk_size.min(65_536));
        let mut record = csv::StringRecord::new();
        let mut chunks = 0usize;
        let mut read = 0usize;

        while reader.read_record(&mut record)? {
            let line = record.position().map(|p| p.line()).unwrap_or(0);
            let user_id = parse_id(
                record.get(user_col).unwrap_or(""),
                line,
                &columns.user_id_header,
            )?;
            let item_id = parse_id(
                record.get(item_col).unwrap_or(""),
                line,
                &columns.item_id_header,
            )?;

            chunk.push((user_id, item_id));
            read += 1;

            if chunk.len() >= self.chunk_size {
                counter.absorb(&mut chunk);
                chunks += 1;
                debug!(chunk = chunks, rows = read, "Interaction chunk counted");
            }
        }

        if !chunk.is_empty() {
            counter.absorb(&mut chunk);
            chunks += 1;
        }

        info!(
            rows = read,
            pairs = counter.counts.len(),
            chunks,
            path = %path.display(),
            "Interactions read"
        );
        Ok(counter.counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn mapping() -> ColumnMapping {
        ColumnMapping {
            catalog: CatalogColumns {
                file_name: "meta.csv".to_string(),
                id_header: "id".to_string(),
                name_header: Some("title".to_string()),
                payload_headers: vec!["genre".to_string()],
            },
            interactions: InteractionColumns {
                file_name: "subs.csv".to_string(),
                user_id_header: "user".to_string(),
                item_id_header: "item".to_string(),
                started_at_header: None,
                ended_at_header: None,
            },
        }
    }

    fn project_with_files(dir: &Path) -> Project {
        Project::new("shop")
            .with_file(FileLocation {
                name: "meta.csv".to_string(),
                location: dir.join("meta.csv").display().to_string(),
                kind: FileKind::Catalog,
            })
            .with_file(FileLocation {
                name: "subs.csv".to_string(),
                location: "subs.csv".to_string(),
                kind: FileKind::Interactions,
            })
    }

    #[test]
    fn test_validate_rejects_blank_headers() {
        let mut bad = mapping();
        bad.interactions.user_id_header = " ".to_string();
        assert!(matches!(
            bad.validate(),
            Err(PipelineError::InvalidColumnMapping(_))
        ));

        let mut same = mapping();
        same.interactions.item_id_header = "user".to_string();
        assert!(same.validate().is_err());

        assert!(mapping().validate().is_ok());
    }

    #[test]
    fn test_invalid_mapping_checked_before_files() {
        let preprocessor = IngestionPreprocessor::new("/definitely/not/here", 10);
        let mut bad = mapping();
        bad.catalog.id_header.clear();

        let project = project_with_files(Path::new("/definitely/not/here"));
        assert!(matches!(
            preprocessor.scan(&project, &bad),
            Err(PipelineError::InvalidColumnMapping(_))
        ));
    }

    #[test]
    fn test_classify() {
        let mapping = mapping();
        assert_eq!(mapping.classify("meta.csv"), Some(FileKind::Catalog));
        assert_eq!(mapping.classify("subs.csv"), Some(FileKind::Interactions));
        assert_eq!(mapping.classify("notes.txt"), None);
    }

    #[test]
    fn test_scan_counts_across_chunks() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("meta.csv"),
            "id,title,genre\n1,Alpha,drama\n2,Beta,comedy\n2,Beta II,comedy\n",
        )
        .unwrap();
        fs::write(
            dir.path().join("subs.csv"),
            "user,item\n10,1\n10,1\n11,2\n10,1\n10,2\n11,2\n10,1\n",
        )
        .unwrap();

        let preprocessor = IngestionPreprocessor::new(dir.path(), 2);
        let dataset = preprocessor
            .scan(&project_with_files(dir.path()), &mapping())
            .unwrap();

        let catalog = dataset.catalog.unwrap();
        assert_eq!(catalog.len(), 2);
        assert_eq!(catalog[1].name.as_deref(), Some("Beta II"));
        assert_eq!(
            catalog[0].payload,
            Some(serde_json::json!({ "genre": "drama" }))
        );

        let interactions = dataset.interactions.unwrap();
        assert_eq!(
            interactions,
            vec![
                InteractionCount::new(10, 1, 4),
                InteractionCount::new(11, 2, 2),
                InteractionCount::new(10, 2, 1),
            ]
        );
    }

    #[test]
    fn test_missing_stream_is_none() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("meta.csv"), "id,title,genre\n1,Alpha,drama\n").unwrap();

        let project = Project::new("catalog-only").with_file(FileLocation {
            name: "meta.csv".to_string(),
            location: "meta.csv".to_string(),
            kind: FileKind::Catalog,
        });

        let dataset = IngestionPreprocessor::new(dir.path(), 100)
            .scan(&project, &mapping())
            .unwrap();
        assert!(dataset.catalog.is_some());
        assert!(dataset.interactions.is_none());
    }

    #[test]
    fn test_missing_header() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("subs.csv"), "customer,item\n1,2\n").unwrap();

        let err = IngestionPreprocessor::new(dir.path(), 100)
            .read_interactions(&dir.path().join("subs.csv"), &mapping().interactions)
            .unwrap_err();
        assert!(matches!(err, PipelineError::InvalidColumnMapping(_)));
    }

    #[test]
    fn test_timestamp_headers_validated_and_required() {
        let mut blank = mapping();
        blank.interactions.started_at_header = Some("  ".to_string());
        assert!(blank.validate().is_err());

        let mut reused = mapping();
        reused.interactions.ended_at_header = Some("item".to_string());
        assert!(reused.validate().is_err());

        let mut dated = mapping();
        dated.interactions.started_at_header = Some("start".to_string());
        dated.interactions.ended_at_header = Some("end".to_string());
        assert!(dated.validate().is_ok());

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("subs.csv");
        let preprocessor = IngestionPreprocessor::new(dir.path(), 100);

        fs::write(&path, "user,item,start\n1,2,2021-01-01\n").unwrap();
        let err = preprocessor
            .read_interactions(&path, &dated.interactions)
            .unwrap_err();
        assert!(err.to_string().contains("end"));

        fs::write(&path, "user,item,start,end\n1,2,2021-01-01,2021-02-01\n1,2,,\n").unwrap();
        let counts = preprocessor
            .read_interactions(&path, &dated.interactions)
            .unwrap();
        assert_eq!(counts, vec![InteractionCount::new(1, 2, 2)]);
    }

    #[test]
    fn test_malformed_identifier() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("subs.csv"), "user,item\n1,2\n1,abc\n").unwrap();

        let err = IngestionPreprocessor::new(dir.path(), 100)
            .read_interactions(&dir.path().join("subs.csv"), &mapping().interactions)
            .unwrap_err();
        match err {
            PipelineError::MalformedIdentifier { line, column, value } => {
                assert_eq!(line, 3);
                assert_eq!(column, "item");
                assert_eq!(value, "abc");
            }
            other => panic!("Expected MalformedIdentifier, got {other:?}"),
        }
    }

    #[test]
    fn test_integral_float_ids_accepted() {
        assert_eq!(parse_id("12.0", 1, "id").unwrap(), 12);
        assert!(parse_id("12.5", 1, "id").is_err());
    }
}
