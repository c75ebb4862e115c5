use async_trait::async_trait;
use chrono::{DateTime, Utc};
use loadlab_core::{Experiment, Sample, SampleHandler, Store, StoreError, StoreResult};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use tracing::{debug, warn};

/// Stable column layout of a sample row.
pub const CSV_HEADER: [&str; 10] = [
    "Average",
    "TotalTime",
    "Total",
    "TotalErrors",
    "TotalWorkers",
    "LastResult",
    "LastError",
    "WorstResult",
    "WallTime",
    "Type",
];

/// File-based sample store keeping one CSV file per experiment.
#[derive(Debug, Clone)]
pub struct CsvStore {
    dir: PathBuf,
}

impl CsvStore {
    /// Creates a store rooted at `dir`. The directory is created on first
    /// write, not here.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl Store for CsvStore {
    fn writer(&self, guid: &str) -> SampleHandler {
        let dir = self.dir.clone();
        let path = self.dir.join(format!("{guid}.csv"));
        Box::new(move |mut samples| {
            Box::pin(async move {
                let mut writer = match open_writer(&dir, &path) {
                    Ok(writer) => writer,
                    Err(error) => {
                        warn!(%error, path = %path.display(), "cannot persist samples");
                        while samples.recv().await.is_some() {}
                        return;
                    }
                };

                while let Some(sample) = samples.recv().await {
                    if let Err(error) = writer.write_record(&sample_record(&sample)) {
                        warn!(%error, path = %path.display(), "failed to persist sample");
                        break;
                    }
                    let _ = writer.flush();
                }
                // Keep draining so a write failure never stalls the stream.
                while samples.recv().await.is_some() {}
                let _ = writer.flush();
                debug!(path = %path.display(), "sample file closed");
            })
        })
    }

    async fn load_all(&self) -> StoreResult<Vec<Arc<dyn Experiment>>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }

        let mut found: Vec<(SystemTime, Arc<dyn Experiment>)> = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().map(|e| e == "csv") != Some(true) {
                continue;
            }
            let Some(guid) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let modified = entry
                .metadata()?
                .modified()
                .unwrap_or(SystemTime::UNIX_EPOCH);
            let experiment = CsvExperiment {
                guid: guid.to_string(),
                started_at: DateTime::<Utc>::from(modified),
                path: path.clone(),
            };
            found.push((modified, Arc::new(experiment)));
        }

        // Oldest first, so visitors see experiments in launch order.
        found.sort_by_key(|(modified, _)| *modified);
        Ok(found.into_iter().map(|(_, experiment)| experiment).collect())
    }
}

struct CsvExperiment {
    guid: String,
    started_at: DateTime<Utc>,
    path: PathBuf,
}

#[async_trait]
impl Experiment for CsvExperiment {
    fn guid(&self) -> &str {
        &self.guid
    }

    fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    async fn samples(&self) -> StoreResult<Vec<Sample>> {
        read_samples(&self.path)
    }
}

/// Renders `samples` as a CSV document in the stable layout.
pub fn csv_string(samples: &[Sample]) -> String {
    let mut writer = csv::Writer::from_writer(Vec::new());
    let _ = writer.write_record(&CSV_HEADER);
    for sample in samples {
        let _ = writer.write_record(&sample_record(sample));
    }
    match writer.into_inner() {
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(_) => String::new(),
    }
}

fn open_writer(dir: &Path, path: &Path) -> StoreResult<csv::Writer<File>> {
    std::fs::create_dir_all(dir)?;
    let mut writer = csv::Writer::from_path(path).map_err(from_csv_error)?;
    writer.write_record(&CSV_HEADER).map_err(from_csv_error)?;
    writer.flush()?;
    Ok(writer)
}

fn sample_record(sample: &Sample) -> [String; 10] {
    [
        humantime::format_duration(sample.average).to_string(),
        humantime::format_duration(sample.total_time).to_string(),
        sample.total.to_string(),
        sample.total_errors.to_string(),
        sample.total_workers.to_string(),
        humantime::format_duration(sample.last_result).to_string(),
        sample.last_error.clone().unwrap_or_default(),
        humantime::format_duration(sample.worst_result).to_string(),
        humantime::format_duration(sample.wall_time).to_string(),
        sample.kind.to_string(),
    ]
}

fn read_samples(path: &Path) -> StoreResult<Vec<Sample>> {
    let mut reader = csv::Reader::from_path(path).map_err(from_csv_error)?;
    let mut samples = Vec::new();
    for record in reader.records() {
        let record = record.map_err(from_csv_error)?;
        samples.push(parse_record(&record)?);
    }
    Ok(samples)
}

fn parse_record(record: &csv::StringRecord) -> StoreResult<Sample> {
    let field = |index: usize| {
        record
            .get(index)
            .ok_or_else(|| StoreError::Malformed(format!("missing column {index}")))
    };
    let duration = |index: usize| {
        humantime::parse_duration(field(index)?)
            .map_err(|e| StoreError::Malformed(format!("column {index}: {e}")))
    };

    let last_error = field(6)?;
    Ok(Sample {
        commands: Default::default(),
        average: duration(0)?,
        total_time: duration(1)?,
        total: parse_number(field(2)?)?,
        total_errors: parse_number(field(3)?)?,
        total_workers: parse_number(field(4)?)?,
        last_result: duration(5)?,
        last_error: (!last_error.is_empty()).then(|| last_error.to_string()),
        worst_result: duration(7)?,
        wall_time: duration(8)?,
        kind: field(9)?
            .parse()
            .map_err(|e| StoreError::Malformed(format!("column 9: {e}")))?,
    })
}

fn parse_number<T: std::str::FromStr>(value: &str) -> StoreResult<T>
where
    T::Err: std::fmt::Display,
{
    value
        .parse()
        .map_err(|e| StoreError::Malformed(format!("`{value}`: {e}")))
}

fn from_csv_error(error: csv::Error) -> StoreError {
    let message = error.to_string();
    match error.into_kind() {
        csv::ErrorKind::Io(io) => StoreError::Io(io),
        _ => StoreError::Malformed(message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use loadlab_core::SampleType;
    use std::collections::HashMap;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn sample(total: u64, last_error: Option<&str>) -> Sample {
        Sample {
            commands: HashMap::new(),
            average: Duration::from_millis(1500),
            total_time: Duration::from_millis(1500 * total as u64),
            total,
            total_errors: last_error.iter().count() as u64,
            total_workers: 2,
            last_result: Duration::from_millis(1400),
            last_error: last_error.map(str::to_string),
            worst_result: Duration::from_millis(1900),
            wall_time: Duration::from_secs(total),
            kind: SampleType::Result,
        }
    }

    async fn write_experiment(store: &CsvStore, guid: &str, samples: Vec<Sample>) {
        let handler = store.writer(guid);
        let (tx, rx) = mpsc::channel(samples.len().max(1));
        for sample in samples {
            tx.send(sample).await.unwrap();
        }
        drop(tx);
        handler(rx).await;
    }

    #[tokio::test]
    async fn round_trips_the_scalar_fields() {
        let dir = tempfile::tempdir().unwrap();
        let store = CsvStore::new(dir.path());

        let written = vec![
            sample(1, None),
            sample(2, Some("step `push` failed: boom")),
        ];
        write_experiment(&store, "abc", written.clone()).await;

        let experiments = store.load_all().await.unwrap();
        assert_eq!(experiments.len(), 1);
        assert_eq!(experiments[0].guid(), "abc");

        let read = experiments[0].samples().await.unwrap();
        assert_eq!(read.len(), 2);
        for (wrote, got) in written.iter().zip(&read) {
            assert_eq!(got.average, wrote.average);
            assert_eq!(got.total_time, wrote.total_time);
            assert_eq!(got.total, wrote.total);
            assert_eq!(got.total_errors, wrote.total_errors);
            assert_eq!(got.total_workers, wrote.total_workers);
            assert_eq!(got.last_result, wrote.last_result);
            assert_eq!(got.last_error, wrote.last_error);
            assert_eq!(got.worst_result, wrote.worst_result);
            assert_eq!(got.wall_time, wrote.wall_time);
            assert_eq!(got.kind, wrote.kind);
        }
    }

    #[tokio::test]
    async fn writes_the_stable_header() {
        let dir = tempfile::tempdir().unwrap();
        let store = CsvStore::new(dir.path());

        write_experiment(&store, "header-check", vec![sample(1, None)]).await;

        let content =
            std::fs::read_to_string(dir.path().join("header-check.csv")).unwrap();
        let first_line = content.lines().next().unwrap();
        assert_eq!(
            first_line,
            "Average,TotalTime,Total,TotalErrors,TotalWorkers,LastResult,LastError,WorstResult,WallTime,Type"
        );
    }

    #[tokio::test]
    async fn load_all_on_a_missing_directory_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = CsvStore::new(dir.path().join("never-written"));

        assert!(store.load_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn an_unwritable_directory_still_drains_the_stream() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("occupied");
        std::fs::write(&blocker, b"not a directory").unwrap();
        let store = CsvStore::new(&blocker);

        // Must not hang even though nothing can be written.
        write_experiment(&store, "doomed", vec![sample(1, None); 20]).await;
    }

    #[test]
    fn csv_string_renders_header_and_rows() {
        let rendered = csv_string(&[sample(1, None), sample(2, None)]);
        let lines: Vec<&str> = rendered.lines().collect();

        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("Average,TotalTime,"));
        assert!(lines[1].contains("Result"));
    }
}
