//! # File Queue Backend
//!
//! Server-less queue stored as one JSON record per file. Retry and
//! dead-lettering are implemented here because there is no service to do it:
//!
//! - each delivery increments the record's `attempts` and hides it until
//!   `next_attempt_time`
//! - a record whose attempts reached the retry limit is moved into the
//!   `DeadLetter` subfolder instead of being delivered
//! - acking deletes the record

use crate::backend::QueueBackend;
use crate::error::{ConfigurationError, QueueError};
use crate::message::{
    attributes, MetadataEntry, RawMessage, RecordId, Timestamp, TransportMessage,
};
use crate::parser::MessageParser;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Name of the dead-letter subfolder
pub const DEAD_LETTER_FOLDER: &str = "DeadLetter";

/// Default delay before a delivered record becomes visible again
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(60);

const TEMP_EXTENSION: &str = "tmp";

/// One queued message as stored on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueRecord {
    pub id: RecordId,
    pub body: String,
    pub metadata: Vec<MetadataEntry>,
    pub sent_time: Timestamp,
    pub attempts: u32,
    pub next_attempt_time: Option<Timestamp>,
}

impl QueueRecord {
    pub fn new(body: impl Into<String>, metadata: Vec<MetadataEntry>) -> Self {
        Self {
            id: RecordId::generate(),
            body: body.into(),
            metadata,
            sent_time: Timestamp::now(),
            attempts: 0,
            next_attempt_time: None,
        }
    }

    /// True when the record may be delivered at `now`
    pub fn is_due(&self, now: Timestamp) -> bool {
        match self.next_attempt_time {
            Some(next) => next <= now,
            None => true,
        }
    }

    fn to_raw_message(&self) -> RawMessage {
        let mut raw = RawMessage::new(self.id.as_str(), self.id.as_str(), self.body.clone())
            .with_attribute(attributes::RECEIVE_COUNT, self.attempts.to_string());
        for entry in &self.metadata {
            raw.message_attributes
                .insert(entry.key.clone(), entry.value.clone());
        }
        raw
    }
}

/// Queue backed by a local folder.
///
/// # Examples
///
/// ```no_run
/// use queue_pump::backends::FileQueue;
/// use std::time::Duration;
/// # async fn example() -> Result<(), queue_pump::QueueError> {
/// use queue_pump::QueueBackend;
///
/// let queue = FileQueue::new("./data/orders", 5).with_retry_delay(Duration::from_secs(30));
/// queue.init().await?;
/// queue.send(r#"{"order_id":1}"#, &[]).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct FileQueue {
    folder: PathBuf,
    dead_letter_folder: PathBuf,
    name: String,
    retry_limit: u32,
    retry_delay: Duration,
    wait_time_seconds: u64,
    rescan_interval: Duration,
}

impl FileQueue {
    pub fn new(folder: impl Into<PathBuf>, retry_limit: u32) -> Self {
        let folder = folder.into();
        Self {
            dead_letter_folder: folder.join(DEAD_LETTER_FOLDER),
            name: folder.display().to_string(),
            folder,
            retry_limit,
            retry_delay: DEFAULT_RETRY_DELAY,
            wait_time_seconds: 0,
            rescan_interval: Duration::from_millis(250),
        }
    }

    /// Delay before a delivered but unacknowledged record is retried
    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    /// How long `receive` keeps rescanning an empty folder before returning
    pub fn with_wait_time_seconds(mut self, wait_time_seconds: u64) -> Self {
        self.wait_time_seconds = wait_time_seconds;
        self
    }

    pub fn with_rescan_interval(mut self, rescan_interval: Duration) -> Self {
        self.rescan_interval = rescan_interval;
        self
    }

    pub fn folder(&self) -> &Path {
        &self.folder
    }

    pub fn dead_letter_folder(&self) -> &Path {
        &self.dead_letter_folder
    }

    pub fn retry_limit(&self) -> u32 {
        self.retry_limit
    }

    /// Records currently waiting in the active folder
    pub async fn active_records(&self) -> Result<Vec<QueueRecord>, QueueError> {
        self.read_all(&self.folder).await
    }

    /// Records that exhausted their retries
    pub async fn dead_letter_records(&self) -> Result<Vec<QueueRecord>, QueueError> {
        self.read_all(&self.dead_letter_folder).await
    }

    async fn read_all(&self, folder: &Path) -> Result<Vec<QueueRecord>, QueueError> {
        let mut records = Vec::new();
        for path in list_record_files(folder).await? {
            if let Some(record) = read_record(&path).await? {
                records.push(record);
            }
        }
        Ok(records)
    }

    async fn ensure_initialized(&self) -> Result<(), QueueError> {
        match fs::metadata(&self.folder).await {
            Ok(meta) if meta.is_dir() => Ok(()),
            _ => Err(QueueError::NotInitialized {
                queue_name: self.name.clone(),
            }),
        }
    }

    /// Scan the active folder once and deliver at most one due record
    async fn poll_once(
        &self,
        parser: &dyn MessageParser,
        cancel: &CancellationToken,
    ) -> Result<Option<TransportMessage>, QueueError> {
        for path in list_record_files(&self.folder).await? {
            if cancel.is_cancelled() {
                break;
            }

            let Some(mut record) = read_record(&path).await? else {
                continue;
            };

            let now = Timestamp::now();
            if !record.is_due(now) {
                continue;
            }

            if record.attempts >= self.retry_limit {
                self.move_to_dead_letter(&record, &path).await?;
                continue;
            }

            record.attempts += 1;
            record.next_attempt_time = Some(now.plus(self.retry_delay));
            write_record(&self.folder, &record).await?;

            debug!(
                queue = %self.name,
                message_id = %record.id,
                attempt = record.attempts,
                "Delivering file queue record"
            );
            return Ok(Some(parser.parse(record.to_raw_message())));
        }

        Ok(None)
    }

    async fn move_to_dead_letter(&self, record: &QueueRecord, path: &Path) -> Result<(), QueueError> {
        fs::create_dir_all(&self.dead_letter_folder)
            .await
            .map_err(|e| QueueError::storage(&self.dead_letter_folder, e))?;
        write_record(&self.dead_letter_folder, record).await?;
        remove_if_exists(path).await?;

        info!(
            queue = %self.name,
            message_id = %record.id,
            attempts = record.attempts,
            "Moved record to dead letter folder"
        );
        Ok(())
    }
}

#[async_trait]
impl QueueBackend for FileQueue {
    async fn init(&self) -> Result<(), QueueError> {
        if self.folder.as_os_str().is_empty() {
            return Err(ConfigurationError::Missing {
                key: "queue_path".to_string(),
            }
            .into());
        }

        fs::create_dir_all(&self.folder)
            .await
            .map_err(|e| QueueError::storage(&self.folder, e))?;
        fs::create_dir_all(&self.dead_letter_folder)
            .await
            .map_err(|e| QueueError::storage(&self.dead_letter_folder, e))?;

        debug!(queue = %self.name, "File queue initialized");
        Ok(())
    }

    async fn receive(
        &self,
        parser: &dyn MessageParser,
        cancel: &CancellationToken,
    ) -> Result<Vec<TransportMessage>, QueueError> {
        let deadline = Instant::now() + Duration::from_secs(self.wait_time_seconds);

        loop {
            if cancel.is_cancelled() {
                return Ok(Vec::new());
            }

            if let Some(message) = self.poll_once(parser, cancel).await? {
                return Ok(vec![message]);
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }

            let pause = self.rescan_interval.min(deadline - now);
            tokio::select! {
                _ = cancel.cancelled() => return Ok(Vec::new()),
                _ = tokio::time::sleep(pause) => {}
            }
        }
    }

    async fn ack(&self, message: &TransportMessage) -> Result<(), QueueError> {
        let receipt = message.receipt_handle();
        if receipt.is_empty()
            || receipt.contains(['/', '\\'])
            || receipt == "."
            || receipt == ".."
        {
            return Err(QueueError::InvalidReceipt {
                receipt: receipt.to_string(),
            });
        }

        let path = self.folder.join(receipt);
        if !remove_if_exists(&path).await? {
            debug!(queue = %self.name, receipt = %receipt, "Acked record was already gone");
        }
        Ok(())
    }

    async fn send(&self, body: &str, metadata: &[MetadataEntry]) -> Result<(), QueueError> {
        self.ensure_initialized().await?;

        let record = QueueRecord::new(body, metadata.to_vec());
        write_record(&self.folder, &record).await?;

        debug!(queue = %self.name, message_id = %record.id, "Record written to file queue");
        Ok(())
    }

    fn wait_time_seconds(&self) -> u64 {
        self.wait_time_seconds
    }

    fn max_messages_per_receive(&self) -> usize {
        1
    }

    fn name(&self) -> &str {
        &self.name
    }
}

// ============================================================================
// Record I/O
// ============================================================================

/// Record files in `folder`, skipping subfolders and in-progress writes
async fn list_record_files(folder: &Path) -> Result<Vec<PathBuf>, QueueError> {
    let mut entries = fs::read_dir(folder)
        .await
        .map_err(|e| QueueError::storage(folder, e))?;

    let mut files = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| QueueError::storage(folder, e))?
    {
        let path = entry.path();
        let is_file = entry.file_type().await.map(|t| t.is_file()).unwrap_or(false);
        let is_temp = path.extension().is_some_and(|ext| ext == TEMP_EXTENSION);
        if is_file && !is_temp {
            files.push(path);
        }
    }
    Ok(files)
}

/// Read a record, returning `None` if it vanished or cannot be decoded
async fn read_record(path: &Path) -> Result<Option<QueueRecord>, QueueError> {
    let json = match fs::read_to_string(path).await {
        Ok(json) => json,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(QueueError::storage(path, e)),
    };

    match serde_json::from_str(&json) {
        Ok(record) => Ok(Some(record)),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Skipping unreadable queue record");
            Ok(None)
        }
    }
}

/// Write a record atomically through a temporary file
async fn write_record(folder: &Path, record: &QueueRecord) -> Result<(), QueueError> {
    let path = folder.join(record.id.as_str());
    let temp_path = path.with_extension(TEMP_EXTENSION);
    let json = serde_json::to_vec(record)
        .map_err(|e| QueueError::SerializationError(e.into()))?;

    let mut file = fs::File::create(&temp_path)
        .await
        .map_err(|e| QueueError::storage(&temp_path, e))?;
    file.write_all(&json)
        .await
        .map_err(|e| QueueError::storage(&temp_path, e))?;
    file.flush()
        .await
        .map_err(|e| QueueError::storage(&temp_path, e))?;
    drop(file);

    fs::rename(&temp_path, &path)
        .await
        .map_err(|e| QueueError::storage(&path, e))
}

/// Delete a file, reporting whether it existed
async fn remove_if_exists(path: &Path) -> Result<bool, QueueError> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(QueueError::storage(path, e)),
    }
}

#[cfg(test)]
#[path = "file_tests.rs"]
mod tests;
