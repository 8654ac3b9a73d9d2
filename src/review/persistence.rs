//! Persistence adapter: writes answer rows to the sink and photos to
//! binary storage.
//!
//! The adapter never mutates sessions. It reports what was committed and the
//! engine decides how the session moves.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{FixedOffset, Utc};
use tokio::sync::RwLock;

use crate::error::ReviewError;
use crate::review::catalog::QuestionCatalog;
use crate::review::event::{Identity, PhotoRef};
use crate::review::prompts::{IMAGE_ROW_LABEL, image_formula};

/// Fixed header of the answer sink.
pub const ANSWER_HEADER: [&str; 5] = ["Nombre", "Fecha", "Telegram", "Pregunta", "Respuesta"];

const PHOTO_MIME: &str = "image/jpeg";

/// One persisted answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnswerRow {
    pub name: String,
    pub date: String,
    pub identity: String,
    pub question: String,
    pub answer: String,
}

impl AnswerRow {
    /// Cell values in header order.
    pub fn cells(&self) -> [&str; 5] {
        [
            &self.name,
            &self.date,
            &self.identity,
            &self.question,
            &self.answer,
        ]
    }
}

/// Append-only row store.
#[async_trait]
pub trait AnswerSink: Send + Sync {
    /// Values of the first row, or `None` if the sheet is empty.
    async fn header(&self) -> Result<Option<Vec<String>>, ReviewError>;

    /// Remove every row.
    async fn clear(&self) -> Result<(), ReviewError>;

    async fn write_header(&self, header: &[&str]) -> Result<(), ReviewError>;

    /// Freeze the header row. Fails with `FreezeUnsupported` when the sheet
    /// cannot be frozen.
    async fn freeze_header(&self) -> Result<(), ReviewError>;

    /// Append rows in order.
    async fn append_rows(&self, rows: &[AnswerRow]) -> Result<(), ReviewError>;
}

/// A stored binary object reachable through a public link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    pub file_id: String,
    pub url: String,
}

/// Folder-organized binary storage.
#[async_trait]
pub trait PhotoStorage: Send + Sync {
    /// Id of the folder named `name` under the storage root, created if absent.
    async fn ensure_folder(&self, name: &str) -> Result<String, ReviewError>;

    /// Store `bytes` in `folder`, make it public, and return its reference.
    async fn upload(
        &self,
        folder: &str,
        file_name: &str,
        mime_type: &str,
        bytes: Vec<u8>,
    ) -> Result<ImageReference, ReviewError>;
}

/// Answers to persist for one person.
#[derive(Debug, Clone, Copy)]
pub struct FlushRequest<'a> {
    pub person_name: &'a str,
    pub identity: &'a Identity,
    pub answers: &'a [String],
}

/// A photo to store, optionally preceded by pending text answers.
pub struct PhotoSubmission<'a> {
    pub person_name: &'a str,
    pub identity: &'a Identity,
    pub photo: &'a PhotoRef,
    pub bytes: Vec<u8>,
    /// Text answers that must be flushed before the upload.
    pub pending_answers: &'a [String],
}

/// What a successful photo submission committed.
#[derive(Debug, Clone)]
pub struct PhotoReceipt {
    pub answer_rows: usize,
    pub image: ImageReference,
}

/// A failed photo submission. `answers_flushed` tells whether the pending
/// answers were committed before the failure.
#[derive(Debug)]
pub struct PhotoFailure {
    pub answers_flushed: bool,
    pub error: ReviewError,
}

/// Writes sessions and photos to external storage.
pub struct PersistenceAdapter {
    sink: Arc<dyn AnswerSink>,
    storage: Arc<dyn PhotoStorage>,
    /// Person name → storage folder id.
    folders: RwLock<HashMap<String, String>>,
    io_timeout: Duration,
    utc_offset: FixedOffset,
}

impl PersistenceAdapter {
    pub fn new(
        sink: Arc<dyn AnswerSink>,
        storage: Arc<dyn PhotoStorage>,
        io_timeout: Duration,
        utc_offset: FixedOffset,
    ) -> Self {
        Self {
            sink,
            storage,
            folders: RwLock::new(HashMap::new()),
            io_timeout,
            utc_offset,
        }
    }

    /// Append one row per answer, in question order. Returns the number of
    /// rows written; an empty request touches nothing.
    pub async fn flush(
        &self,
        request: FlushRequest<'_>,
        catalog: &QuestionCatalog,
    ) -> Result<usize, ReviewError> {
        if request.answers.is_empty() {
            return Ok(0);
        }

        let date = self.today();
        let rows: Vec<AnswerRow> = request
            .answers
            .iter()
            .enumerate()
            .map(|(i, answer)| AnswerRow {
                name: request.person_name.to_string(),
                date: date.clone(),
                identity: request.identity.to_string(),
                question: catalog.label_for(i),
                answer: answer.clone(),
            })
            .collect();

        self.ensure_header().await?;
        self.timed(self.sink.append_rows(&rows), ReviewError::SinkUnavailable)
            .await?;

        tracing::info!(
            identity = %request.identity,
            rows = rows.len(),
            "Answers flushed"
        );
        Ok(rows.len())
    }

    /// Flush pending answers (if any), upload the photo into the person's
    /// folder, and append the image-reference row.
    pub async fn submit_photo(
        &self,
        submission: PhotoSubmission<'_>,
        catalog: &QuestionCatalog,
    ) -> Result<PhotoReceipt, PhotoFailure> {
        let answer_rows = self
            .flush(
                FlushRequest {
                    person_name: submission.person_name,
                    identity: submission.identity,
                    answers: submission.pending_answers,
                },
                catalog,
            )
            .await
            .map_err(|error| PhotoFailure {
                answers_flushed: false,
                error,
            })?;

        let after_flush = |error| PhotoFailure {
            answers_flushed: answer_rows > 0,
            error,
        };

        let image = self
            .upload_photo(submission.person_name, submission.photo, submission.bytes)
            .await
            .map_err(after_flush)?;

        let row = AnswerRow {
            name: submission.person_name.to_string(),
            date: self.today(),
            identity: submission.identity.to_string(),
            question: IMAGE_ROW_LABEL.to_string(),
            answer: image_formula(&image.url, submission.photo.width, submission.photo.height),
        };

        self.ensure_header().await.map_err(after_flush)?;
        self.timed(
            self.sink.append_rows(std::slice::from_ref(&row)),
            ReviewError::SinkUnavailable,
        )
        .await
        .map_err(after_flush)?;

        tracing::info!(
            identity = %submission.identity,
            file_id = %image.file_id,
            "Photo stored"
        );
        Ok(PhotoReceipt { answer_rows, image })
    }

    /// Store a photo under the person's folder.
    pub async fn upload_photo(
        &self,
        person_name: &str,
        photo: &PhotoRef,
        bytes: Vec<u8>,
    ) -> Result<ImageReference, ReviewError> {
        let folder = self.folder_for(person_name).await?;
        let file_name = format!("{}.jpg", photo.unique_id);
        self.timed(
            self.storage.upload(&folder, &file_name, PHOTO_MIME, bytes),
            ReviewError::StorageUnavailable,
        )
        .await
    }

    /// Make sure the sink starts with the expected header.
    ///
    /// A mismatching first row clears the sheet and rewrites the header.
    /// Freezing fails on a sheet holding only the header; that failure is
    /// ignored.
    pub async fn ensure_header(&self) -> Result<(), ReviewError> {
        let current = self
            .timed(self.sink.header(), ReviewError::SinkUnavailable)
            .await?;
        if header_matches(current.as_deref()) {
            return Ok(());
        }

        tracing::info!(found = ?current, "Answer sink header missing or stale; rewriting");
        self.timed(self.sink.clear(), ReviewError::SinkUnavailable)
            .await?;

        match self
            .timed(
                self.sink.write_header(&ANSWER_HEADER),
                ReviewError::SinkUnavailable,
            )
            .await
        {
            Ok(()) | Err(ReviewError::DuplicateHeaderWrite) => {}
            Err(e) => return Err(e),
        }

        match self
            .timed(self.sink.freeze_header(), ReviewError::SinkUnavailable)
            .await
        {
            Ok(()) => Ok(()),
            Err(ReviewError::FreezeUnsupported {
                single_row: true,
                reason,
            }) => {
                tracing::debug!("Header freeze skipped: {reason}");
                Ok(())
            }
            Err(ReviewError::FreezeUnsupported { reason, .. }) => {
                Err(ReviewError::SinkUnavailable(reason))
            }
            Err(e) => Err(e),
        }
    }

    async fn folder_for(&self, person_name: &str) -> Result<String, ReviewError> {
        if let Some(id) = self.folders.read().await.get(person_name) {
            return Ok(id.clone());
        }

        let mut folders = self.folders.write().await;
        if let Some(id) = folders.get(person_name) {
            return Ok(id.clone());
        }
        let id = self
            .timed(
                self.storage.ensure_folder(person_name),
                ReviewError::StorageUnavailable,
            )
            .await?;
        folders.insert(person_name.to_string(), id.clone());
        Ok(id)
    }

    async fn timed<T, F>(
        &self,
        fut: F,
        on_timeout: fn(String) -> ReviewError,
    ) -> Result<T, ReviewError>
    where
        F: Future<Output = Result<T, ReviewError>>,
    {
        match tokio::time::timeout(self.io_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(on_timeout(format!("timed out after {:?}", self.io_timeout))),
        }
    }

    fn today(&self) -> String {
        Utc::now()
            .with_timezone(&self.utc_offset)
            .format("%Y-%m-%d")
            .to_string()
    }
}

fn header_matches(current: Option<&[String]>) -> bool {
    match current {
        Some(cells) => {
            cells.len() >= ANSWER_HEADER.len()
                && cells
                    .iter()
                    .zip(ANSWER_HEADER)
                    .all(|(found, expected)| found.trim() == expected)
                && cells[ANSWER_HEADER.len()..].iter().all(|c| c.trim().is_empty())
        }
        None => false,
    }
}
