//! Drive v3 client: spreadsheet lookup by name and per-person photo folders.

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::error::{GoogleError, ReviewError};
use crate::google::client::{GoogleClient, endpoint, escape_query_value};
use crate::review::persistence::{ImageReference, PhotoStorage};

const FILES_API: &str = "https://www.googleapis.com/drive/v3/files";
const UPLOAD_API: &str = "https://www.googleapis.com/upload/drive/v3/files";
const FOLDER_MIME: &str = "application/vnd.google-apps.folder";
const SPREADSHEET_MIME: &str = "application/vnd.google-apps.spreadsheet";

pub struct DriveClient {
    api: GoogleClient,
    /// Folder under which per-person folders are created.
    root_folder: String,
}

impl DriveClient {
    pub fn new(api: GoogleClient, root_folder: impl Into<String>) -> Self {
        Self {
            api,
            root_folder: root_folder.into(),
        }
    }

    /// Id of the first file matching a Drive query.
    pub async fn find_file(&self, query: &str) -> Result<Option<String>, GoogleError> {
        let url = endpoint(FILES_API, &[])?;
        let request = self.api.http().get(url).query(&[
            ("q", query),
            ("fields", "files(id,name)"),
            ("pageSize", "10"),
        ]);
        let body = self.api.send_json("drive.files.list", request).await?;
        Ok(body["files"]
            .as_array()
            .and_then(|files| files.first())
            .and_then(|f| f["id"].as_str())
            .map(String::from))
    }

    /// Resolve a spreadsheet name to its id.
    pub async fn find_spreadsheet(&self, name: &str) -> Result<String, GoogleError> {
        let query = format!(
            "name='{}' and mimeType='{SPREADSHEET_MIME}' and trashed=false",
            escape_query_value(name)
        );
        self.find_file(&query)
            .await?
            .ok_or_else(|| GoogleError::NotFound(format!("spreadsheet \"{name}\"")))
    }

    /// Id of the folder `name` inside `parent`, created if absent.
    pub async fn ensure_folder_in(&self, parent: &str, name: &str) -> Result<String, GoogleError> {
        if let Some(id) = self.find_file(&folder_query(parent, name)).await? {
            return Ok(id);
        }

        let url = endpoint(FILES_API, &[])?;
        let request = self.api.http().post(url).query(&[("fields", "id")]).json(&json!({
            "name": name,
            "mimeType": FOLDER_MIME,
            "parents": [parent],
        }));
        let body = self.api.send_json("drive.files.create", request).await?;
        let id = file_id(&body, "drive.files.create")?;
        tracing::info!(folder = name, id = %id, "Drive folder created");
        Ok(id)
    }

    /// Upload `bytes` as a new file in `folder`. Returns the file id.
    pub async fn upload_file(
        &self,
        folder: &str,
        file_name: &str,
        mime_type: &str,
        bytes: Vec<u8>,
    ) -> Result<String, GoogleError> {
        let boundary = format!("revision-bot-{}", uuid::Uuid::new_v4().simple());
        let metadata = json!({ "name": file_name, "parents": [folder] });
        let body = multipart_body(&boundary, &metadata, mime_type, &bytes);

        let url = endpoint(UPLOAD_API, &[])?;
        let request = self
            .api
            .http()
            .post(url)
            .query(&[("uploadType", "multipart"), ("fields", "id")])
            .header(
                reqwest::header::CONTENT_TYPE,
                format!("multipart/related; boundary={boundary}"),
            )
            .body(body);
        let body = self.api.send_json("drive.files.upload", request).await?;
        file_id(&body, "drive.files.upload")
    }

    /// Grant read access to anyone with the link.
    pub async fn make_public(&self, file_id: &str) -> Result<(), GoogleError> {
        let url = endpoint(FILES_API, &[file_id, "permissions"])?;
        let request = self
            .api
            .http()
            .post(url)
            .json(&json!({ "type": "anyone", "role": "reader" }));
        self.api
            .send_json("drive.permissions.create", request)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl PhotoStorage for DriveClient {
    async fn ensure_folder(&self, name: &str) -> Result<String, ReviewError> {
        self.ensure_folder_in(&self.root_folder, name)
            .await
            .map_err(storage_error)
    }

    async fn upload(
        &self,
        folder: &str,
        file_name: &str,
        mime_type: &str,
        bytes: Vec<u8>,
    ) -> Result<ImageReference, ReviewError> {
        let file_id = self
            .upload_file(folder, file_name, mime_type, bytes)
            .await
            .map_err(storage_error)?;
        self.make_public(&file_id).await.map_err(storage_error)?;
        Ok(ImageReference {
            url: public_url(&file_id),
            file_id,
        })
    }
}

/// Link that serves the raw file to anyone.
pub fn public_url(file_id: &str) -> String {
    format!("https://drive.google.com/uc?id={file_id}")
}

fn folder_query(parent: &str, name: &str) -> String {
    format!(
        "'{}' in parents and name='{}' and mimeType='{FOLDER_MIME}' and trashed=false",
        escape_query_value(parent),
        escape_query_value(name)
    )
}

fn multipart_body(boundary: &str, metadata: &Value, mime_type: &str, bytes: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(bytes.len() + 512);
    body.extend_from_slice(
        format!(
            "--{boundary}\r\nContent-Type: application/json; charset=UTF-8\r\n\r\n{metadata}\r\n"
        )
        .as_bytes(),
    );
    body.extend_from_slice(format!("--{boundary}\r\nContent-Type: {mime_type}\r\n\r\n").as_bytes());
    body.extend_from_slice(bytes);
    body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());
    body
}

fn file_id(body: &Value, api: &'static str) -> Result<String, GoogleError> {
    body["id"]
        .as_str()
        .map(String::from)
        .ok_or_else(|| GoogleError::InvalidResponse {
            api,
            reason: "missing file id".into(),
        })
}

fn storage_error(e: GoogleError) -> ReviewError {
    ReviewError::StorageUnavailable(e.to_string())
}
