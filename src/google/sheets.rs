//! Sheets v4 client and the roster, catalog, and answer-sink adapters built
//! on it.
//!
//! Spreadsheets are configured by name (resolved through Drive and cached)
//! or by id.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::RwLock;
use unicode_normalization::UnicodeNormalization;
use unicode_normalization::char::is_combining_mark;

use crate::error::{GoogleError, ReviewError};
use crate::google::client::{GoogleClient, endpoint};
use crate::google::drive::DriveClient;
use crate::review::catalog::QuestionSource;
use crate::review::persistence::{ANSWER_HEADER, AnswerRow, AnswerSink};
use crate::review::roster::{EnrolledPerson, RosterSource};

const SHEETS_API: &str = "https://sheets.googleapis.com/v4/spreadsheets";

const NAME_HEADERS: &[&str] = &["nombre", "name"];
const IDENTITY_HEADERS: &[&str] = &["usuario", "username", "telegram", "user"];

pub struct SheetsClient {
    api: GoogleClient,
    drive: Arc<DriveClient>,
    /// Spreadsheet name → id.
    ids: RwLock<HashMap<String, String>>,
    /// Spreadsheet id → first worksheet title.
    first_titles: RwLock<HashMap<String, String>>,
}

impl SheetsClient {
    pub fn new(api: GoogleClient, drive: Arc<DriveClient>) -> Self {
        Self {
            api,
            drive,
            ids: RwLock::new(HashMap::new()),
            first_titles: RwLock::new(HashMap::new()),
        }
    }

    /// Id of a spreadsheet given by name or id.
    pub async fn spreadsheet_id(&self, name_or_id: &str) -> Result<String, GoogleError> {
        if looks_like_spreadsheet_id(name_or_id) {
            return Ok(name_or_id.to_string());
        }
        if let Some(id) = self.ids.read().await.get(name_or_id) {
            return Ok(id.clone());
        }

        let id = self.drive.find_spreadsheet(name_or_id).await?;
        tracing::debug!(name = name_or_id, id = %id, "Spreadsheet resolved");
        self.ids
            .write()
            .await
            .insert(name_or_id.to_string(), id.clone());
        Ok(id)
    }

    /// Title and numeric id of every worksheet, in order.
    pub async fn worksheets(&self, spreadsheet_id: &str) -> Result<Vec<(i64, String)>, GoogleError> {
        let url = endpoint(SHEETS_API, &[spreadsheet_id])?;
        let request = self
            .api
            .http()
            .get(url)
            .query(&[("fields", "sheets.properties(sheetId,title)")]);
        let body = self.api.send_json("sheets.get", request).await?;
        Ok(body["sheets"]
            .as_array()
            .map(|sheets| {
                sheets
                    .iter()
                    .filter_map(|s| {
                        let props = &s["properties"];
                        Some((props["sheetId"].as_i64()?, props["title"].as_str()?.to_string()))
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    pub async fn first_worksheet_title(&self, spreadsheet_id: &str) -> Result<String, GoogleError> {
        if let Some(title) = self.first_titles.read().await.get(spreadsheet_id) {
            return Ok(title.clone());
        }
        let (_, title) = self
            .worksheets(spreadsheet_id)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| GoogleError::NotFound(format!("worksheets of {spreadsheet_id}")))?;
        self.first_titles
            .write()
            .await
            .insert(spreadsheet_id.to_string(), title.clone());
        Ok(title)
    }

    pub async fn get_values(
        &self,
        spreadsheet_id: &str,
        range: &str,
    ) -> Result<Vec<Vec<String>>, GoogleError> {
        let url = endpoint(SHEETS_API, &[spreadsheet_id, "values", range])?;
        let body = self
            .api
            .send_json("sheets.values.get", self.api.http().get(url))
            .await?;
        Ok(parse_values(&body))
    }

    pub async fn append_values(
        &self,
        spreadsheet_id: &str,
        range: &str,
        rows: Vec<Vec<String>>,
    ) -> Result<(), GoogleError> {
        let segment = format!("{range}:append");
        let url = endpoint(SHEETS_API, &[spreadsheet_id, "values", segment.as_str()])?;
        let request = self
            .api
            .http()
            .post(url)
            .query(&[
                ("valueInputOption", "USER_ENTERED"),
                ("insertDataOption", "INSERT_ROWS"),
            ])
            .json(&json!({ "values": rows }));
        self.api.send_json("sheets.values.append", request).await?;
        Ok(())
    }

    pub async fn update_values(
        &self,
        spreadsheet_id: &str,
        range: &str,
        rows: Vec<Vec<String>>,
    ) -> Result<(), GoogleError> {
        let url = endpoint(SHEETS_API, &[spreadsheet_id, "values", range])?;
        let request = self
            .api
            .http()
            .put(url)
            .query(&[("valueInputOption", "RAW")])
            .json(&json!({ "values": rows }));
        self.api.send_json("sheets.values.update", request).await?;
        Ok(())
    }

    pub async fn clear_values(&self, spreadsheet_id: &str, range: &str) -> Result<(), GoogleError> {
        let segment = format!("{range}:clear");
        let url = endpoint(SHEETS_API, &[spreadsheet_id, "values", segment.as_str()])?;
        let request = self.api.http().post(url).json(&json!({}));
        self.api.send_json("sheets.values.clear", request).await?;
        Ok(())
    }

    pub async fn batch_update(&self, spreadsheet_id: &str, requests: Value) -> Result<(), GoogleError> {
        let segment = format!("{spreadsheet_id}:batchUpdate");
        let url = endpoint(SHEETS_API, &[segment.as_str()])?;
        let request = self
            .api
            .http()
            .post(url)
            .json(&json!({ "requests": requests }));
        self.api.send_json("sheets.batchUpdate", request).await?;
        Ok(())
    }

    /// Values of `range_a1` in the first worksheet of a spreadsheet.
    async fn first_sheet_values(
        &self,
        spreadsheet: &str,
        range_a1: &str,
    ) -> Result<Vec<Vec<String>>, GoogleError> {
        let id = self.spreadsheet_id(spreadsheet).await?;
        let title = self.first_worksheet_title(&id).await?;
        self.get_values(&id, &a1_range(&title, range_a1)).await
    }
}

/// Roster read from the first worksheet of the users spreadsheet.
pub struct SheetRoster {
    sheets: Arc<SheetsClient>,
    spreadsheet: String,
}

impl SheetRoster {
    pub fn new(sheets: Arc<SheetsClient>, spreadsheet: impl Into<String>) -> Self {
        Self {
            sheets,
            spreadsheet: spreadsheet.into(),
        }
    }
}

#[async_trait]
impl RosterSource for SheetRoster {
    async fn load_roster(&self) -> Result<Vec<EnrolledPerson>, ReviewError> {
        let values = self
            .sheets
            .first_sheet_values(&self.spreadsheet, "A1:Z")
            .await
            .map_err(|e| ReviewError::RosterUnavailable(e.to_string()))?;
        parse_roster(&values).map_err(ReviewError::RosterUnavailable)
    }
}

/// Question prompts from column A of the questions spreadsheet.
pub struct SheetQuestions {
    sheets: Arc<SheetsClient>,
    spreadsheet: String,
}

impl SheetQuestions {
    pub fn new(sheets: Arc<SheetsClient>, spreadsheet: impl Into<String>) -> Self {
        Self {
            sheets,
            spreadsheet: spreadsheet.into(),
        }
    }
}

#[async_trait]
impl QuestionSource for SheetQuestions {
    async fn load_questions(&self) -> Result<Vec<String>, ReviewError> {
        let values = self
            .sheets
            .first_sheet_values(&self.spreadsheet, "A1:A")
            .await
            .map_err(|e| ReviewError::CatalogUnavailable(e.to_string()))?;
        Ok(values
            .into_iter()
            .filter_map(|row| row.into_iter().next())
            .map(|q| q.trim().to_string())
            .filter(|q| !q.is_empty())
            .collect())
    }
}

/// Answer rows appended to a named worksheet.
pub struct SheetAnswerSink {
    sheets: Arc<SheetsClient>,
    spreadsheet: String,
    worksheet: String,
}

impl SheetAnswerSink {
    pub fn new(
        sheets: Arc<SheetsClient>,
        spreadsheet: impl Into<String>,
        worksheet: impl Into<String>,
    ) -> Self {
        Self {
            sheets,
            spreadsheet: spreadsheet.into(),
            worksheet: worksheet.into(),
        }
    }

    async fn id(&self) -> Result<String, ReviewError> {
        self.sheets
            .spreadsheet_id(&self.spreadsheet)
            .await
            .map_err(sink_error)
    }

    fn range(&self, range_a1: &str) -> String {
        a1_range(&self.worksheet, range_a1)
    }
}

#[async_trait]
impl AnswerSink for SheetAnswerSink {
    async fn header(&self) -> Result<Option<Vec<String>>, ReviewError> {
        let id = self.id().await?;
        let values = self
            .sheets
            .get_values(&id, &self.range("A1:Z1"))
            .await
            .map_err(sink_error)?;
        Ok(values.into_iter().next())
    }

    async fn clear(&self) -> Result<(), ReviewError> {
        let id = self.id().await?;
        self.sheets
            .clear_values(&id, &quote_title(&self.worksheet))
            .await
            .map_err(sink_error)
    }

    async fn write_header(&self, header: &[&str]) -> Result<(), ReviewError> {
        let id = self.id().await?;
        let range = self.range("A1:E1");
        let current = self
            .sheets
            .get_values(&id, &range)
            .await
            .map_err(sink_error)?;
        let wanted: Vec<String> = header.iter().map(|h| h.to_string()).collect();
        if current.first() == Some(&wanted) {
            return Err(ReviewError::DuplicateHeaderWrite);
        }
        self.sheets
            .update_values(&id, &range, vec![wanted])
            .await
            .map_err(sink_error)
    }

    async fn freeze_header(&self) -> Result<(), ReviewError> {
        let id = self.id().await?;
        let sheet_id = self
            .sheets
            .worksheets(&id)
            .await
            .map_err(sink_error)?
            .into_iter()
            .find(|(_, title)| title == &self.worksheet)
            .map(|(sheet_id, _)| sheet_id)
            .ok_or_else(|| {
                ReviewError::SinkUnavailable(format!("worksheet \"{}\" not found", self.worksheet))
            })?;

        let requests = json!([{
            "updateSheetProperties": {
                "properties": {
                    "sheetId": sheet_id,
                    "gridProperties": { "frozenRowCount": 1 }
                },
                "fields": "gridProperties.frozenRowCount"
            }
        }]);
        self.sheets
            .batch_update(&id, requests)
            .await
            .map_err(freeze_error)
    }

    async fn append_rows(&self, rows: &[AnswerRow]) -> Result<(), ReviewError> {
        if rows.is_empty() {
            return Ok(());
        }
        let id = self.id().await?;
        let values = rows
            .iter()
            .map(|row| row.cells().iter().map(|c| c.to_string()).collect())
            .collect();
        let last_column = column_letter(ANSWER_HEADER.len() - 1);
        self.sheets
            .append_values(&id, &self.range(&format!("A:{last_column}")), values)
            .await
            .map_err(sink_error)
    }
}

fn sink_error(e: GoogleError) -> ReviewError {
    ReviewError::SinkUnavailable(e.to_string())
}

/// Sheets refuses to freeze every visible row of a sheet that holds only
/// the header.
fn freeze_error(e: GoogleError) -> ReviewError {
    match e {
        GoogleError::Status {
            status: 400, body, ..
        } if body.to_lowercase().contains("freeze") => ReviewError::FreezeUnsupported {
            single_row: body.to_lowercase().contains("visible rows"),
            reason: body,
        },
        other => sink_error(other),
    }
}

/// Lowercase, trimmed, and stripped of diacritics.
pub fn normalize_header(value: &str) -> String {
    value
        .nfd()
        .filter(|c| !is_combining_mark(*c))
        .collect::<String>()
        .trim()
        .to_lowercase()
}

fn parse_roster(values: &[Vec<String>]) -> Result<Vec<EnrolledPerson>, String> {
    let Some((header, rows)) = values.split_first() else {
        return Ok(Vec::new());
    };
    let headers: Vec<String> = header.iter().map(|h| normalize_header(h)).collect();
    let find = |names: &[&str]| headers.iter().position(|h| names.contains(&h.as_str()));

    let (Some(name_col), Some(identity_col)) = (find(NAME_HEADERS), find(IDENTITY_HEADERS)) else {
        return Err("roster must have \"Nombre\" and \"Usuario\" columns".to_string());
    };

    Ok(rows
        .iter()
        .filter_map(|row| {
            let identity = row.get(identity_col)?.trim();
            if identity.is_empty() {
                return None;
            }
            let name = row.get(name_col).map(|n| n.trim()).unwrap_or_default();
            Some(EnrolledPerson::new(name, identity))
        })
        .collect())
}

fn parse_values(body: &Value) -> Vec<Vec<String>> {
    body["values"]
        .as_array()
        .map(|rows| {
            rows.iter()
                .map(|row| {
                    row.as_array()
                        .map(|cells| cells.iter().map(cell_text).collect())
                        .unwrap_or_default()
                })
                .collect()
        })
        .unwrap_or_default()
}

fn cell_text(cell: &Value) -> String {
    match cell {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// `'Title'!A1:B2`, with quotes in the title doubled.
fn a1_range(title: &str, range: &str) -> String {
    format!("{}!{range}", quote_title(title))
}

fn quote_title(title: &str) -> String {
    format!("'{}'", title.replace('\'', "''"))
}

/// Zero-based column index to its A1 letters.
fn column_letter(index: usize) -> String {
    let mut n = index + 1;
    let mut letters = Vec::new();
    while n > 0 {
        let rem = (n - 1) % 26;
        letters.push((b'A' + rem as u8) as char);
        n = (n - 1) / 26;
    }
    letters.iter().rev().collect()
}

/// Spreadsheet ids are long base64url strings; names rarely are.
fn looks_like_spreadsheet_id(value: &str) -> bool {
    value.len() >= 40
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rows(raw: &[&[&str]]) -> Vec<Vec<String>> {
        raw.iter()
            .map(|r| r.iter().map(|c| c.to_string()).collect())
            .collect()
    }

    #[test]
    fn header_normalization_folds_accents_and_case() {
        assert_eq!(normalize_header("  Contraseñas "), "contrasenas");
        assert_eq!(normalize_header("NOMBRE"), "nombre");
        assert_eq!(normalize_header("Teléfono"), "telefono");
    }

    #[test]
    fn roster_columns_found_by_alias() {
        let values = rows(&[
            &["Email", "Nombre", "Usuario"],
            &["a@x.es", " Ana ", "@ana"],
            &["l@x.es", "Luis", ""],
            &["m@x.es", "Marta", "marta"],
        ]);
        let persons = parse_roster(&values).unwrap();
        assert_eq!(persons.len(), 2);
        assert_eq!(persons[0].name, "Ana");
        assert_eq!(persons[0].identity.as_str(), "@ana");
        assert_eq!(persons[1].identity.key(), "marta");
    }

    #[test]
    fn roster_short_rows_are_skipped() {
        let values = rows(&[&["Name", "Telegram"], &["Solo nombre"]]);
        assert!(parse_roster(&values).unwrap().is_empty());
    }

    #[test]
    fn roster_without_identity_column_is_rejected() {
        let values = rows(&[&["Nombre", "Email"], &["Ana", "a@x.es"]]);
        assert!(parse_roster(&values).is_err());
    }

    #[test]
    fn empty_roster_sheet_is_empty() {
        assert!(parse_roster(&[]).unwrap().is_empty());
    }

    #[test]
    fn values_parse_mixed_cells() {
        let body = json!({ "values": [["a", 1, null], []] });
        assert_eq!(
            parse_values(&body),
            vec![vec!["a".to_string(), "1".to_string(), String::new()], vec![]]
        );
        assert!(parse_values(&json!({})).is_empty());
    }

    #[test]
    fn ranges_quote_titles() {
        assert_eq!(a1_range("Revision", "A1:E1"), "'Revision'!A1:E1");
        assert_eq!(a1_range("Ana's", "A:E"), "'Ana''s'!A:E");
    }

    #[test]
    fn column_letters() {
        assert_eq!(column_letter(0), "A");
        assert_eq!(column_letter(4), "E");
        assert_eq!(column_letter(25), "Z");
        assert_eq!(column_letter(26), "AA");
    }

    #[test]
    fn spreadsheet_id_detection() {
        assert!(looks_like_spreadsheet_id(
            "1BxiMVs0XRA5nFMdKvBdBZjgmUUqptlbs74OgvE2upms"
        ));
        assert!(!looks_like_spreadsheet_id("Revisiones"));
        assert!(!looks_like_spreadsheet_id(
            "Revisiones semanales de todos los atletas 2026"
        ));
    }

    #[test]
    fn single_row_freeze_error_is_recognized() {
        let err = freeze_error(GoogleError::Status {
            api: "sheets.batchUpdate",
            status: 400,
            body: "Invalid requests[0].updateSheetProperties: You can't freeze all visible rows on the sheet.".into(),
        });
        assert!(matches!(err, ReviewError::FreezeUnsupported { single_row: true, .. }));

        let err = freeze_error(GoogleError::Status {
            api: "sheets.batchUpdate",
            status: 403,
            body: "forbidden".into(),
        });
        assert!(matches!(err, ReviewError::SinkUnavailable(_)));
    }
}
