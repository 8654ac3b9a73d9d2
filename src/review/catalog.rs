//! Question catalog: the ordered prompts driving a review.
//!
//! The last prompt is always the photo-or-decline prompt; it is appended
//! by [`QuestionCatalog::load`] and never comes from the source.

use async_trait::async_trait;

use crate::error::ReviewError;

/// Prompt appended after the sourced questions.
pub const PHOTO_PROMPT: &str = "Por ultimo, adjunta unas fotos para evaluar tu composición corporal \
(Frente, Perfil izquierdo, Perfil derecho y espalda)! Si no lo deseas, escribe NO";

/// Reply that ends a review without photos (compared case/whitespace-insensitively).
pub const DECLINE_TOKEN: &str = "NO";

/// Read-only source of the question prompts.
#[async_trait]
pub trait QuestionSource: Send + Sync {
    async fn load_questions(&self) -> Result<Vec<String>, ReviewError>;
}

/// Immutable snapshot of the prompts for one cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuestionCatalog {
    prompts: Vec<String>,
}

impl QuestionCatalog {
    /// Build a catalog from a complete prompt list whose last entry is the
    /// photo-or-decline prompt. An empty list gets the default photo prompt.
    pub fn from_prompts(prompts: Vec<String>) -> Self {
        if prompts.is_empty() {
            return Self {
                prompts: vec![PHOTO_PROMPT.to_string()],
            };
        }
        Self { prompts }
    }

    /// Load sourced questions and append the photo prompt.
    pub async fn load(source: &dyn QuestionSource) -> Result<Self, ReviewError> {
        let mut prompts: Vec<String> = source
            .load_questions()
            .await?
            .into_iter()
            .map(|q| q.trim().to_string())
            .filter(|q| !q.is_empty())
            .collect();
        prompts.push(PHOTO_PROMPT.to_string());
        tracing::info!(questions = prompts.len(), "Question catalog loaded");
        Ok(Self { prompts })
    }

    /// Number of prompts, photo prompt included. Always at least one.
    pub fn len(&self) -> usize {
        self.prompts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prompts.is_empty()
    }

    /// Index of the photo-or-decline prompt.
    pub fn last_index(&self) -> usize {
        self.prompts.len().saturating_sub(1)
    }

    pub fn get(&self, index: usize) -> Option<&str> {
        self.prompts.get(index).map(String::as_str)
    }

    /// Prompt text for a persisted answer row. Falls back to a synthetic
    /// label when the catalog shrank since the answer was collected.
    pub fn label_for(&self, index: usize) -> String {
        self.get(index)
            .map(String::from)
            .unwrap_or_else(|| format!("Pregunta {}", index + 1))
    }

    pub fn prompts(&self) -> &[String] {
        &self.prompts
    }
}

/// Whether a reply is the decline token.
pub fn is_decline(text: &str) -> bool {
    let normalized: String = text.split_whitespace().collect::<Vec<_>>().join(" ");
    normalized.eq_ignore_ascii_case(DECLINE_TOKEN)
}
