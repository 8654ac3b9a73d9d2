//! Per-person review sessions and the store that serializes access to them.

use std::collections::{HashMap, VecDeque};
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

use crate::review::event::{ChatId, Identity};

/// How many stored photo ids a session remembers for retry dedup.
const RECENT_PHOTO_CAPACITY: usize = 32;

/// Where a person is in the review flow.
///
/// `Idle` → `Collecting` (review started) → `Idle` (flushed). `AwaitingPhoto`
/// is entered through the manual photo command, or after a photo's text
/// answers were flushed but the upload has not completed yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SessionStep {
    #[default]
    Idle,
    Collecting,
    AwaitingPhoto,
}

impl SessionStep {
    /// Check if a transition from `self` to `target` is valid.
    pub fn can_transition_to(&self, target: SessionStep) -> bool {
        use SessionStep::*;
        matches!(
            (self, target),
            (Idle, Collecting)
                | (Idle, AwaitingPhoto)
                | (Collecting, Idle)
                | (Collecting, AwaitingPhoto)
                | (AwaitingPhoto, Idle)
                | (AwaitingPhoto, Collecting)
        )
    }

    /// Whether a review or photo upload is in progress.
    pub fn is_active(&self) -> bool {
        !matches!(self, Self::Idle)
    }
}

impl std::fmt::Display for SessionStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Collecting => "collecting",
            Self::AwaitingPhoto => "awaiting_photo",
        };
        write!(f, "{s}")
    }
}

/// Live workflow state of one person.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub identity: Identity,
    pub step: SessionStep,
    /// Index of the question the person is currently answering.
    pub current_question: usize,
    /// Answers in question order.
    pub answers: Vec<String>,
    /// Roster name, refreshed on each event.
    pub display_name: String,
    /// Chat the person last wrote from.
    pub chat: Option<ChatId>,
    /// Set once a text from the person has been handled successfully.
    #[serde(default)]
    pub has_texted: bool,
    /// Unique ids of recently stored photos.
    recent_photos: VecDeque<String>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    pub fn new(identity: Identity, display_name: impl Into<String>) -> Self {
        Self {
            identity,
            step: SessionStep::Idle,
            current_question: 0,
            answers: Vec::new(),
            display_name: display_name.into(),
            chat: None,
            has_texted: false,
            recent_photos: VecDeque::new(),
            updated_at: Utc::now(),
        }
    }

    /// `answers.len() == current_question` whenever the step is `Collecting`.
    pub fn is_consistent(&self) -> bool {
        self.step != SessionStep::Collecting || self.answers.len() == self.current_question
    }

    /// Start collecting from the first question.
    pub fn begin(&mut self) -> Result<(), String> {
        self.transition(SessionStep::Collecting)?;
        self.current_question = 0;
        self.answers.clear();
        Ok(())
    }

    /// Append an answer and advance to the next question. Returns the new
    /// question index.
    pub fn record_answer(&mut self, text: impl Into<String>) -> Result<usize, String> {
        if self.step != SessionStep::Collecting {
            return Err(format!("Cannot record an answer while {}", self.step));
        }
        self.answers.push(text.into());
        self.current_question += 1;
        self.touch();
        Ok(self.current_question)
    }

    /// Switch to photo-only mode. Already-collected answers are kept and
    /// flushed with the next photo.
    pub fn enable_photo_upload(&mut self) -> Result<(), String> {
        if self.step == SessionStep::AwaitingPhoto {
            return Ok(());
        }
        self.transition(SessionStep::AwaitingPhoto)?;
        self.current_question = 0;
        Ok(())
    }

    /// Drop answers that were persisted while a photo is still pending.
    pub fn mark_answers_flushed(&mut self) {
        self.answers.clear();
        self.current_question = 0;
        if self.step == SessionStep::Collecting {
            self.step = SessionStep::AwaitingPhoto;
        }
        self.touch();
    }

    /// Back to `Idle` with no answers.
    pub fn reset(&mut self) {
        self.step = SessionStep::Idle;
        self.current_question = 0;
        self.answers.clear();
        self.touch();
    }

    pub fn has_stored_photo(&self, unique_id: &str) -> bool {
        self.recent_photos.iter().any(|id| id == unique_id)
    }

    pub fn remember_photo(&mut self, unique_id: impl Into<String>) {
        if self.recent_photos.len() == RECENT_PHOTO_CAPACITY {
            self.recent_photos.pop_front();
        }
        self.recent_photos.push_back(unique_id.into());
    }

    fn transition(&mut self, target: SessionStep) -> Result<(), String> {
        if !self.step.can_transition_to(target) {
            return Err(format!("Cannot transition from {} to {}", self.step, target));
        }
        self.step = target;
        self.touch();
        Ok(())
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Exclusive access to one session, held for a whole transition.
pub struct SessionGuard {
    guard: OwnedMutexGuard<Session>,
    created: bool,
}

impl SessionGuard {
    /// Whether this access created the session (first contact).
    pub fn created(&self) -> bool {
        self.created
    }
}

impl Deref for SessionGuard {
    type Target = Session;

    fn deref(&self) -> &Session {
        &self.guard
    }
}

impl DerefMut for SessionGuard {
    fn deref_mut(&mut self) -> &mut Session {
        &mut self.guard
    }
}

/// Owns every session. At most one record exists per identity, and each
/// record sits behind its own lock so transitions for one person never
/// interleave while different persons proceed in parallel.
#[derive(Default)]
pub struct SessionStore {
    sessions: RwLock<HashMap<Identity, Arc<Mutex<Session>>>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock the session for `identity`, creating an idle one if absent.
    /// The display name is refreshed.
    pub async fn get_or_create(&self, identity: &Identity, display_name: &str) -> SessionGuard {
        let (slot, created) = {
            let existing = self.sessions.read().await.get(identity).cloned();
            match existing {
                Some(slot) => (slot, false),
                None => {
                    let mut sessions = self.sessions.write().await;
                    match sessions.get(identity) {
                        Some(slot) => (Arc::clone(slot), false),
                        None => {
                            let slot = Arc::new(Mutex::new(Session::new(
                                identity.clone(),
                                display_name,
                            )));
                            sessions.insert(identity.clone(), Arc::clone(&slot));
                            tracing::debug!(identity = %identity, "Session created");
                            (slot, true)
                        }
                    }
                }
            }
        };

        let mut guard = slot.lock_owned().await;
        if !display_name.is_empty() {
            guard.display_name = display_name.to_string();
        }
        SessionGuard { guard, created }
    }

    /// Lock an existing session.
    pub async fn lock(&self, identity: &Identity) -> Option<SessionGuard> {
        let slot = self.sessions.read().await.get(identity).cloned()?;
        Some(SessionGuard {
            guard: slot.lock_owned().await,
            created: false,
        })
    }

    /// Snapshot of a session.
    pub async fn get(&self, identity: &Identity) -> Option<Session> {
        let slot = self.sessions.read().await.get(identity).cloned()?;
        let session = slot.lock().await;
        Some(session.clone())
    }

    /// Reset a session to `Idle`. Returns `false` if none exists.
    pub async fn reset(&self, identity: &Identity) -> bool {
        match self.lock(identity).await {
            Some(mut session) => {
                session.reset();
                true
            }
            None => false,
        }
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ana() -> Identity {
        Identity::new("@ana")
    }

    #[test]
    fn valid_transitions() {
        use SessionStep::*;
        for (from, to) in [
            (Idle, Collecting),
            (Idle, AwaitingPhoto),
            (Collecting, Idle),
            (Collecting, AwaitingPhoto),
            (AwaitingPhoto, Idle),
            (AwaitingPhoto, Collecting),
        ] {
            assert!(from.can_transition_to(to), "{from} should transition to {to}");
        }
    }

    #[test]
    fn invalid_transitions() {
        use SessionStep::*;
        assert!(!Idle.can_transition_to(Idle));
        assert!(!AwaitingPhoto.can_transition_to(AwaitingPhoto));
    }

    #[test]
    fn display_matches_serde() {
        use SessionStep::*;
        for step in [Idle, Collecting, AwaitingPhoto] {
            let json = serde_json::to_string(&step).unwrap();
            assert_eq!(format!("\"{step}\""), json);
        }
    }

    #[test]
    fn answers_track_question_index() {
        let mut session = Session::new(ana(), "Ana");
        session.begin().unwrap();
        assert!(session.is_consistent());
        for (i, answer) in ["72", "95", "58"].into_iter().enumerate() {
            let next = session.record_answer(answer).unwrap();
            assert_eq!(next, i + 1);
            assert!(session.is_consistent());
        }
        assert_eq!(session.answers, vec!["72", "95", "58"]);
    }

    #[test]
    fn record_answer_requires_collecting() {
        let mut session = Session::new(ana(), "Ana");
        assert!(session.record_answer("x").is_err());
        assert!(session.answers.is_empty());
    }

    #[test]
    fn begin_twice_is_rejected() {
        let mut session = Session::new(ana(), "Ana");
        session.begin().unwrap();
        session.record_answer("72").unwrap();
        assert!(session.begin().is_err());
        assert_eq!(session.answers.len(), 1);
    }

    #[test]
    fn photo_mode_keeps_answers_and_clears_index() {
        let mut session = Session::new(ana(), "Ana");
        session.begin().unwrap();
        session.record_answer("72").unwrap();
        session.enable_photo_upload().unwrap();
        assert_eq!(session.step, SessionStep::AwaitingPhoto);
        assert_eq!(session.current_question, 0);
        assert_eq!(session.answers, vec!["72"]);
    }

    #[test]
    fn mark_flushed_moves_collecting_to_awaiting_photo() {
        let mut session = Session::new(ana(), "Ana");
        session.begin().unwrap();
        session.record_answer("72").unwrap();
        session.mark_answers_flushed();
        assert_eq!(session.step, SessionStep::AwaitingPhoto);
        assert!(session.answers.is_empty());
    }

    #[test]
    fn reset_clears_everything() {
        let mut session = Session::new(ana(), "Ana");
        session.begin().unwrap();
        session.record_answer("72").unwrap();
        session.reset();
        assert_eq!(session.step, SessionStep::Idle);
        assert_eq!(session.current_question, 0);
        assert!(session.answers.is_empty());
    }

    #[test]
    fn recent_photos_are_bounded() {
        let mut session = Session::new(ana(), "Ana");
        for i in 0..(RECENT_PHOTO_CAPACITY + 5) {
            session.remember_photo(format!("p{i}"));
        }
        assert!(!session.has_stored_photo("p0"));
        assert!(session.has_stored_photo(&format!("p{}", RECENT_PHOTO_CAPACITY + 4)));
    }

    #[tokio::test]
    async fn get_or_create_creates_once() {
        let store = SessionStore::new();
        {
            let first = store.get_or_create(&ana(), "Ana").await;
            assert!(first.created());
        }
        let second = store.get_or_create(&Identity::new("ANA"), "Ana M.").await;
        assert!(!second.created());
        assert_eq!(second.display_name, "Ana M.");
        drop(second);
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn concurrent_get_or_create_yields_one_record() {
        let store = Arc::new(SessionStore::new());
        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store.get_or_create(&Identity::new("@ana"), "Ana").await.created()
            }));
        }
        let mut created = 0;
        for handle in handles {
            if handle.await.unwrap() {
                created += 1;
            }
        }
        assert_eq!(created, 1);
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn reset_through_store() {
        let store = SessionStore::new();
        {
            let mut session = store.get_or_create(&ana(), "Ana").await;
            session.begin().unwrap();
            session.record_answer("72").unwrap();
        }
        assert!(store.reset(&ana()).await);
        let snapshot = store.get(&ana()).await.unwrap();
        assert_eq!(snapshot.step, SessionStep::Idle);
        assert!(snapshot.answers.is_empty());
        assert!(!store.reset(&Identity::new("@nobody")).await);
    }

    #[tokio::test]
    async fn lock_serializes_access() {
        let store = Arc::new(SessionStore::new());
        drop(store.get_or_create(&ana(), "Ana").await);

        let guard = store.lock(&ana()).await.unwrap();
        let contender = {
            let store = Arc::clone(&store);
            tokio::spawn(async move { store.lock(&ana()).await.is_some() })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!contender.is_finished());
        drop(guard);
        assert!(contender.await.unwrap());
    }
}
