//! Conversation engine: the per-person review state machine.
//!
//! Every transition runs while holding the person's session lock, so the
//! read-modify-write of a session never interleaves with another event for
//! the same identity. Outbound messages are sent before the session is
//! mutated; a failed send or a failed write leaves the session as it was,
//! and re-sending the same text or photo resumes correctly.

use std::sync::Arc;

use tokio::sync::RwLock;

use crate::channels::{Channel, OutgoingMessage};
use crate::config::EngineConfig;
use crate::error::ReviewError;
use crate::review::catalog::{QuestionCatalog, QuestionSource, is_decline};
use crate::review::event::{ChatId, Command, EventKind, Identity, InboundEvent, PhotoRef};
use crate::review::persistence::{FlushRequest, PersistenceAdapter, PhotoSubmission};
use crate::review::prompts;
use crate::review::roster::{AuthorizationGate, EnrolledPerson};
use crate::review::session::{SessionGuard, SessionStep, SessionStore};
use crate::store::StateStore;

/// Settings key holding the chat a person last wrote from.
const CHAT_KEY: &str = "chat_id";

/// Result of asking the engine to start a scheduled review for one person.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    /// A review with unsaved answers is in progress; left untouched.
    AlreadyActive,
    /// No chat is known for the person yet.
    Unreachable,
}

pub struct ReviewEngine {
    gate: AuthorizationGate,
    sessions: SessionStore,
    catalog: RwLock<Arc<QuestionCatalog>>,
    catalog_source: Option<Arc<dyn QuestionSource>>,
    persistence: PersistenceAdapter,
    channel: Arc<dyn Channel>,
    state: Option<Arc<dyn StateStore>>,
    config: EngineConfig,
}

impl ReviewEngine {
    pub fn new(
        gate: AuthorizationGate,
        catalog: QuestionCatalog,
        persistence: PersistenceAdapter,
        channel: Arc<dyn Channel>,
        config: EngineConfig,
    ) -> Self {
        Self {
            gate,
            sessions: SessionStore::new(),
            catalog: RwLock::new(Arc::new(catalog)),
            catalog_source: None,
            persistence,
            channel,
            state: None,
            config,
        }
    }

    /// Persist the chat directory so broadcasts reach people after a restart.
    pub fn with_state_store(mut self, state: Arc<dyn StateStore>) -> Self {
        self.state = Some(state);
        self
    }

    /// Source used by [`ReviewEngine::refresh_catalog`].
    pub fn with_catalog_source(mut self, source: Arc<dyn QuestionSource>) -> Self {
        self.catalog_source = Some(source);
        self
    }

    pub fn has_catalog_source(&self) -> bool {
        self.catalog_source.is_some()
    }

    pub fn gate(&self) -> &AuthorizationGate {
        &self.gate
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    /// Current catalog snapshot.
    pub async fn catalog(&self) -> Arc<QuestionCatalog> {
        Arc::clone(&*self.catalog.read().await)
    }

    /// Reload the catalog from its source and swap it in. Returns the new
    /// prompt count. Sessions in flight keep their index.
    pub async fn refresh_catalog(&self) -> Result<usize, ReviewError> {
        let source = self.catalog_source.as_ref().ok_or_else(|| {
            ReviewError::CatalogUnavailable("no question source configured".into())
        })?;
        let fresh = QuestionCatalog::load(source.as_ref()).await?;
        let len = fresh.len();
        *self.catalog.write().await = Arc::new(fresh);
        tracing::info!(questions = len, "Question catalog refreshed");
        Ok(len)
    }

    /// Handle one inbound event. Never fails: errors are logged and turned
    /// into a short reply where one is due.
    pub async fn handle_event(&self, event: InboundEvent) {
        let sender = event.sender.clone();
        let chat = event.chat.clone();
        let kind = event.kind.label();

        let Err(err) = self.process(event).await else {
            return;
        };

        match &err {
            ReviewError::Unauthorized { .. } => {
                tracing::info!(identity = %sender, "Rejected event from unknown identity");
            }
            ReviewError::MalformedEvent(reason) => {
                tracing::warn!(identity = %sender, kind, "Dropped malformed event: {reason}");
            }
            e => {
                tracing::error!(identity = %sender, kind, error = %e, "Event handling failed");
            }
        }

        if let Some(text) = err.user_message(&self.config.admin_contact) {
            if let Err(e) = self.channel.send(&chat, OutgoingMessage::plain(text)).await {
                tracing::error!(identity = %sender, error = %e, "Failed to send error reply");
            }
        }
    }

    /// Start a review for one person from the weekly broadcast.
    ///
    /// A person mid-review keeps their answers: the trigger is a no-op for
    /// them.
    pub async fn start_scheduled(
        &self,
        person: &EnrolledPerson,
    ) -> Result<StartOutcome, ReviewError> {
        let mut session = match self.sessions.lock(&person.identity).await {
            Some(session) => session,
            None => {
                if self.stored_chat(&person.identity).await.is_none() {
                    return Ok(StartOutcome::Unreachable);
                }
                self.sessions
                    .get_or_create(&person.identity, &person.name)
                    .await
            }
        };

        if has_unsaved_review(&session) {
            tracing::debug!(identity = %person.identity, step = %session.step, "Review already in progress");
            return Ok(StartOutcome::AlreadyActive);
        }

        let chat = match session.chat.clone() {
            Some(chat) => chat,
            None => match self.stored_chat(&person.identity).await {
                Some(chat) => {
                    session.chat = Some(chat.clone());
                    chat
                }
                None => return Ok(StartOutcome::Unreachable),
            },
        };

        session.display_name = person.name.clone();
        self.begin_review(&mut session, &chat).await?;
        Ok(StartOutcome::Started)
    }

    async fn process(&self, event: InboundEvent) -> Result<(), ReviewError> {
        // Commands that need no enrollment.
        match &event.kind {
            EventKind::Command(Command::Info) => {
                return self
                    .send(
                        &event.chat,
                        OutgoingMessage::markdown(prompts::info(&self.config.admin_contact)),
                    )
                    .await;
            }
            EventKind::Command(Command::Instructions) => {
                return self
                    .send(&event.chat, OutgoingMessage::markdown(prompts::INSTRUCTIONS))
                    .await;
            }
            EventKind::Command(Command::Unknown(name)) => {
                return Err(ReviewError::MalformedEvent(format!("unknown command /{name}")));
            }
            _ => {}
        }

        let person = self.gate.resolve(&event.sender).await?;
        let mut session = self
            .sessions
            .get_or_create(&person.identity, &person.name)
            .await;
        self.remember_chat(&mut session, &event.chat).await;

        tracing::debug!(
            identity = %person.identity,
            kind = event.kind.label(),
            step = %session.step,
            created = session.created(),
            "Handling event"
        );

        match &event.kind {
            EventKind::Command(Command::Start) => {
                self.send(&event.chat, OutgoingMessage::plain(prompts::welcome(&person.name)))
                    .await
            }
            EventKind::Command(Command::Revision) => {
                if has_unsaved_review(&session) {
                    return self.resend_current(&session, &event.chat).await;
                }
                self.send(&event.chat, OutgoingMessage::plain(prompts::REVIEW_LAUNCHED))
                    .await?;
                self.begin_review(&mut session, &event.chat).await
            }
            EventKind::Command(Command::Photos) => {
                if session.step != SessionStep::AwaitingPhoto {
                    ensure_transition(&session, SessionStep::AwaitingPhoto)?;
                }
                self.send(
                    &event.chat,
                    OutgoingMessage::markdown(prompts::PHOTO_MODE_ENABLED),
                )
                .await?;
                session
                    .enable_photo_upload()
                    .map_err(ReviewError::InvalidTransition)?;
                tracing::info!(identity = %person.identity, "Photo upload enabled");
                Ok(())
            }
            EventKind::Command(_) => Ok(()),
            EventKind::Text(text) => {
                let handled = match session.step {
                    // The first text ever starts a review, even after /start or a photo.
                    SessionStep::Idle if !session.has_texted => {
                        self.begin_review(&mut session, &event.chat).await
                    }
                    SessionStep::Idle => {
                        self.send(
                            &event.chat,
                            OutgoingMessage::plain(prompts::idle_greeting(&person.name)),
                        )
                        .await
                    }
                    SessionStep::Collecting => {
                        self.collect_answer(&mut session, &person, &event.chat, text)
                            .await
                    }
                    SessionStep::AwaitingPhoto => {
                        self.text_while_awaiting_photo(&mut session, &person, &event.chat, text)
                            .await
                    }
                };
                if handled.is_ok() {
                    session.has_texted = true;
                }
                handled
            }
            EventKind::Photo(photo) => {
                self.accept_photo(&mut session, &person, &event.chat, photo)
                    .await
            }
        }
    }

    /// Greet, introduce, and ask the first question.
    async fn begin_review(
        &self,
        session: &mut SessionGuard,
        chat: &ChatId,
    ) -> Result<(), ReviewError> {
        ensure_transition(session, SessionStep::Collecting)?;
        let catalog = self.catalog().await;

        let greeting = format!(
            "{}\n\n{}",
            prompts::review_greeting(&session.display_name),
            prompts::REVIEW_INTRO
        );
        self.send(chat, OutgoingMessage::plain(greeting)).await?;
        self.send(chat, OutgoingMessage::plain(catalog.label_for(0)))
            .await?;

        session.begin().map_err(ReviewError::InvalidTransition)?;
        tracing::info!(identity = %session.identity, questions = catalog.len(), "Review started");
        Ok(())
    }

    /// Repeat the prompt the person is expected to answer.
    async fn resend_current(&self, session: &SessionGuard, chat: &ChatId) -> Result<(), ReviewError> {
        let catalog = self.catalog().await;
        let index = match session.step {
            SessionStep::AwaitingPhoto => catalog.last_index(),
            _ => session.current_question,
        };
        self.send(chat, OutgoingMessage::plain(catalog.label_for(index)))
            .await
    }

    async fn collect_answer(
        &self,
        session: &mut SessionGuard,
        person: &EnrolledPerson,
        chat: &ChatId,
        text: &str,
    ) -> Result<(), ReviewError> {
        let catalog = self.catalog().await;
        let index = session.current_question;

        if index < catalog.last_index() {
            self.send(chat, OutgoingMessage::plain(catalog.label_for(index + 1)))
                .await?;
            let next = session
                .record_answer(text)
                .map_err(ReviewError::InvalidTransition)?;
            tracing::debug!(identity = %person.identity, question = next, "Answer recorded");
            return Ok(());
        }

        // Photo-or-decline prompt, or past the end if the catalog shrank.
        let declined = index == catalog.last_index() && is_decline(text);
        let mut answers = session.answers.clone();
        answers.push(text.to_string());

        let rows = self
            .persistence
            .flush(
                FlushRequest {
                    person_name: &person.name,
                    identity: &session.identity,
                    answers: &answers,
                },
                &catalog,
            )
            .await?;
        session.reset();
        tracing::info!(identity = %person.identity, rows, declined, "Review completed");

        let reply = if declined {
            prompts::DECLINE_CONFIRMED
        } else {
            prompts::REVIEW_COMPLETED
        };
        self.send(chat, OutgoingMessage::plain(reply)).await
    }

    async fn text_while_awaiting_photo(
        &self,
        session: &mut SessionGuard,
        person: &EnrolledPerson,
        chat: &ChatId,
        text: &str,
    ) -> Result<(), ReviewError> {
        let catalog = self.catalog().await;
        if !is_decline(text) {
            let prompt = catalog.label_for(catalog.last_index());
            return self.send(chat, OutgoingMessage::plain(prompt)).await;
        }

        let answers = session.answers.clone();
        self.persistence
            .flush(
                FlushRequest {
                    person_name: &person.name,
                    identity: &session.identity,
                    answers: &answers,
                },
                &catalog,
            )
            .await?;
        session.reset();
        self.send(chat, OutgoingMessage::plain(prompts::DECLINE_CONFIRMED))
            .await
    }

    /// Store a photo. While a review or photo mode is active, pending
    /// answers are flushed first and the session returns to `Idle`; an idle
    /// person's photo is stored as a one-off.
    async fn accept_photo(
        &self,
        session: &mut SessionGuard,
        person: &EnrolledPerson,
        chat: &ChatId,
        photo: &PhotoRef,
    ) -> Result<(), ReviewError> {
        if session.has_stored_photo(&photo.unique_id) {
            tracing::info!(identity = %person.identity, "Photo already stored, not uploading again");
            return self
                .send(chat, OutgoingMessage::plain(prompts::PHOTO_STORED))
                .await;
        }

        let bytes = self.channel.download(photo).await?;
        let catalog = self.catalog().await;
        let active = session.step.is_active();
        let pending = if active {
            session.answers.clone()
        } else {
            Vec::new()
        };

        let submission = PhotoSubmission {
            person_name: &person.name,
            identity: &session.identity,
            photo,
            bytes,
            pending_answers: &pending,
        };
        match self.persistence.submit_photo(submission, &catalog).await {
            Ok(receipt) => {
                session.remember_photo(photo.unique_id.clone());
                if active {
                    session.reset();
                }
                tracing::info!(
                    identity = %person.identity,
                    answer_rows = receipt.answer_rows,
                    one_off = !active,
                    "Photo accepted"
                );
                self.send(chat, OutgoingMessage::plain(prompts::PHOTO_STORED))
                    .await
            }
            Err(failure) => {
                if failure.answers_flushed {
                    session.mark_answers_flushed();
                }
                Err(failure.error)
            }
        }
    }

    async fn remember_chat(&self, session: &mut SessionGuard, chat: &ChatId) {
        if session.chat.as_ref() == Some(chat) {
            return;
        }
        session.chat = Some(chat.clone());

        if let Some(state) = &self.state {
            let value = serde_json::Value::String(chat.0.clone());
            if let Err(e) = state
                .set_setting(session.identity.key(), CHAT_KEY, &value)
                .await
            {
                tracing::warn!(identity = %session.identity, error = %e, "Failed to persist chat id");
            }
        }
    }

    async fn stored_chat(&self, identity: &Identity) -> Option<ChatId> {
        let state = self.state.as_ref()?;
        match state.get_setting(identity.key(), CHAT_KEY).await {
            Ok(value) => value
                .as_ref()
                .and_then(|v| v.as_str())
                .map(ChatId::from),
            Err(e) => {
                tracing::warn!(identity = %identity, error = %e, "Failed to read chat id");
                None
            }
        }
    }

    async fn send(&self, chat: &ChatId, message: OutgoingMessage) -> Result<(), ReviewError> {
        self.channel.send(chat, message).await?;
        Ok(())
    }
}

/// Whether the session holds answers that a restart would throw away.
fn has_unsaved_review(session: &SessionGuard) -> bool {
    match session.step {
        SessionStep::Collecting => true,
        SessionStep::AwaitingPhoto => !session.answers.is_empty(),
        SessionStep::Idle => false,
    }
}

fn ensure_transition(session: &SessionGuard, target: SessionStep) -> Result<(), ReviewError> {
    if session.step.can_transition_to(target) {
        Ok(())
    } else {
        Err(ReviewError::InvalidTransition(format!(
            "{} to {target}",
            session.step
        )))
    }
}
