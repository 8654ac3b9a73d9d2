//! The review workflow: authorization, sessions, the conversation engine,
//! persistence, and the weekly scheduler.

pub mod catalog;
pub mod dispatch;
pub mod engine;
pub mod event;
pub mod persistence;
pub mod prompts;
pub mod roster;
pub mod scheduler;
pub mod session;

pub use catalog::{QuestionCatalog, QuestionSource};
pub use dispatch::{Dispatcher, EventHandler};
pub use engine::{ReviewEngine, StartOutcome};
pub use event::{ChatId, Command, EventKind, Identity, InboundEvent, PhotoRef};
pub use persistence::{AnswerRow, AnswerSink, ImageReference, PersistenceAdapter, PhotoStorage};
pub use roster::{AuthorizationGate, EnrolledPerson, RosterSource};
pub use scheduler::{BroadcastReport, FireOutcome, ReviewScheduler, spawn_scheduler_ticker};
pub use session::{Session, SessionStep, SessionStore};
