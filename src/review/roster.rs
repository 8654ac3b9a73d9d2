//! Roster and authorization gate.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::ReviewError;
use crate::review::event::Identity;

/// A person enrolled in the recurring review.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnrolledPerson {
    pub name: String,
    pub identity: Identity,
}

impl EnrolledPerson {
    pub fn new(name: impl Into<String>, identity: impl Into<Identity>) -> Self {
        Self {
            name: name.into(),
            identity: identity.into(),
        }
    }
}

/// Read-only list of enrolled persons.
#[async_trait]
pub trait RosterSource: Send + Sync {
    async fn load_roster(&self) -> Result<Vec<EnrolledPerson>, ReviewError>;
}

/// Resolves inbound identities against the roster.
///
/// The roster is re-read on every call; access decisions never use stale
/// data.
#[derive(Clone)]
pub struct AuthorizationGate {
    roster: Arc<dyn RosterSource>,
}

impl AuthorizationGate {
    pub fn new(roster: Arc<dyn RosterSource>) -> Self {
        Self { roster }
    }

    /// Resolve an identity to its enrolled person.
    pub async fn resolve(&self, identity: &Identity) -> Result<EnrolledPerson, ReviewError> {
        let persons = self.roster.load_roster().await?;
        persons
            .into_iter()
            .find(|p| &p.identity == identity)
            .ok_or_else(|| ReviewError::Unauthorized {
                identity: identity.to_string(),
            })
    }

    /// All enrolled persons, in roster order.
    pub async fn enrolled(&self) -> Result<Vec<EnrolledPerson>, ReviewError> {
        let persons = self.roster.load_roster().await?;
        Ok(persons
            .into_iter()
            .filter(|p| !p.identity.is_empty())
            .collect())
    }
}
