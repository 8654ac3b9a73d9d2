//! `StateStore`: durable key/value state that must survive restarts.

use async_trait::async_trait;

use crate::error::DatabaseError;

/// Settings scoped by owner (a person's identity key, or an internal
/// component name) and key.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn get_setting(
        &self,
        owner: &str,
        key: &str,
    ) -> Result<Option<serde_json::Value>, DatabaseError>;

    async fn set_setting(
        &self,
        owner: &str,
        key: &str,
        value: &serde_json::Value,
    ) -> Result<(), DatabaseError>;

    /// Returns `true` if a value was removed.
    async fn delete_setting(&self, owner: &str, key: &str) -> Result<bool, DatabaseError>;
}
