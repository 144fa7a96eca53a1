use async_trait::async_trait;

use crate::{
    domain::{ApiKey, ControlAction, UserId},
    status::StatusRecord,
    Result,
};

/// Persistent `user_id -> api_key` association.
///
/// Each call is a single atomic operation; no transaction spans calls.
#[async_trait]
pub trait KeyStore: Send + Sync {
    /// Point lookup; `Ok(None)` when the sender never registered.
    async fn find_key(&self, user_id: UserId) -> Result<Option<ApiKey>>;

    /// Insert or replace the binding for `user_id`.
    async fn upsert_key(&self, user_id: UserId, api_key: &ApiKey) -> Result<()>;
}

/// Hexagonal port for the remote control service.
///
/// Implementations map transport failures and non-2xx responses to `Error::Control`
/// and unparsable bodies to `Error::MalformedResponse`.
#[async_trait]
pub trait ControlApi: Send + Sync {
    /// Fire a state-changing action (`start` / `stop`). The response body is ignored.
    async fn trigger(&self, api_key: &ApiKey, action: ControlAction) -> Result<()>;

    /// Fetch the structured status record (`data` action).
    async fn status(&self, api_key: &ApiKey) -> Result<StatusRecord>;
}
