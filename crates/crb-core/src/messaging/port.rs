use async_trait::async_trait;

use crate::{
    domain::ChatId,
    messaging::types::MessagingCapabilities,
    Result,
};

/// Cross-messenger port.
///
/// The router only ever replies with plain text, so that is all the port exposes.
#[async_trait]
pub trait MessagingPort: Send + Sync {
    fn capabilities(&self) -> MessagingCapabilities;

    async fn send_text(&self, chat_id: ChatId, text: &str) -> Result<()>;
}
