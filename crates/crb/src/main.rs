use std::sync::Arc;

use tracing::info;

use crb_control::HttpControlClient;
use crb_core::{
    config::Config,
    messaging::port::MessagingPort,
    ports::{ControlApi, KeyStore},
    router::{CommandRouter, RouterOptions},
};
use crb_sqlite::{SqliteKeyStore, StoreOptions};
use crb_telegram::TelegramMessenger;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = Arc::new(Config::load()?);
    crb_core::logging::init("crb")?;

    let store = SqliteKeyStore::connect(&StoreOptions::from_config(&cfg)).await?;
    let control = HttpControlClient::from_config(&cfg)?;
    info!(base_url = control.base_url(), "control service client ready");

    let messenger = TelegramMessenger::new(crb_telegram::router::new_bot(&cfg));
    let bot = messenger.bot();

    let router = Arc::new(CommandRouter::new(
        Arc::new(store.clone()) as Arc<dyn KeyStore>,
        Arc::new(control) as Arc<dyn ControlApi>,
        Arc::new(messenger) as Arc<dyn MessagingPort>,
        RouterOptions::from_config(&cfg),
    ));

    let result = crb_telegram::router::run(bot, cfg, router).await;
    store.close().await;
    result
}
