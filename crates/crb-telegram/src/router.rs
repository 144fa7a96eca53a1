use std::{
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};

use teloxide::{
    dispatching::{update_listeners::webhooks, Dispatcher},
    dptree,
    error_handlers::LoggingErrorHandler,
    prelude::*,
};
use tracing::{debug, info, warn};

use crb_core::{config::Config, router::CommandRouter};

use crate::handlers;

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Clone)]
pub struct AppState {
    pub router: Arc<CommandRouter>,
}

/// How updates reach the bot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Delivery {
    Polling,
    Webhook { addr: SocketAddr, url: reqwest::Url },
}

impl Delivery {
    pub fn from_config(cfg: &Config) -> anyhow::Result<Self> {
        let Some(raw) = cfg.telegram_webhook_url.as_deref() else {
            return Ok(Delivery::Polling);
        };
        let url = reqwest::Url::parse(raw)
            .map_err(|e| anyhow::anyhow!("invalid TELEGRAM_WEBHOOK_URL {raw:?}: {e}"))?;
        Ok(Delivery::Webhook {
            addr: SocketAddr::from(([0, 0, 0, 0], cfg.webhook_port)),
            url,
        })
    }
}

pub fn new_bot(cfg: &Config) -> Bot {
    Bot::new(cfg.telegram_bot_token.clone())
}

pub async fn run(bot: Bot, cfg: Arc<Config>, router: Arc<CommandRouter>) -> anyhow::Result<()> {
    let delivery = Delivery::from_config(&cfg)?;

    match bot.get_me().await {
        Ok(me) => info!(username = %me.username(), "bot started"),
        Err(e) => warn!(error = %e, "get_me failed"),
    }
    info!(
        control = %cfg.control_base_url,
        allowed_users = cfg.telegram_allowed_users.len(),
        "relaying commands"
    );

    let sweeper = tokio::spawn(sweep_idle(router.clone()));

    let state = Arc::new(AppState { router });

    let handler =
        dptree::entry().branch(Update::filter_message().endpoint(handlers::handle_message));

    let mut dispatcher = Dispatcher::builder(bot.clone(), handler)
        .dependencies(dptree::deps![state])
        .default_handler(|upd| async move {
            debug!(update_id = ?upd.id, "unhandled update");
        })
        .enable_ctrlc_handler()
        .build();

    match delivery {
        Delivery::Polling => {
            info!("delivery: long polling");
            dispatcher.dispatch().await;
        }
        Delivery::Webhook { addr, url } => {
            info!(%addr, %url, "delivery: webhook");
            let listener = webhooks::axum(bot, webhooks::Options::new(addr, url))
                .await
                .map_err(|e| anyhow::anyhow!("webhook setup failed: {e}"))?;
            dispatcher
                .dispatch_with_listener(
                    listener,
                    LoggingErrorHandler::with_custom_text("update listener error"),
                )
                .await;
        }
    }

    sweeper.abort();
    info!("bot stopped");
    Ok(())
}

async fn sweep_idle(router: Arc<CommandRouter>) {
    let mut tick = tokio::time::interval(SWEEP_INTERVAL);
    loop {
        tick.tick().await;
        let (pending, buckets) = router.sweep(Instant::now()).await;
        if pending + buckets > 0 {
            debug!(pending, buckets, "idle router state dropped");
        }
    }
}
