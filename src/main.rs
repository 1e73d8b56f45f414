mod config;
mod content;
mod debounce;
mod dispatcher;
mod event;
mod handlers;
mod lifecycle;
mod messages;
mod outbound;
mod registry;
mod router;
mod throttle;
mod transport;

use std::sync::Arc;

use teloxide::prelude::*;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::config::{Config, ConfigError};
use crate::content::{Content, Svalko};
use crate::dispatcher::Dispatcher;
use crate::handlers::Handlers;
use crate::outbound::{Sender, TelegramOutbound};
use crate::registry::ChatRegistry;
use crate::router::{Addressing, Router};
use crate::transport::TelegramTransport;

#[derive(Debug, Error)]
enum StartupError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("couldn't reach Telegram: {0}")]
    Telegram(#[from] teloxide::RequestError),
    #[error("couldn't set up content provider: {0}")]
    Content(#[from] content::Error),
    #[error("invalid bot name: {0}")]
    Regex(#[from] regex::Error),
}

async fn run() -> Result<(), StartupError> {
    let config = Config::from_env()?;
    log::debug!("{config:?}");

    let bot = Bot::from_env();
    let me = bot.get_me().await?;
    log::info!(
        "Logged in as @{} ({})",
        me.user.username.as_deref().unwrap_or_default(),
        me.user.id
    );

    let content = Content::new(Arc::new(Svalko::new()?), config.fetch_attempts);
    let sender = Sender::new(Arc::new(TelegramOutbound::new(bot.clone())));
    let registry = ChatRegistry::new(config.privileged_chat.clone());
    let handlers = Handlers::new(content, sender, registry.clone());
    let addressing = Addressing::new(&config.bot_name, me.user.id)?;

    lifecycle::spawn(&registry, handlers.clone());

    let mut router = Router::new();
    router::wire(&mut router, &handlers, &registry, addressing, &config);
    let (inbound, inbound_rx) = mpsc::unbounded_channel();
    tokio::spawn(router.run(inbound_rx));

    let dispatcher = Dispatcher::new(TelegramTransport::new(bot), inbound, config.poll_timeout);
    tokio::select! {
        _ = dispatcher.run() => {}
        _ = tokio::signal::ctrl_c() => log::info!("Received Ctrl+C, shutting down."),
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    env_logger::init();
    log::info!("Starting bot...");

    if let Err(e) = run().await {
        log::error!("{e}");
        std::process::exit(1);
    }
}
