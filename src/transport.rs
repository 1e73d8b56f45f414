use std::time::Duration;

use futures::future::BoxFuture;
use teloxide::prelude::*;
use teloxide::RequestError;
use thiserror::Error;

use crate::event::Event;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transient transport failure: {0}")]
    Transient(RequestError),
    #[error("rate limited, retry after {0:?}")]
    RateLimited(Duration),
}

impl From<RequestError> for TransportError {
    fn from(e: RequestError) -> Self {
        match e {
            RequestError::RetryAfter(wait) => TransportError::RateLimited(wait.duration()),
            e => TransportError::Transient(e),
        }
    }
}

/// Long-poll source of events. `offset` is the id of the first event wanted.
pub trait Transport: Send + 'static {
    fn get_updates(
        &mut self,
        offset: Option<i32>,
        timeout: u32,
    ) -> BoxFuture<'_, Result<Vec<Event>, TransportError>>;
}

pub struct TelegramTransport {
    bot: Bot,
}

impl TelegramTransport {
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }
}

impl Transport for TelegramTransport {
    fn get_updates(
        &mut self,
        offset: Option<i32>,
        timeout: u32,
    ) -> BoxFuture<'_, Result<Vec<Event>, TransportError>> {
        Box::pin(async move {
            let mut request = self.bot.get_updates().timeout(timeout);
            if let Some(offset) = offset {
                request = request.offset(offset);
            }
            let updates = request.await?;
            Ok(updates.into_iter().map(Event::from_update).collect())
        })
    }
}
