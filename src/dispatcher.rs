use std::time::Duration;

use tokio::sync::mpsc;

use crate::event::Event;
use crate::transport::{Transport, TransportError};

const TRANSIENT_BACKOFF: Duration = Duration::from_secs(10);
const RATE_LIMIT_MARGIN: Duration = Duration::from_secs(1);

/// Offset that acknowledges update `id`, `None` when it doesn't fit.
fn next_offset(id: u32) -> Option<i32> {
    i32::try_from(id).ok()?.checked_add(1)
}

/// Long-polls the transport and feeds every event into the inbound channel.
pub struct Dispatcher<T> {
    transport: T,
    inbound: mpsc::UnboundedSender<Event>,
    offset: Option<i32>,
    poll_timeout: u32,
}

impl<T: Transport> Dispatcher<T> {
    pub fn new(transport: T, inbound: mpsc::UnboundedSender<Event>, poll_timeout: Duration) -> Self {
        Self {
            transport,
            inbound,
            offset: None,
            poll_timeout: u32::try_from(poll_timeout.as_secs()).unwrap_or(u32::MAX),
        }
    }

    /// Runs until nobody consumes the inbound channel anymore. Transport
    /// failures are never fatal.
    pub async fn run(mut self) {
        log::info!("Polling for updates...");
        loop {
            match self.transport.get_updates(self.offset, self.poll_timeout).await {
                Ok(events) => {
                    for event in events {
                        match next_offset(event.id) {
                            Some(offset) => self.offset = Some(offset),
                            None => log::error!("Update id {} is out of offset range", event.id),
                        }
                        if self.inbound.send(event).is_err() {
                            log::info!("Inbound channel closed, dispatcher shut down.");
                            return;
                        }
                    }
                }
                Err(TransportError::RateLimited(wait)) => {
                    log::warn!("Rate limited by Telegram, waiting {wait:?}");
                    tokio::time::sleep(wait + RATE_LIMIT_MARGIN).await;
                }
                Err(e) => {
                    log::error!("Failed to get updates: {e}");
                    tokio::time::sleep(TRANSIENT_BACKOFF).await;
                }
            }

            if self.inbound.is_closed() {
                log::info!("Inbound channel closed, dispatcher shut down.");
                return;
            }
        }
    }
}
