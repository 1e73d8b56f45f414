use std::sync::Arc;

use futures::future::BoxFuture;
use teloxide::adaptors::Throttle;
use teloxide::prelude::*;
use teloxide::types::{InputFile, MessageId, ReplyParameters};
use teloxide::RequestError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum OutboundError {
    #[error("request timed out")]
    Timeout,
    #[error("request failed: {0}")]
    Request(#[from] RequestError),
}

impl OutboundError {
    fn from_request(e: RequestError) -> Self {
        match &e {
            RequestError::Network(inner) if inner.is_timeout() => OutboundError::Timeout,
            _ => OutboundError::Request(e),
        }
    }
}

pub trait Outbound: Send + Sync + 'static {
    fn send_text(
        &self,
        chat_id: ChatId,
        text: String,
        reply_to: Option<MessageId>,
    ) -> BoxFuture<'_, Result<(), OutboundError>>;

    fn send_photo(
        &self,
        chat_id: ChatId,
        image: Vec<u8>,
        caption: Option<String>,
    ) -> BoxFuture<'_, Result<(), OutboundError>>;
}

/// Sends through Telegram, respecting its flood limits.
pub struct TelegramOutbound {
    bot: Throttle<Bot>,
}

impl TelegramOutbound {
    pub fn new(bot: Bot) -> Self {
        Self {
            bot: bot.throttle(Default::default()),
        }
    }
}

impl Outbound for TelegramOutbound {
    fn send_text(
        &self,
        chat_id: ChatId,
        text: String,
        reply_to: Option<MessageId>,
    ) -> BoxFuture<'_, Result<(), OutboundError>> {
        Box::pin(async move {
            let mut request = self.bot.send_message(chat_id, text);
            if let Some(reply_to) = reply_to {
                request = request.reply_parameters(ReplyParameters::new(reply_to));
            }
            request.await.map_err(OutboundError::from_request)?;
            Ok(())
        })
    }

    fn send_photo(
        &self,
        chat_id: ChatId,
        image: Vec<u8>,
        caption: Option<String>,
    ) -> BoxFuture<'_, Result<(), OutboundError>> {
        Box::pin(async move {
            let mut request = self.bot.send_photo(chat_id, InputFile::memory(image));
            if let Some(caption) = caption {
                request = request.caption(caption);
            }
            request.await.map_err(OutboundError::from_request)?;
            Ok(())
        })
    }
}

/// Front of an [`Outbound`] that logs and swallows timeouts.
#[derive(Clone)]
pub struct Sender {
    outbound: Arc<dyn Outbound>,
}

impl Sender {
    pub fn new(outbound: Arc<dyn Outbound>) -> Self {
        Self { outbound }
    }

    fn swallow_timeout(chat_id: ChatId, result: Result<(), OutboundError>) -> Result<(), OutboundError> {
        match result {
            Err(OutboundError::Timeout) => {
                log::warn!("Couldn't send message to {chat_id}: timed out");
                Ok(())
            }
            other => other,
        }
    }

    pub async fn text(
        &self,
        chat_id: ChatId,
        text: String,
        reply_to: Option<MessageId>,
    ) -> Result<(), OutboundError> {
        let result = self.outbound.send_text(chat_id, text, reply_to).await;
        Self::swallow_timeout(chat_id, result)
    }

    pub async fn photo(
        &self,
        chat_id: ChatId,
        image: Vec<u8>,
        caption: Option<String>,
    ) -> Result<(), OutboundError> {
        let result = self.outbound.send_photo(chat_id, image, caption).await;
        Self::swallow_timeout(chat_id, result)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Mutex;

    use super::*;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Sent {
        Text {
            chat_id: ChatId,
            text: String,
            reply_to: Option<MessageId>,
        },
        Photo {
            chat_id: ChatId,
            image: Vec<u8>,
            caption: Option<String>,
        },
    }

    /// Records everything sent. Fails every send while `failing` is set.
    #[derive(Default)]
    pub struct FakeOutbound {
        pub sent: Mutex<Vec<Sent>>,
        pub failing: Mutex<Option<fn() -> OutboundError>>,
    }

    impl FakeOutbound {
        pub fn sent(&self) -> Vec<Sent> {
            self.sent.lock().unwrap().clone()
        }

        fn record(&self, sent: Sent) -> BoxFuture<'_, Result<(), OutboundError>> {
            let result = match *self.failing.lock().unwrap() {
                Some(error) => Err(error()),
                None => {
                    self.sent.lock().unwrap().push(sent);
                    Ok(())
                }
            };
            Box::pin(async move { result })
        }
    }

    impl Outbound for FakeOutbound {
        fn send_text(
            &self,
            chat_id: ChatId,
            text: String,
            reply_to: Option<MessageId>,
        ) -> BoxFuture<'_, Result<(), OutboundError>> {
            self.record(Sent::Text {
                chat_id,
                text,
                reply_to,
            })
        }

        fn send_photo(
            &self,
            chat_id: ChatId,
            image: Vec<u8>,
            caption: Option<String>,
        ) -> BoxFuture<'_, Result<(), OutboundError>> {
            self.record(Sent::Photo {
                chat_id,
                image,
                caption,
            })
        }
    }

    fn api_error() -> OutboundError {
        OutboundError::Request(RequestError::Io(std::io::Error::other("boom").into()))
    }

    #[tokio::test]
    async fn timeouts_are_swallowed() {
        let outbound = Arc::new(FakeOutbound::default());
        *outbound.failing.lock().unwrap() = Some(|| OutboundError::Timeout);
        let sender = Sender::new(outbound.clone());

        assert!(sender.text(ChatId(1), "hi".to_owned(), None).await.is_ok());
        assert!(sender.photo(ChatId(1), vec![1], None).await.is_ok());
        assert!(outbound.sent().is_empty());
    }

    #[tokio::test]
    async fn other_errors_are_passed_on() {
        let outbound = Arc::new(FakeOutbound::default());
        *outbound.failing.lock().unwrap() = Some(api_error);
        let sender = Sender::new(outbound.clone());

        let result = sender.text(ChatId(1), "hi".to_owned(), None).await;
        assert!(matches!(result, Err(OutboundError::Request(_))));
    }

    #[test]
    fn io_errors_are_not_timeouts() {
        let e = RequestError::Io(std::io::Error::other("boom").into());
        assert!(matches!(OutboundError::from_request(e), OutboundError::Request(_)));
    }
}
