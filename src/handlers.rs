use std::time::Duration;

use teloxide::types::{ChatId, MessageId};
use thiserror::Error;

use crate::content::{Content, Post, TaggedPost};
use crate::event::Event;
use crate::messages;
use crate::outbound::{OutboundError, Sender};
use crate::registry::ChatRegistry;

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("no {0} available")]
    NoContent(&'static str),
    #[error("event has no message")]
    NoMessage,
    #[error(transparent)]
    Outbound(#[from] OutboundError),
}

/// What `/autopic` was asked to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AutopicRequest {
    Status,
    Set(Option<Duration>),
    Invalid,
}

impl AutopicRequest {
    pub fn parse(argument: Option<&str>) -> Self {
        let Some(argument) = argument else {
            return AutopicRequest::Status;
        };
        if argument.eq_ignore_ascii_case("off") {
            return AutopicRequest::Set(None);
        }
        match argument.parse::<u64>() {
            Ok(0) => AutopicRequest::Set(None),
            Ok(minutes) => match minutes.checked_mul(60) {
                Some(secs) => AutopicRequest::Set(Some(Duration::from_secs(secs))),
                None => AutopicRequest::Invalid,
            },
            Err(_) => AutopicRequest::Invalid,
        }
    }
}

fn origin(event: &Event) -> Result<(ChatId, MessageId), HandlerError> {
    event
        .message
        .as_ref()
        .map(|m| (m.chat.id, m.id))
        .ok_or(HandlerError::NoMessage)
}

/// Side effects of all behaviors.
#[derive(Clone)]
pub struct Handlers {
    content: Content,
    sender: Sender,
    registry: ChatRegistry,
}

impl Handlers {
    pub fn new(content: Content, sender: Sender, registry: ChatRegistry) -> Self {
        Self {
            content,
            sender,
            registry,
        }
    }

    /// Answers a message with a random comment. Nothing is sent if no
    /// comment could be fetched.
    pub async fn reply_with_comment(&self, event: &Event) -> Result<(), HandlerError> {
        let (chat_id, message_id) = origin(event)?;
        let Some(comment) = self.content.comment().await else {
            log::debug!("No comment for {chat_id}, skipping reply");
            return Ok(());
        };
        self.sender.text(chat_id, comment, Some(message_id)).await?;
        Ok(())
    }

    pub async fn send_comment(&self, chat_id: ChatId) -> Result<(), HandlerError> {
        log::info!("send_comment, chat_id={chat_id}");
        let comment = self
            .content
            .comment()
            .await
            .ok_or(HandlerError::NoContent("comment"))?;
        self.sender.text(chat_id, comment, None).await?;
        Ok(())
    }

    pub async fn send_joke(&self, event: &Event) -> Result<(), HandlerError> {
        let (chat_id, message_id) = origin(event)?;
        log::info!("send_joke, chat_id={chat_id}, reply_to={message_id}");
        let joke = self
            .content
            .joke()
            .await
            .ok_or(HandlerError::NoContent("joke"))?;
        self.sender.text(chat_id, joke, Some(message_id)).await?;
        Ok(())
    }

    pub async fn send_random_picture(&self, chat_id: ChatId) -> Result<(), HandlerError> {
        log::info!("send_random_picture, chat_id={chat_id}");
        let image = self
            .content
            .picture()
            .await
            .ok_or(HandlerError::NoContent("picture"))?;
        self.sender.photo(chat_id, image, None).await?;
        Ok(())
    }

    /// Sends a post for `tag`. An unknown tag is reported to the chat unless
    /// `fail_silent` is set.
    pub async fn send_tagged(
        &self,
        chat_id: ChatId,
        tag: &str,
        reply_to: MessageId,
        fail_silent: bool,
    ) -> Result<(), HandlerError> {
        log::info!("send_tagged, chat_id={chat_id}, tag={tag}");
        let post = self
            .content
            .tagged_post(tag)
            .await
            .ok_or(HandlerError::NoContent("tagged post"))?;

        match post {
            TaggedPost::UnknownTag if fail_silent => {
                log::debug!("Unknown tag {tag}, staying silent");
            }
            TaggedPost::UnknownTag => {
                self.sender
                    .text(chat_id, messages::UNKNOWN_TAG.to_owned(), Some(reply_to))
                    .await?;
            }
            TaggedPost::Found(Post::Photo { image, caption }) => {
                self.sender.photo(chat_id, image, Some(caption)).await?;
            }
            TaggedPost::Found(Post::Text(text)) => {
                self.sender.text(chat_id, text, None).await?;
            }
        }
        Ok(())
    }

    /// `/picture [query]`: a post for the query, or a random picture.
    pub async fn send_picture(&self, event: &Event, query: Option<&str>) -> Result<(), HandlerError> {
        let (chat_id, message_id) = origin(event)?;
        match query {
            Some(query) => self.send_tagged(chat_id, &query.to_lowercase(), message_id, false).await,
            None => self.send_random_picture(chat_id).await,
        }
    }

    pub async fn greet(&self, chat_id: ChatId) -> Result<(), HandlerError> {
        self.sender
            .text(chat_id, messages::GREETING.to_owned(), None)
            .await?;
        Ok(())
    }

    pub async fn start(&self, chat_id: ChatId) -> Result<(), HandlerError> {
        self.sender.text(chat_id, messages::START.to_owned(), None).await?;
        Ok(())
    }

    /// `/autopic [minutes|off]`, also valid as the first message of a group.
    pub async fn configure_autopic(
        &self,
        event: &Event,
        request: AutopicRequest,
    ) -> Result<(), HandlerError> {
        let (chat_id, message_id) = origin(event)?;
        // registry commands run in order, the chat exists before the update
        self.registry.observe(event);

        let reply = match request {
            AutopicRequest::Invalid => messages::autopic_usage(),
            AutopicRequest::Status => match self.registry.lookup(chat_id).await {
                Some(chat) => messages::autopic_status(chat.picture_period()),
                None => messages::autopic_unknown_chat(),
            },
            AutopicRequest::Set(period) => {
                if self.registry.set_picture_period(chat_id, period).await {
                    messages::autopic_status(period)
                } else {
                    messages::autopic_unknown_chat()
                }
            }
        };

        self.sender.text(chat_id, reply, Some(message_id)).await?;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::content::tests::FakeProvider;
    use crate::event::tests::message_event;
    use crate::outbound::tests::{FakeOutbound, Sent};

    pub fn handlers_with(
        provider: Arc<FakeProvider>,
        outbound: Arc<FakeOutbound>,
        registry: ChatRegistry,
    ) -> Handlers {
        Handlers::new(
            Content::new(provider, 3),
            Sender::new(outbound),
            registry,
        )
    }

    fn setup() -> (Handlers, Arc<FakeOutbound>, ChatRegistry) {
        let outbound = Arc::new(FakeOutbound::default());
        let registry = ChatRegistry::new("svalo4ka");
        let handlers = handlers_with(
            Arc::new(FakeProvider::default()),
            outbound.clone(),
            registry.clone(),
        );
        (handlers, outbound, registry)
    }

    #[test]
    fn autopic_arguments() {
        assert_eq!(AutopicRequest::parse(None), AutopicRequest::Status);
        assert_eq!(AutopicRequest::parse(Some("OFF")), AutopicRequest::Set(None));
        assert_eq!(AutopicRequest::parse(Some("0")), AutopicRequest::Set(None));
        assert_eq!(
            AutopicRequest::parse(Some("15")),
            AutopicRequest::Set(Some(Duration::from_secs(900)))
        );
        assert_eq!(AutopicRequest::parse(Some("soon")), AutopicRequest::Invalid);
    }

    #[tokio::test]
    async fn comment_reply_quotes_the_message() {
        let (handlers, outbound, _) = setup();
        let event = message_event(9, -1, "ковробот, привет");

        handlers.reply_with_comment(&event).await.unwrap();
        assert_eq!(
            outbound.sent(),
            vec![Sent::Text {
                chat_id: ChatId(-1),
                text: "comment".to_owned(),
                reply_to: Some(MessageId(9)),
            }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn missing_comment_fails_explicit_request_only() {
        let outbound = Arc::new(FakeOutbound::default());
        let handlers = handlers_with(
            Arc::new(FakeProvider::failing(100)),
            outbound.clone(),
            ChatRegistry::new("svalo4ka"),
        );

        assert!(handlers
            .reply_with_comment(&message_event(1, -1, "hi"))
            .await
            .is_ok());
        assert!(matches!(
            handlers.send_comment(ChatId(-1)).await,
            Err(HandlerError::NoContent("comment"))
        ));
        assert!(outbound.sent().is_empty());
    }

    #[tokio::test]
    async fn unknown_tag_is_reported_unless_silent() {
        let (handlers, outbound, _) = setup();

        handlers
            .send_tagged(ChatId(-1), "boats", MessageId(3), true)
            .await
            .unwrap();
        assert!(outbound.sent().is_empty());

        handlers
            .send_tagged(ChatId(-1), "boats", MessageId(3), false)
            .await
            .unwrap();
        assert_eq!(
            outbound.sent(),
            vec![Sent::Text {
                chat_id: ChatId(-1),
                text: messages::UNKNOWN_TAG.to_owned(),
                reply_to: Some(MessageId(3)),
            }]
        );
    }

    #[tokio::test]
    async fn picture_command_uses_lowercased_query() {
        let (handlers, outbound, _) = setup();
        let event = message_event(4, -1, "/picture CATS");

        handlers.send_picture(&event, Some("CATS")).await.unwrap();
        handlers.send_picture(&event, None).await.unwrap();
        assert_eq!(
            outbound.sent(),
            vec![
                Sent::Photo {
                    chat_id: ChatId(-1),
                    image: vec![4, 5],
                    caption: Some("cats".to_owned()),
                },
                Sent::Photo {
                    chat_id: ChatId(-1),
                    image: vec![1, 2, 3],
                    caption: None,
                },
            ]
        );
    }

    #[tokio::test]
    async fn autopic_updates_registered_chat() {
        let (handlers, outbound, registry) = setup();
        let event = message_event(5, -7, "/autopic 30");
        registry.observe(&event);
        registry
            .subscribe()
            .wait_for(|s| s.contains_key(&ChatId(-7)))
            .await
            .unwrap();

        handlers
            .configure_autopic(&event, AutopicRequest::Set(Some(Duration::from_secs(1800))))
            .await
            .unwrap();

        assert_eq!(
            registry.snapshot()[&ChatId(-7)].picture_period(),
            Some(Duration::from_secs(1800))
        );
        assert_eq!(
            outbound.sent(),
            vec![Sent::Text {
                chat_id: ChatId(-7),
                text: messages::autopic_status(Some(Duration::from_secs(1800))),
                reply_to: Some(MessageId(5)),
            }]
        );
    }

    #[tokio::test]
    async fn autopic_as_first_group_message_registers_the_chat() {
        let (handlers, outbound, registry) = setup();
        let set = message_event(7, -9, "/autopic 10");
        let status = message_event(8, -10, "/autopic");

        handlers
            .configure_autopic(&set, AutopicRequest::Set(Some(Duration::from_secs(600))))
            .await
            .unwrap();
        handlers
            .configure_autopic(&status, AutopicRequest::Status)
            .await
            .unwrap();

        assert_eq!(
            registry.snapshot()[&ChatId(-9)].picture_period(),
            Some(Duration::from_secs(600))
        );
        assert_eq!(
            outbound.sent(),
            vec![
                Sent::Text {
                    chat_id: ChatId(-9),
                    text: messages::autopic_status(Some(Duration::from_secs(600))),
                    reply_to: Some(MessageId(7)),
                },
                Sent::Text {
                    chat_id: ChatId(-10),
                    text: messages::autopic_status(None),
                    reply_to: Some(MessageId(8)),
                },
            ]
        );
    }

    #[tokio::test]
    async fn autopic_in_private_chat_is_refused() {
        let (handlers, outbound, _) = setup();
        let mut event = message_event(6, 8, "/autopic off");
        if let Some(m) = event.message.as_mut() {
            m.chat.kind = crate::event::ChatKind::Private;
        }

        handlers
            .configure_autopic(&event, AutopicRequest::Set(None))
            .await
            .unwrap();
        assert_eq!(
            outbound.sent(),
            vec![Sent::Text {
                chat_id: ChatId(8),
                text: messages::autopic_unknown_chat(),
                reply_to: Some(MessageId(6)),
            }]
        );
    }
}
