//! Fans the inbound event stream out to independent pipelines, one per behavior.

use std::future::{self, Future};
use std::sync::Arc;

use futures::{Stream, StreamExt};
use lazy_static::lazy_static;
use regex::{Regex, RegexBuilder};
use teloxide::types::UserId;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::config::Config;
use crate::debounce::debounce_by_key;
use crate::event::{extract_hashtag, leading_hashtag, Event};
use crate::handlers::{AutopicRequest, HandlerError, Handlers};
use crate::registry::ChatRegistry;
use crate::throttle::skip_some;

const COMMENT_ATTEMPTS: u32 = 3;

lazy_static! {
    // the keyword counts on any line of a multi-line message
    static ref JOKE_REGEX: Regex = RegexBuilder::new("анекдот")
        .case_insensitive(true)
        .build()
        .unwrap();
    static ref GREETING_REGEX: Regex = RegexBuilder::new("^о привет$")
        .case_insensitive(true)
        .build()
        .unwrap();
}

/// Decides whether a message is meant for the bot.
pub struct Addressing {
    name: Regex,
    bot_id: UserId,
}

impl Addressing {
    pub fn new(name: &str, bot_id: UserId) -> Result<Self, regex::Error> {
        let name = RegexBuilder::new(&regex::escape(name))
            .case_insensitive(true)
            .build()?;
        Ok(Self { name, bot_id })
    }

    pub fn is_addressed(&self, event: &Event) -> bool {
        let Some(message) = &event.message else {
            return false;
        };
        let mentioned = message
            .text
            .as_deref()
            .is_some_and(|text| self.name.is_match(text));
        mentioned || message.reply_to_sender == Some(self.bot_id)
    }
}

/// Owns the inbound stream and hands every event to each subscriber in
/// ingestion order. Each subscriber gets its own queue, so a slow one never
/// holds up the others.
#[derive(Default)]
pub struct Router {
    outlets: Vec<mpsc::UnboundedSender<Arc<Event>>>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self) -> UnboundedReceiverStream<Arc<Event>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.outlets.push(tx);
        UnboundedReceiverStream::new(rx)
    }

    fn messages(&mut self) -> impl Stream<Item = Arc<Event>> {
        self.subscribe()
            .filter(|event| future::ready(event.text().is_some()))
    }

    fn command(
        &mut self,
        name: &'static str,
    ) -> impl Stream<Item = (Arc<Event>, Option<String>)> {
        self.subscribe().filter_map(move |event| {
            let argument = event
                .command(name)
                .map(|argument| argument.map(str::to_owned));
            future::ready(argument.map(|argument| (event, argument)))
        })
    }

    pub async fn run(mut self, mut inbound: mpsc::UnboundedReceiver<Event>) {
        while let Some(event) = inbound.recv().await {
            log::debug!(
                "Routing event {} from {:?} received at {}",
                event.id,
                event.message.as_ref().and_then(|m| m.sender),
                event.received_at
            );
            let event = Arc::new(event);
            self.outlets.retain(|outlet| {
                let delivered = outlet.send(event.clone()).is_ok();
                if !delivered {
                    log::warn!("A pipeline has stopped, no longer routing to it");
                }
                delivered
            });
        }
        log::info!("Inbound stream closed, router shut down.");
    }
}

/// Runs `handler` as its own task for every item of `stream`, trying up to
/// `attempts` times. Failures are logged and never end the pipeline.
fn spawn_pipeline<T, S, F, Fut>(
    name: &'static str,
    stream: S,
    attempts: u32,
    handler: F,
) -> JoinHandle<()>
where
    T: Clone + Send + 'static,
    S: Stream<Item = T> + Send + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    let handler = Arc::new(handler);
    tokio::spawn(async move {
        log::info!("Starting pipeline {name}");
        stream
            .for_each(|item| {
                let handler = handler.clone();
                tokio::spawn(async move {
                    for attempt in 1..=attempts {
                        match handler(item.clone()).await {
                            Ok(()) => return,
                            Err(e) => {
                                log::error!("{name}: handler failed ({attempt}/{attempts}): {e}")
                            }
                        }
                    }
                });
                future::ready(())
            })
            .await;
        log::info!("Pipeline {name} shut down.");
    })
}

/// Derives every behavior's stream from `router` and binds its handler.
pub fn wire(
    router: &mut Router,
    handlers: &Handlers,
    registry: &ChatRegistry,
    addressing: Addressing,
    config: &Config,
) -> Vec<JoinHandle<()>> {
    let mut pipelines = Vec::new();

    let registry = registry.clone();
    pipelines.push(tokio::spawn(router.subscribe().for_each(move |event| {
        match event.message.as_ref().and_then(|m| m.migrated_to.map(|to| (m.chat.id, to))) {
            Some((from, to)) => {
                log::info!("Chat {from} migrated to {to}");
                registry.remove(from);
            }
            None => registry.observe(&event),
        }
        future::ready(())
    })));

    let chatter = skip_some(router.messages(), config.chatter, |event| event.chat_id());
    let h = handlers.clone();
    pipelines.push(spawn_pipeline("random chatter", chatter, 1, move |event| {
        let h = h.clone();
        async move { h.reply_with_comment(&event).await }
    }));

    let addressed = router
        .messages()
        .filter(move |event| future::ready(addressing.is_addressed(event)));
    let h = handlers.clone();
    pipelines.push(spawn_pipeline("direct address", addressed, 1, move |event| {
        let h = h.clone();
        async move { h.reply_with_comment(&event).await }
    }));

    let hashtags = router.messages().filter_map(|event| {
        let tag = event
            .text()
            .filter(|text| leading_hashtag(text).is_some())
            .and_then(extract_hashtag)
            .map(str::to_lowercase);
        future::ready(tag.map(|tag| (event, tag)))
    });
    let h = handlers.clone();
    pipelines.push(spawn_pipeline("hashtag picture", hashtags, 1, move |(event, tag)| {
        let h = h.clone();
        async move {
            let Some(message) = &event.message else {
                return Ok(());
            };
            h.send_tagged(message.chat.id, &tag, message.id, true).await
        }
    }));

    let jokes = router
        .messages()
        .filter(|event| future::ready(event.text().is_some_and(|t| JOKE_REGEX.is_match(t))));
    let h = handlers.clone();
    pipelines.push(spawn_pipeline("joke", jokes, 1, move |event| {
        let h = h.clone();
        async move { h.send_joke(&event).await }
    }));

    let greetings = router
        .messages()
        .filter(|event| future::ready(event.text().is_some_and(|t| GREETING_REGEX.is_match(t))));
    let greetings = debounce_by_key(greetings, config.greeting_quiet, |event| event.chat_id());
    let h = handlers.clone();
    pipelines.push(spawn_pipeline("greeting", greetings, 1, move |event| {
        let h = h.clone();
        async move {
            match event.chat_id() {
                Some(chat_id) => h.greet(chat_id).await,
                None => Ok(()),
            }
        }
    }));

    let h = handlers.clone();
    pipelines.push(spawn_pipeline("/picture", router.command("picture"), 1, move |(event, query)| {
        let h = h.clone();
        async move { h.send_picture(&event, query.as_deref()).await }
    }));

    let h = handlers.clone();
    pipelines.push(spawn_pipeline(
        "/comment",
        router.command("comment"),
        COMMENT_ATTEMPTS,
        move |(event, _)| {
            let h = h.clone();
            async move {
                match event.chat_id() {
                    Some(chat_id) => h.send_comment(chat_id).await,
                    None => Ok(()),
                }
            }
        },
    ));

    let h = handlers.clone();
    pipelines.push(spawn_pipeline("/start", router.command("start"), 1, move |(event, _)| {
        let h = h.clone();
        async move {
            match event.chat_id() {
                Some(chat_id) => h.start(chat_id).await,
                None => Ok(()),
            }
        }
    }));

    let h = handlers.clone();
    pipelines.push(spawn_pipeline("/autopic", router.command("autopic"), 1, move |(event, argument)| {
        let h = h.clone();
        async move {
            let request = AutopicRequest::parse(argument.as_deref());
            h.configure_autopic(&event, request).await
        }
    }));

    pipelines
}
