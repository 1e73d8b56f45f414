use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use teloxide::types::ChatId;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;

use crate::event::Event;

pub const PRIVILEGED_PICTURE_PERIOD: Duration = Duration::from_secs(3600);

/// Immutable view of all known chats. Replaced as a whole on every change.
pub type Snapshot = Arc<HashMap<ChatId, Chat>>;

#[derive(Clone, Debug)]
pub struct Chat {
    pub id: ChatId,
    pub name: Option<String>,
    picture_period: Option<Duration>,
    subscriptions: Subscriptions,
}

impl Chat {
    fn new(id: ChatId, name: Option<String>, picture_period: Option<Duration>) -> Self {
        Self {
            id,
            name,
            picture_period,
            subscriptions: Subscriptions::default(),
        }
    }

    /// Interval of the background pictures, `None` meaning off.
    pub fn picture_period(&self) -> Option<Duration> {
        self.picture_period
    }

    pub fn subscriptions(&self) -> &Subscriptions {
        &self.subscriptions
    }
}

/// Background work owned by one chat, cancelled together when the chat goes away.
#[derive(Clone, Debug, Default)]
pub struct Subscriptions(Arc<SubscriptionsInner>);

#[derive(Debug, Default)]
struct SubscriptionsInner {
    active: AtomicBool,
    token: CancellationToken,
}

impl Subscriptions {
    pub fn is_empty(&self) -> bool {
        !self.0.active.load(Ordering::Acquire)
    }

    /// Marks the set as used. Only the first caller gets a token.
    pub fn activate(&self) -> Option<CancellationToken> {
        self.0
            .active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| self.0.token.child_token())
    }

    pub fn cancel(&self) {
        self.0.token.cancel()
    }
}

enum Command {
    Observe {
        id: ChatId,
        name: Option<String>,
    },
    SetPicturePeriod {
        id: ChatId,
        period: Option<Duration>,
        reply: oneshot::Sender<bool>,
    },
    Lookup {
        id: ChatId,
        reply: oneshot::Sender<Option<Chat>>,
    },
    Remove(ChatId),
}

/// Handle to the chat registry. Every mutation is queued to a single
/// worker task that owns the publishing side.
#[derive(Clone)]
pub struct ChatRegistry {
    snapshot: watch::Receiver<Snapshot>,
    commands: mpsc::UnboundedSender<Command>,
}

struct RegistryWorker {
    snapshot: watch::Sender<Snapshot>,
    commands: mpsc::UnboundedReceiver<Command>,
    privileged_name: String,
}

impl RegistryWorker {
    fn publish(&self, update: impl FnOnce(&mut HashMap<ChatId, Chat>)) {
        let mut chats = HashMap::clone(&self.snapshot.borrow());
        update(&mut chats);
        self.snapshot.send_replace(Arc::new(chats));
    }

    fn handle_observe(&self, id: ChatId, name: Option<String>) {
        if self.snapshot.borrow().contains_key(&id) {
            return;
        }

        let period = (name.as_deref() == Some(self.privileged_name.as_str()))
            .then_some(PRIVILEGED_PICTURE_PERIOD);

        log::info!("New chat {id} ({})", name.as_deref().unwrap_or("unnamed"));
        self.add_or_update(Chat::new(id, name, period));
    }

    fn add_or_update(&self, chat: Chat) {
        self.publish(|chats| {
            chats.insert(chat.id, chat);
        });
    }

    fn handle_set_picture_period(&self, id: ChatId, period: Option<Duration>) -> bool {
        let Some(chat) = self.snapshot.borrow().get(&id).cloned() else {
            log::warn!("Cannot set picture period of unknown chat {id}");
            return false;
        };

        log::info!("Picture period of chat {id} set to {period:?}");
        self.add_or_update(Chat {
            picture_period: period,
            ..chat
        });
        true
    }

    fn handle_remove(&self, id: ChatId) {
        let Some(chat) = self.snapshot.borrow().get(&id).cloned() else {
            return;
        };

        log::info!("Removing chat {id}");
        chat.subscriptions.cancel();
        self.publish(|chats| {
            chats.remove(&id);
        });
    }

    async fn run(mut self) {
        while let Some(command) = self.commands.recv().await {
            match command {
                Command::Observe { id, name } => self.handle_observe(id, name),
                Command::SetPicturePeriod { id, period, reply } => {
                    let _ = reply.send(self.handle_set_picture_period(id, period));
                }
                Command::Lookup { id, reply } => {
                    let _ = reply.send(self.snapshot.borrow().get(&id).cloned());
                }
                Command::Remove(id) => self.handle_remove(id),
            }
        }
        log::debug!("Chat registry worker shut down.");
    }
}

impl ChatRegistry {
    /// Spawns the registry worker. Chats named `privileged_name` start with
    /// the background picture timer on.
    pub fn new(privileged_name: impl Into<String>) -> Self {
        let (snapshot_tx, snapshot) = watch::channel(Snapshot::default());
        let (commands, commands_rx) = mpsc::unbounded_channel();

        let worker = RegistryWorker {
            snapshot: snapshot_tx,
            commands: commands_rx,
            privileged_name: privileged_name.into(),
        };
        tokio::spawn(worker.run());

        Self { snapshot, commands }
    }

    pub fn snapshot(&self) -> Snapshot {
        self.snapshot.borrow().clone()
    }

    /// Receiver that starts out with the latest snapshot.
    pub fn subscribe(&self) -> watch::Receiver<Snapshot> {
        let mut receiver = self.snapshot.clone();
        receiver.mark_changed();
        receiver
    }

    fn send(&self, command: Command) {
        if self.commands.send(command).is_err() {
            log::error!("Chat registry worker is gone!")
        }
    }

    /// Registers the chat of `event` if it is a group chat not seen yet.
    pub fn observe(&self, event: &Event) {
        let Some(message) = &event.message else {
            return;
        };
        if !message.chat.kind.is_multi_party() {
            return;
        }
        // cheap pre-check, the worker checks again before inserting
        if self.snapshot.borrow().contains_key(&message.chat.id) {
            return;
        }

        self.send(Command::Observe {
            id: message.chat.id,
            name: message.chat.name.clone(),
        });
    }

    /// Returns false if the chat is not registered.
    pub async fn set_picture_period(&self, id: ChatId, period: Option<Duration>) -> bool {
        let (reply, rx) = oneshot::channel();
        self.send(Command::SetPicturePeriod { id, period, reply });
        rx.await.unwrap_or(false)
    }

    /// The chat as seen after every command queued before this call.
    pub async fn lookup(&self, id: ChatId) -> Option<Chat> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Lookup { id, reply });
        rx.await.ok().flatten()
    }

    pub fn remove(&self, id: ChatId) {
        self.send(Command::Remove(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::tests::message_event;
    use crate::event::ChatKind;

    async fn wait_for_chat(registry: &ChatRegistry, id: ChatId) -> Chat {
        let mut rx = registry.subscribe();
        let snapshot = rx.wait_for(|s| s.contains_key(&id)).await.unwrap().clone();
        snapshot[&id].clone()
    }

    #[tokio::test]
    async fn replaying_first_event_creates_one_chat() {
        let registry = ChatRegistry::new("svalo4ka");
        let event = message_event(1, -10, "hello");

        registry.observe(&event);
        registry.observe(&event);
        let chat = wait_for_chat(&registry, ChatId(-10)).await;

        // commands are handled in order, so this acts as a barrier
        assert!(registry.set_picture_period(ChatId(-10), None).await);
        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert!(Arc::ptr_eq(
            &snapshot[&ChatId(-10)].subscriptions.0,
            &chat.subscriptions.0
        ));
    }

    #[tokio::test]
    async fn private_chats_are_not_registered() {
        let registry = ChatRegistry::new("svalo4ka");
        let mut event = message_event(1, 10, "hi");
        if let Some(m) = event.message.as_mut() {
            m.chat.kind = ChatKind::Private;
        }

        registry.observe(&event);
        assert!(!registry.set_picture_period(ChatId(10), None).await);
        assert!(registry.snapshot().is_empty());
    }

    #[tokio::test]
    async fn privileged_chat_starts_with_hourly_pictures() {
        let registry = ChatRegistry::new("svalo4ka");
        let mut event = message_event(1, -20, "hi");
        if let Some(m) = event.message.as_mut() {
            m.chat.name = Some("svalo4ka".to_owned());
        }

        registry.observe(&event);
        registry.observe(&message_event(2, -21, "hi"));
        let privileged = wait_for_chat(&registry, ChatId(-20)).await;
        let other = wait_for_chat(&registry, ChatId(-21)).await;

        assert_eq!(privileged.picture_period(), Some(PRIVILEGED_PICTURE_PERIOD));
        assert_eq!(other.picture_period(), None);
    }

    #[tokio::test]
    async fn late_subscriber_sees_latest_snapshot() {
        let registry = ChatRegistry::new("svalo4ka");
        registry.observe(&message_event(1, -30, "hi"));
        wait_for_chat(&registry, ChatId(-30)).await;

        let mut late = registry.subscribe();
        assert!(late.has_changed().unwrap());
        assert!(late.borrow_and_update().contains_key(&ChatId(-30)));
    }

    #[tokio::test]
    async fn set_picture_period_publishes_new_snapshot() {
        let registry = ChatRegistry::new("svalo4ka");
        registry.observe(&message_event(1, -40, "hi"));
        wait_for_chat(&registry, ChatId(-40)).await;
        let before = registry.snapshot();

        assert!(
            registry
                .set_picture_period(ChatId(-40), Some(Duration::from_secs(60)))
                .await
        );
        let after = registry.snapshot();

        assert!(!Arc::ptr_eq(&before, &after));
        assert_eq!(after[&ChatId(-40)].picture_period(), Some(Duration::from_secs(60)));
        assert!(Arc::ptr_eq(
            &before[&ChatId(-40)].subscriptions.0,
            &after[&ChatId(-40)].subscriptions.0
        ));
    }

    #[tokio::test]
    async fn published_snapshot_never_changes() {
        let registry = ChatRegistry::new("svalo4ka");
        registry.observe(&message_event(1, -41, "hi"));
        let chat = wait_for_chat(&registry, ChatId(-41)).await;
        let before = registry.snapshot();

        registry
            .set_picture_period(ChatId(-41), Some(Duration::from_secs(60)))
            .await;
        registry.set_picture_period(ChatId(-41), None).await;
        registry
            .set_picture_period(ChatId(-41), Some(Duration::from_secs(90)))
            .await;

        assert_eq!(before[&ChatId(-41)].picture_period(), None);
        assert_eq!(chat.picture_period(), None);
        assert_eq!(
            registry.snapshot()[&ChatId(-41)].picture_period(),
            Some(Duration::from_secs(90))
        );
    }

    #[tokio::test]
    async fn lookup_waits_for_queued_commands() {
        let registry = ChatRegistry::new("svalo4ka");
        registry.observe(&message_event(1, -42, "hi"));

        let chat = registry.lookup(ChatId(-42)).await.unwrap();
        assert_eq!(chat.name.as_deref(), Some("chat-42"));
        assert!(registry.lookup(ChatId(-43)).await.is_none());
    }

    #[tokio::test]
    async fn remove_cancels_subscriptions() {
        let registry = ChatRegistry::new("svalo4ka");
        registry.observe(&message_event(1, -50, "hi"));
        let chat = wait_for_chat(&registry, ChatId(-50)).await;
        let token = chat.subscriptions().activate().unwrap();

        registry.remove(ChatId(-50));
        token.cancelled().await;
        assert!(!registry.set_picture_period(ChatId(-50), None).await);
        assert!(registry.snapshot().is_empty());
    }

    #[test]
    fn subscriptions_activate_once() {
        let subscriptions = Subscriptions::default();
        assert!(subscriptions.is_empty());
        assert!(subscriptions.activate().is_some());
        assert!(subscriptions.clone().activate().is_none());
        assert!(!subscriptions.is_empty());
    }
}
