use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use teloxide::types::{ChatId, MessageEntityKind, MessageId, Update, UpdateKind, UserId};

/// Inbound occurrence from the transport. Never mutated after construction.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub id: u32,
    pub received_at: DateTime<Utc>,
    pub message: Option<MessagePayload>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MessagePayload {
    pub id: MessageId,
    pub chat: ChatInfo,
    pub sender: Option<UserId>,
    pub text: Option<String>,
    pub reply_to_sender: Option<UserId>,
    pub entities: Vec<Entity>,
    pub migrated_to: Option<ChatId>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChatInfo {
    pub id: ChatId,
    pub kind: ChatKind,
    pub name: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatKind {
    Private,
    Group,
    Supergroup,
    Channel,
}

impl ChatKind {
    pub fn is_multi_party(self) -> bool {
        matches!(self, ChatKind::Group | ChatKind::Supergroup)
    }
}

/// Marked substring of a message. Offsets are UTF-16 code units, like Telegram reports them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Entity {
    pub kind: EntityKind,
    pub offset: usize,
    pub length: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    BotCommand,
    Hashtag,
    Mention,
    Other,
}

impl From<&MessageEntityKind> for EntityKind {
    fn from(kind: &MessageEntityKind) -> Self {
        match kind {
            MessageEntityKind::BotCommand => EntityKind::BotCommand,
            MessageEntityKind::Hashtag => EntityKind::Hashtag,
            MessageEntityKind::Mention => EntityKind::Mention,
            _ => EntityKind::Other,
        }
    }
}

impl MessagePayload {
    fn from_message(msg: &teloxide::types::Message) -> Self {
        let chat = &msg.chat;
        let kind = if chat.is_private() {
            ChatKind::Private
        } else if chat.is_group() {
            ChatKind::Group
        } else if chat.is_supergroup() {
            ChatKind::Supergroup
        } else {
            ChatKind::Channel
        };

        let entities = msg
            .entities()
            .unwrap_or_default()
            .iter()
            .map(|e| Entity {
                kind: EntityKind::from(&e.kind),
                offset: e.offset,
                length: e.length,
            })
            .collect();

        Self {
            id: msg.id,
            chat: ChatInfo {
                id: chat.id,
                kind,
                name: chat.username().or(chat.title()).map(str::to_owned),
            },
            sender: msg.from.as_ref().map(|u| u.id),
            text: msg.text().map(str::to_owned),
            reply_to_sender: msg
                .reply_to_message()
                .and_then(|r| r.from.as_ref())
                .map(|u| u.id),
            entities,
            migrated_to: msg.migrate_to_chat_id().copied(),
        }
    }
}

impl Event {
    pub fn from_update(update: Update) -> Self {
        let message = match &update.kind {
            UpdateKind::Message(msg) => Some(MessagePayload::from_message(msg)),
            _ => None,
        };

        Self {
            id: update.id.0,
            received_at: Utc::now(),
            message,
        }
    }

    pub fn chat_id(&self) -> Option<ChatId> {
        self.message.as_ref().map(|m| m.chat.id)
    }

    /// Text of the message, if this event carries a text message.
    pub fn text(&self) -> Option<&str> {
        self.message.as_ref()?.text.as_deref()
    }

    /// Recognizes `/name`, `/name@bot` and `/name@bot argument`.
    ///
    /// Returns `Some(argument)` when the event is the command, where the
    /// argument is the trimmed rest of the text after the first whitespace.
    pub fn command(&self, name: &str) -> Option<Option<&str>> {
        let message = self.message.as_ref()?;
        let text = message.text.as_deref()?;
        let first = message.entities.first()?;

        if first.offset != 0 || first.kind != EntityKind::BotCommand {
            return None;
        }

        let token = utf16_slice(text, 1, first.length.checked_sub(1)?)?;
        let token = token.split('@').next().unwrap_or_default();
        if token.to_lowercase() != name.to_lowercase() {
            return None;
        }

        let argument = text
            .split_once(char::is_whitespace)
            .map(|(_, rest)| rest.trim())
            .filter(|rest| !rest.is_empty());

        Some(argument)
    }
}

/// Slice `text` by a range given in UTF-16 code units.
fn utf16_slice(text: &str, offset: usize, length: usize) -> Option<&str> {
    let mut units = 0;
    let mut start = None;
    let mut end = None;

    for (byte, c) in text.char_indices() {
        if units == offset {
            start = Some(byte);
        }
        if units == offset + length {
            end = Some(byte);
            break;
        }
        units += c.len_utf16();
    }

    if units == offset && start.is_none() {
        start = Some(text.len());
    }
    if units == offset + length && end.is_none() {
        end = Some(text.len());
    }

    text.get(start?..end?)
}

lazy_static! {
    static ref HASHTAG_REGEX: Regex = Regex::new(r"(?:^|[^A-Za-z0-9_])(#([A-Za-z0-9_]+))").unwrap();
}

/// A hashtag directly followed by `;` and another character is an
/// encoded entity (`&#8212;x`), not a tag.
fn is_guarded(rest: &str) -> bool {
    let mut chars = rest.chars();
    chars.next() == Some(';') && matches!(chars.next(), Some(c) if c != '\n')
}

fn hashtags(text: &str) -> impl Iterator<Item = (usize, &str)> {
    HASHTAG_REGEX.captures_iter(text).filter_map(move |caps| {
        let hashtag = caps.get(1)?;
        if is_guarded(&text[hashtag.end()..]) {
            return None;
        }
        Some((hashtag.start(), caps.get(2)?.as_str()))
    })
}

/// First hashtag anywhere in the text, without the `#`.
pub fn extract_hashtag(text: &str) -> Option<&str> {
    hashtags(text).next().map(|(_, tag)| tag)
}

/// Hashtag the text starts with, without the `#`.
pub fn leading_hashtag(text: &str) -> Option<&str> {
    match hashtags(text).next() {
        Some((0, tag)) => Some(tag),
        _ => None,
    }
}
