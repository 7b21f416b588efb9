use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::archivist::ids::{AccountId, ChatMessageId, ChatRoomId, PostId};

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum ChatRoomType {
    #[default]
    OneToOne,
    Group,
}

impl fmt::Display for ChatRoomType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChatRoomType::OneToOne => write!(f, "ONE_TO_ONE"),
            ChatRoomType::Group => write!(f, "GROUP_DM"),
        }
    }
}

impl FromStr for ChatRoomType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ONE_TO_ONE" => Ok(ChatRoomType::OneToOne),
            "GROUP_DM" => Ok(ChatRoomType::Group),
            _ => Err(format!("Invalid chat room type: {s}")),
        }
    }
}

/// Per-participant read state and moderation flags.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Default)]
pub struct ChatParticipant {
    pub account_id: AccountId,
    pub last_read_event_id: i64,
    /// The flags below are only meaningful when this is set.
    pub is_chat_settings_valid: bool,
    pub is_notifications_disabled: bool,
    pub is_mention_notifications_disabled: bool,
    pub is_read_only: bool,
    pub is_trusted: bool,
    pub is_muted: bool,
    pub status: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Default)]
pub struct ChatRoom {
    pub id: ChatRoomId,
    pub room_type: ChatRoomType,
    pub created_at: Option<DateTime<Utc>>,
    pub created_by_id: Option<AccountId>,
    pub is_nsfw: bool,
    pub name: String,
    pub avatar_image_remote_url: String,
    pub avatar_image_local_path: String,
    /// Drives the ordering of the room list.
    pub last_messaged_at: Option<DateTime<Utc>>,
    pub participants: HashMap<AccountId, ChatParticipant>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ChatReaction {
    pub id: i64,
    pub message_id: ChatMessageId,
    pub sender_id: AccountId,
    pub sent_at: DateTime<Utc>,
    pub emoji: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Default)]
pub struct ChatAttachment {
    pub id: i64,
    pub is_video: bool,
    pub width: i64,
    pub height: i64,
    pub remote_url: String,
    pub local_filename: String,
    pub thumbnail_remote_url: String,
    pub thumbnail_local_filename: String,
    pub is_downloaded: bool,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ChatMessage {
    pub id: ChatMessageId,
    pub chat_room_id: ChatRoomId,
    pub sender_id: AccountId,
    pub sent_at: DateTime<Utc>,
    pub request_id: String,
    pub text: String,
    pub in_reply_to_id: Option<ChatMessageId>,
    pub embedded_post_id: Option<PostId>,
    /// One reaction per reacting account.
    pub reactions: HashMap<AccountId, ChatReaction>,
    pub attachments: Vec<ChatAttachment>,
}

impl ChatMessage {
    pub fn new(
        id: ChatMessageId,
        chat_room_id: ChatRoomId,
        sender_id: AccountId,
        sent_at: DateTime<Utc>,
        text: impl Into<String>,
    ) -> Self {
        ChatMessage {
            id,
            chat_room_id,
            sender_id,
            sent_at,
            request_id: String::new(),
            text: text.into(),
            in_reply_to_id: None,
            embedded_post_id: None,
            reactions: HashMap::new(),
            attachments: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_room_type_codes() {
        assert_eq!(ChatRoomType::Group.to_string(), "GROUP_DM");
        assert_eq!("ONE_TO_ONE".parse(), Ok(ChatRoomType::OneToOne));
        assert!("TRIO".parse::<ChatRoomType>().is_err());
    }
}
