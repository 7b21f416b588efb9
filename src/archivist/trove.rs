//! The batch aggregate a harvest produces.
//!
//! A [`Trove`] groups every entity of one harvest by identifier. It only lives between the
//! harvest and [`Archivist::merge`](crate::Archivist::merge); it is never stored as a unit.

use std::collections::HashMap;

use crate::archivist::{
    accounts::Account,
    audio_rooms::AudioRoom,
    chats::{ChatMessage, ChatRoom},
    ids::{AccountId, AudioRoomId, ChatMessageId, ChatRoomId, NotificationId, PostId, RepostId},
    likes::{Bookmark, Like},
    lists::List,
    notifications::Notification,
    posts::Post,
    reposts::Repost,
};

#[derive(Clone, Debug, Default)]
pub struct Trove {
    pub accounts: HashMap<AccountId, Account>,
    pub posts: HashMap<PostId, Post>,
    pub reposts: HashMap<RepostId, Repost>,
    pub audio_rooms: HashMap<AudioRoomId, AudioRoom>,
    /// Keyed by (liker, post).
    pub likes: HashMap<(AccountId, PostId), Like>,
    /// Keyed by (account, post).
    pub bookmarks: HashMap<(AccountId, PostId), Bookmark>,
    pub notifications: HashMap<NotificationId, Notification>,
    pub chat_rooms: HashMap<ChatRoomId, ChatRoom>,
    pub chat_messages: HashMap<ChatMessageId, ChatMessage>,
    /// Online lists, keyed by their remote list ID.
    pub lists: HashMap<i64, List>,
}

impl Trove {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
            && self.posts.is_empty()
            && self.reposts.is_empty()
            && self.audio_rooms.is_empty()
            && self.likes.is_empty()
            && self.bookmarks.is_empty()
            && self.notifications.is_empty()
            && self.chat_rooms.is_empty()
            && self.chat_messages.is_empty()
            && self.lists.is_empty()
    }

    /// Adds `account` under its ID. An account without an ID yet, such as a
    /// [`Account::placeholder`], gets a provisional one unless its handle is already present.
    pub fn add_account(&mut self, mut account: Account) {
        if account.id.is_unknown() {
            if self.find_account_by_handle(&account.handle).is_some() {
                return;
            }
            account.id = self.next_provisional_id();
            account.is_needing_fake_id = true;
        }
        self.accounts.insert(account.id, account);
    }

    pub fn add_post(&mut self, post: Post) {
        self.posts.insert(post.id, post);
    }

    pub fn add_repost(&mut self, repost: Repost) {
        self.reposts.insert(repost.id, repost);
    }

    pub fn add_audio_room(&mut self, room: AudioRoom) {
        self.audio_rooms.insert(room.id.clone(), room);
    }

    pub fn add_like(&mut self, like: Like) {
        self.likes.insert((like.liker_id, like.post_id), like);
    }

    pub fn add_bookmark(&mut self, bookmark: Bookmark) {
        self.bookmarks
            .insert((bookmark.account_id, bookmark.post_id), bookmark);
    }

    pub fn add_notification(&mut self, notification: Notification) {
        self.notifications.insert(notification.id, notification);
    }

    pub fn add_chat_room(&mut self, room: ChatRoom) {
        self.chat_rooms.insert(room.id.clone(), room);
    }

    pub fn add_chat_message(&mut self, message: ChatMessage) {
        self.chat_messages.insert(message.id, message);
    }

    pub fn add_list(&mut self, list: List) {
        if let Some(online_list_id) = list.online_list_id {
            self.lists.insert(online_list_id, list);
        }
    }

    /// Adds every entity of `other`. Entries of `other` replace entries with the same key.
    pub fn merge_with(&mut self, other: Trove) {
        self.accounts.extend(other.accounts);
        self.posts.extend(other.posts);
        self.reposts.extend(other.reposts);
        self.audio_rooms.extend(other.audio_rooms);
        self.likes.extend(other.likes);
        self.bookmarks.extend(other.bookmarks);
        self.notifications.extend(other.notifications);
        self.chat_rooms.extend(other.chat_rooms);
        self.chat_messages.extend(other.chat_messages);
        self.lists.extend(other.lists);
    }

    /// Case-insensitive lookup among the accounts of this trove.
    pub fn find_account_by_handle(&self, handle: &str) -> Option<&Account> {
        self.accounts
            .values()
            .filter(|a| a.handle.eq_ignore_ascii_case(handle))
            .min_by_key(|a| (a.is_deleted, a.id.is_provisional()))
    }

    /// Adds a placeholder for `handle` under a fresh provisional ID, unless an account with
    /// that handle is already present. Returns the ID to reference it by.
    pub fn add_placeholder_account(&mut self, handle: &str) -> AccountId {
        if let Some(existing) = self.find_account_by_handle(handle) {
            return existing.id;
        }
        let id = self.next_provisional_id();
        let mut placeholder = Account::placeholder(handle);
        placeholder.id = id;
        self.accounts.insert(id, placeholder);
        id
    }

    fn next_provisional_id(&self) -> AccountId {
        let lowest = self
            .accounts
            .keys()
            .map(|id| id.0)
            .filter(|id| *id < 0)
            .min()
            .unwrap_or(0);
        AccountId(lowest - 1)
    }

    /// Gives every post whose author is only known by handle an author ID: the matching
    /// account of this trove, or a new placeholder.
    pub fn fill_missing_account_ids(&mut self) {
        let unresolved: Vec<(PostId, String)> = self
            .posts
            .values()
            .filter(|p| p.author_id.is_unknown() && !p.author_handle.is_empty())
            .map(|p| (p.id, p.author_handle.clone()))
            .collect();

        for (post_id, handle) in unresolved {
            let author_id = self.add_placeholder_account(&handle);
            if let Some(post) = self.posts.get_mut(&post_id) {
                post.author_id = author_id;
            }
        }
    }

    /// Replaces every reference to account `from` with `to`. References to
    /// [`AccountId::UNKNOWN`] are never rewritten: they name no account in particular.
    pub fn rewrite_account_id(&mut self, from: AccountId, to: AccountId) {
        if from == to || from.is_unknown() {
            return;
        }
        let swap = |id: &mut AccountId| {
            if *id == from {
                *id = to;
            }
        };
        let swap_opt = |id: &mut Option<AccountId>| {
            if *id == Some(from) {
                *id = Some(to);
            }
        };

        // An account already present under `to` carries more than a placeholder would
        if let Some(mut account) = self.accounts.remove(&from) {
            account.id = to;
            self.accounts.entry(to).or_insert(account);
        }
        for post in self.posts.values_mut() {
            swap(&mut post.author_id);
        }
        for repost in self.reposts.values_mut() {
            swap(&mut repost.reposted_by_id);
        }
        for room in self.audio_rooms.values_mut() {
            swap_opt(&mut room.created_by_id);
            room.participant_ids.iter_mut().for_each(swap);
        }
        self.likes = std::mem::take(&mut self.likes)
            .into_values()
            .map(|mut like| {
                swap(&mut like.liker_id);
                ((like.liker_id, like.post_id), like)
            })
            .collect();
        self.bookmarks = std::mem::take(&mut self.bookmarks)
            .into_values()
            .map(|mut bookmark| {
                swap(&mut bookmark.account_id);
                ((bookmark.account_id, bookmark.post_id), bookmark)
            })
            .collect();
        for notification in self.notifications.values_mut() {
            swap_opt(&mut notification.acting_account_id);
            swap(&mut notification.recipient_id);
            notification.account_ids.iter_mut().for_each(swap);
        }
        for room in self.chat_rooms.values_mut() {
            swap_opt(&mut room.created_by_id);
            if let Some(mut participant) = room.participants.remove(&from) {
                participant.account_id = to;
                room.participants.insert(to, participant);
            }
        }
        for message in self.chat_messages.values_mut() {
            swap(&mut message.sender_id);
            for reaction in message.reactions.values_mut() {
                swap(&mut reaction.sender_id);
            }
            if let Some(reaction) = message.reactions.remove(&from) {
                message.reactions.insert(to, reaction);
            }
        }
        for list in self.lists.values_mut() {
            list.member_ids.iter_mut().for_each(swap);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archivist::chats::ChatParticipant;
    use crate::archivist::test_utils::{test_post, test_repost};

    #[test]
    fn test_empty_and_merge_with() {
        let mut trove = Trove::new();
        assert!(trove.is_empty());

        trove.add_post(test_post(PostId(1), AccountId(10), "first"));
        let mut other = Trove::new();
        other.add_post(test_post(PostId(1), AccountId(10), "first, edited"));
        other.add_repost(test_repost(RepostId(5), PostId(1), AccountId(11), 1_000));
        other.add_account(Account::new(AccountId(10), "kashi"));

        trove.merge_with(other);
        assert!(!trove.is_empty());
        assert_eq!(trove.posts.len(), 1);
        assert_eq!(trove.posts[&PostId(1)].text, "first, edited");
        assert_eq!(trove.reposts.len(), 1);
        assert_eq!(
            trove.find_account_by_handle("KASHI").map(|a| a.id),
            Some(AccountId(10))
        );
    }

    #[test]
    fn test_fill_missing_account_ids() {
        let mut trove = Trove::new();
        trove.add_account(Account::new(AccountId(10), "kashi"));

        let mut known = test_post(PostId(1), AccountId::UNKNOWN, "by a known handle");
        known.author_handle = "Kashi".to_string();
        let mut stranger = test_post(PostId(2), AccountId::UNKNOWN, "by a stranger");
        stranger.author_handle = "stranger".to_string();
        let mut stranger_again = test_post(PostId(3), AccountId::UNKNOWN, "again");
        stranger_again.author_handle = "stranger".to_string();
        for post in [known, stranger, stranger_again] {
            trove.add_post(post);
        }

        trove.fill_missing_account_ids();

        assert_eq!(trove.posts[&PostId(1)].author_id, AccountId(10));
        let stranger_id = trove.posts[&PostId(2)].author_id;
        assert!(stranger_id.is_provisional());
        assert_eq!(trove.posts[&PostId(3)].author_id, stranger_id);
        assert!(trove.accounts[&stranger_id].is_needing_fake_id);
        assert_eq!(trove.accounts.len(), 2);
    }

    #[test]
    fn test_placeholders_get_distinct_provisional_ids() {
        let mut trove = Trove::new();
        let a = trove.add_placeholder_account("a");
        let b = trove.add_placeholder_account("b");
        assert_eq!(a, AccountId(-1));
        assert_eq!(b, AccountId(-2));
        assert_eq!(trove.add_placeholder_account("A"), a);
    }

    #[test]
    fn test_placeholders_added_as_accounts_are_kept_apart() {
        let mut trove = Trove::new();
        trove.add_account(Account::placeholder("alice"));
        trove.add_account(Account::placeholder("bob"));
        trove.add_account(Account::placeholder("Alice"));
        trove.add_post(test_post(PostId(9), AccountId::UNKNOWN, "author unknown"));

        assert_eq!(trove.accounts.len(), 2);
        let alice = trove.find_account_by_handle("alice").unwrap().id;
        let bob = trove.find_account_by_handle("bob").unwrap().id;
        assert!(alice.is_provisional() && bob.is_provisional());
        assert_ne!(alice, bob);
        assert!(!trove.accounts.contains_key(&AccountId::UNKNOWN));

        trove.rewrite_account_id(AccountId::UNKNOWN, AccountId(5));
        assert_eq!(trove.posts[&PostId(9)].author_id, AccountId::UNKNOWN);
    }

    #[test]
    fn test_rewrite_account_id_reaches_every_reference() {
        let mut trove = Trove::new();
        let from = trove.add_placeholder_account("someone");
        let to = AccountId(77);

        trove.add_post(test_post(PostId(1), from, "hi"));
        trove.add_repost(test_repost(RepostId(2), PostId(1), from, 1_000));
        trove.add_like(Like {
            sort_index: 1,
            post_id: PostId(1),
            liker_id: from,
        });
        let mut room = AudioRoom::new("room");
        room.created_by_id = Some(from);
        room.participant_ids = vec![from, AccountId(3)];
        trove.add_audio_room(room);
        let mut chat = ChatRoom {
            id: ChatRoomId::from("c"),
            ..Default::default()
        };
        chat.participants.insert(
            from,
            ChatParticipant {
                account_id: from,
                ..Default::default()
            },
        );
        trove.add_chat_room(chat);

        trove.rewrite_account_id(from, to);

        assert!(!trove.accounts.contains_key(&from));
        assert_eq!(trove.accounts[&to].id, to);
        assert_eq!(trove.posts[&PostId(1)].author_id, to);
        assert_eq!(trove.reposts[&RepostId(2)].reposted_by_id, to);
        assert!(trove.likes.contains_key(&(to, PostId(1))));
        let room = &trove.audio_rooms[&AudioRoomId::from("room")];
        assert_eq!(room.created_by_id, Some(to));
        assert_eq!(room.participant_ids, vec![to, AccountId(3)]);
        let chat = &trove.chat_rooms[&ChatRoomId::from("c")];
        assert_eq!(chat.participants[&to].account_id, to);
    }
}
