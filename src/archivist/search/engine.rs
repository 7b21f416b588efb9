use std::collections::HashSet;

use super::{
    ContentFilter, Cursor, CursorPosition, Feed, FeedItem, FilterMode, SearchError, SortOrder,
};
use crate::archivist::{
    accounts::Account,
    audio_rooms::AudioRoom,
    database::{
        Database,
        merge_policy::{SqlValue, bind_value_as},
    },
    error::Result,
    ids::{AccountId, AudioRoomId, PostId, RepostId},
    likes::{Bookmark, Like},
    notifications::{Notification, NotificationCursor, NotificationFeed},
    posts::Post,
    reposts::Repost,
    trove::Trove,
};

/// Originals and reposts as one relation. Each row carries the account that put the item in
/// a feed (author or reposter) and the item time (post time or repost time).
const ITEMS_CTE: &str = "items AS (
        SELECT id AS post_id, 0 AS repost_id, author_id AS by_account_id, posted_at AS chrono
        FROM posts WHERE is_stub = 0
        UNION ALL
        SELECT post_id, id, reposted_by_id, reposted_at FROM reposts
    )";

const ACCOUNT_BY_HANDLE: &str = "(SELECT id FROM accounts WHERE handle = ? COLLATE NOCASE)";

fn content_condition(filter: ContentFilter) -> &'static str {
    match filter {
        ContentFilter::Links => "EXISTS (SELECT 1 FROM link_cards c WHERE c.post_id = p.id)",
        ContentFilter::Images => "EXISTS (SELECT 1 FROM images m WHERE m.post_id = p.id)",
        ContentFilter::Videos => "EXISTS (SELECT 1 FROM videos v WHERE v.post_id = p.id)",
        ContentFilter::Polls => "EXISTS (SELECT 1 FROM polls o WHERE o.post_id = p.id)",
        ContentFilter::Spaces => "p.audio_room_id IS NOT NULL",
        ContentFilter::Media => {
            "(EXISTS (SELECT 1 FROM images m WHERE m.post_id = p.id)
              OR EXISTS (SELECT 1 FROM videos v WHERE v.post_id = p.id))"
        }
    }
}

/// SQL and bind values for the page after `cursor`.
pub(super) fn build_page_query(
    cursor: &Cursor,
) -> std::result::Result<(String, Vec<SqlValue>), SearchError> {
    let filters = &cursor.filters;
    let mut binds: Vec<SqlValue> = Vec::new();
    let mut conditions: Vec<String> = Vec::new();

    let (sort_expression, like_join) = match cursor.sort_order {
        SortOrder::NewestFirst | SortOrder::OldestFirst => ("i.chrono", ""),
        SortOrder::MostLiked => ("p.num_likes", ""),
        SortOrder::MostReposted => ("p.num_reposts", ""),
        SortOrder::LikedAt => {
            let liker = filters.liked_by.ok_or(SearchError::LikedAtWithoutLiker)?;
            binds.push(liker.into());
            conditions.push("i.repost_id = 0".to_string());
            (
                "lk.sort_index",
                "JOIN likes lk ON lk.post_id = i.post_id AND lk.liker_id = ?",
            )
        }
    };

    for keyword in &filters.keywords {
        conditions.push("instr(lower(p.text), lower(?)) > 0".to_string());
        binds.push(keyword.as_str().into());
    }
    if let Some(handle) = &filters.from_handle {
        conditions.push(format!("i.by_account_id IN {ACCOUNT_BY_HANDLE}"));
        binds.push(handle.as_str().into());
    }
    for handle in &filters.to_handles {
        conditions.push(
            "(EXISTS (SELECT 1 FROM post_reply_mentions rm
                      WHERE rm.post_id = p.id AND rm.handle = ? COLLATE NOCASE)
              OR EXISTS (SELECT 1 FROM post_mentions pm
                         WHERE pm.post_id = p.id AND pm.handle = ? COLLATE NOCASE))"
                .to_string(),
        );
        binds.push(handle.as_str().into());
        binds.push(handle.as_str().into());
    }
    if let Some(handle) = &filters.reposted_by_handle {
        conditions.push(format!(
            "i.repost_id != 0 AND i.by_account_id IN {ACCOUNT_BY_HANDLE}"
        ));
        binds.push(handle.as_str().into());
    }
    if let Some(since) = filters.since {
        conditions.push("i.chrono >= ?".to_string());
        binds.push(since.into());
    }
    if let Some(until) = filters.until {
        conditions.push("i.chrono < ?".to_string());
        binds.push(until.into());
    }
    for filter in &filters.required_content {
        conditions.push(content_condition(*filter).to_string());
    }
    for filter in &filters.excluded_content {
        conditions.push(format!("NOT {}", content_condition(*filter)));
    }
    if let Some(quoted) = filters.quoted_post_id {
        conditions.push("p.quoted_post_id = ?".to_string());
        binds.push(quoted.into());
    }
    if let Some(liker) = filters.liked_by
        && cursor.sort_order != SortOrder::LikedAt
    {
        conditions.push(
            "EXISTS (SELECT 1 FROM likes l WHERE l.post_id = i.post_id AND l.liker_id = ?)"
                .to_string(),
        );
        binds.push(liker.into());
    }
    if let Some(account) = filters.bookmarked_by {
        conditions.push(
            "EXISTS (SELECT 1 FROM bookmarks b WHERE b.post_id = i.post_id AND b.account_id = ?)"
                .to_string(),
        );
        binds.push(account.into());
    }
    if let Some(list_id) = filters.list_id {
        conditions.push(
            "i.by_account_id IN (SELECT account_id FROM list_members WHERE list_id = ?)"
                .to_string(),
        );
        binds.push(list_id.into());
    }
    if filters.followed_only {
        conditions
            .push("i.by_account_id IN (SELECT id FROM accounts WHERE is_followed = 1)".to_string());
    }
    match filters.replies {
        FilterMode::Include => {}
        FilterMode::Exclude => conditions.push("p.in_reply_to_id IS NULL".to_string()),
        FilterMode::Only => conditions.push("p.in_reply_to_id IS NOT NULL".to_string()),
    }
    match filters.reposts {
        FilterMode::Include => {}
        FilterMode::Exclude => conditions.push("i.repost_id = 0".to_string()),
        FilterMode::Only => conditions.push("i.repost_id != 0".to_string()),
    }

    let where_clause = if conditions.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", conditions.join("\n AND "))
    };

    let (direction, comparison) = if cursor.sort_order.is_ascending() {
        ("ASC", ">")
    } else {
        ("DESC", "<")
    };
    // A cursor carrying only a position value resumes strictly past that value
    let position_clause = match cursor.position {
        CursorPosition::Middle if cursor.last_post_id == PostId::default() => {
            binds.push(cursor.sort_key.into());
            format!("WHERE sort_key {comparison} ?")
        }
        CursorPosition::Middle => {
            binds.push(cursor.sort_key.into());
            binds.push(cursor.last_post_id.into());
            binds.push(cursor.last_repost_id.into());
            format!("WHERE (sort_key, post_id, repost_id) {comparison} (?, ?, ?)")
        }
        _ => String::new(),
    };

    // One extra row tells whether another page exists
    binds.push((cursor.page_size.max(1) as i64 + 1).into());

    let sql = format!(
        "WITH {ITEMS_CTE},
         ranked AS (
            SELECT i.post_id, i.repost_id, {sort_expression} AS sort_key
            FROM items i
            JOIN posts p ON p.id = i.post_id
            {like_join}
            {where_clause}
         )
         SELECT post_id, repost_id, sort_key FROM ranked
         {position_clause}
         ORDER BY sort_key {direction}, post_id {direction}, repost_id {direction}
         LIMIT ?"
    );
    Ok((sql, binds))
}

/// Fetches the page after `cursor`, assembled with everything needed to render it.
pub(crate) async fn next_page(
    cursor: &Cursor,
    viewer: AccountId,
    database: &Database,
) -> Result<Feed> {
    if cursor.is_end() {
        return Ok(Feed {
            items: Vec::new(),
            trove: Trove::new(),
            cursor: cursor.clone(),
        });
    }

    let (sql, binds) = build_page_query(cursor)?;
    let mut query = sqlx::query_as::<_, (i64, i64, i64)>(&sql);
    for value in &binds {
        query = bind_value_as(query, value);
    }
    let mut rows = query.fetch_all(&database.pool).await?;

    let page_size = cursor.page_size.max(1);
    let is_exhausted = rows.len() <= page_size;
    rows.truncate(page_size);

    let mut next = cursor.clone();
    if let Some((post_id, repost_id, sort_key)) = rows.last() {
        next.sort_key = *sort_key;
        next.last_post_id = PostId(*post_id);
        next.last_repost_id = RepostId(*repost_id);
    }
    next.position = if is_exhausted {
        CursorPosition::End
    } else {
        CursorPosition::Middle
    };

    let items: Vec<FeedItem> = rows
        .iter()
        .map(|(post_id, repost_id, _)| FeedItem {
            post_id: PostId(*post_id),
            repost_id: (*repost_id != 0).then_some(RepostId(*repost_id)),
        })
        .collect();

    tracing::debug!(
        target: "archivist::search::next_page",
        "Fetched {} items ({:?}, exhausted: {})",
        items.len(),
        cursor.sort_order,
        is_exhausted
    );

    let post_ids: Vec<PostId> = items.iter().map(|item| item.post_id).collect();
    let repost_ids: Vec<RepostId> = items.iter().filter_map(|item| item.repost_id).collect();
    let trove = load_references(&post_ids, &repost_ids, &[], viewer, database).await?;

    Ok(Feed {
        items,
        trove,
        cursor: next,
    })
}

/// Fetches one page of a recipient's notifications with the posts and accounts they name.
pub(crate) async fn next_notifications_page(
    cursor: &NotificationCursor,
    database: &Database,
) -> Result<NotificationFeed> {
    let (notifications, next) = Notification::page(cursor, database).await?;

    let mut post_ids = Vec::new();
    let mut repost_ids = Vec::new();
    let mut account_ids = vec![cursor.recipient_id];
    for notification in &notifications {
        post_ids.extend(notification.post_id);
        post_ids.extend(notification.post_ids.iter().copied());
        repost_ids.extend(notification.repost_id);
        account_ids.extend(notification.acting_account_id);
        account_ids.extend(notification.account_ids.iter().copied());
    }

    let trove = load_references(
        &post_ids,
        &repost_ids,
        &account_ids,
        cursor.recipient_id,
        database,
    )
    .await?;

    Ok(NotificationFeed {
        notifications,
        trove,
        cursor: next,
    })
}

fn dedup<T: Copy + Eq + std::hash::Hash>(ids: impl IntoIterator<Item = T>) -> Vec<T> {
    let mut seen = HashSet::new();
    ids.into_iter().filter(|id| seen.insert(*id)).collect()
}

/// Batched fan-out: the posts (with attachments), the posts they quote, the reposts, the
/// audio rooms, then every account referenced by any of those.
async fn load_references(
    post_ids: &[PostId],
    repost_ids: &[RepostId],
    extra_account_ids: &[AccountId],
    viewer: AccountId,
    database: &Database,
) -> Result<Trove> {
    let mut trove = Trove::new();

    let post_ids = dedup(post_ids.iter().copied());
    for post in Post::find_many(&post_ids, database).await? {
        trove.add_post(post);
    }

    let quoted_ids = dedup(
        trove
            .posts
            .values()
            .filter_map(|post| post.quoted_post_id)
            .filter(|id| !trove.posts.contains_key(id)),
    );
    for post in Post::find_many(&quoted_ids, database).await? {
        trove.add_post(post);
    }

    for repost in Repost::find_many(&dedup(repost_ids.iter().copied()), database).await? {
        trove.add_repost(repost);
    }

    let room_ids: Vec<AudioRoomId> = trove
        .posts
        .values()
        .filter_map(|post| post.audio_room_id.clone())
        .collect::<HashSet<_>>()
        .into_iter()
        .collect();
    for room in AudioRoom::find_many(&room_ids, database).await? {
        trove.add_audio_room(room);
    }

    let account_ids = dedup(
        extra_account_ids
            .iter()
            .copied()
            .chain(trove.posts.values().map(|post| post.author_id))
            .chain(trove.reposts.values().map(|repost| repost.reposted_by_id))
            .chain(trove.audio_rooms.values().filter_map(|room| room.created_by_id)),
    );
    for account in Account::find_many(&account_ids, database).await? {
        trove.add_account(account);
    }

    let all_post_ids: Vec<PostId> = trove.posts.keys().copied().collect();
    let liked = Like::liked_among(viewer, &all_post_ids, database).await?;
    let bookmarked = Bookmark::bookmarked_among(viewer, &all_post_ids, database).await?;
    for post in trove.posts.values_mut() {
        post.is_liked_by_viewer = liked.contains(&post.id);
        post.is_bookmarked_by_viewer = bookmarked.contains(&post.id);
    }

    Ok(trove)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archivist::{
        posts::Image,
        search::SearchFilters,
        test_utils::{create_test_database, test_post, test_repost},
    };

    /// kashi (1) posts 1 and 3 and reposts post 2 at t=4000; dril (2) posts 2 and 5.
    /// Post N is posted at t=N*1000.
    async fn seed(database: &Database) {
        for (id, handle) in [(1, "kashi"), (2, "dril")] {
            Account::new(AccountId(id), handle)
                .save(database)
                .await
                .unwrap();
        }
        let mut tank_post = test_post(PostId(1), AccountId(1), "Think Tank meeting");
        tank_post.images = vec![Image {
            id: 100,
            post_id: PostId(1),
            remote_url: "https://img.example.com/a.jpg".to_string(),
            local_filename: "a.jpg".to_string(),
            ..Default::default()
        }];
        tank_post.save(database).await.unwrap();
        test_post(PostId(2), AccountId(2), "a post worth reposting")
            .save(database)
            .await
            .unwrap();
        let mut reply = test_post(PostId(3), AccountId(1), "replying");
        reply.in_reply_to_id = Some(PostId(2));
        reply.quoted_post_id = Some(PostId(2));
        reply.save(database).await.unwrap();
        test_post(PostId(5), AccountId(2), "newest")
            .save(database)
            .await
            .unwrap();
        test_repost(RepostId(10), PostId(2), AccountId(1), 4_000)
            .save(database)
            .await
            .unwrap();
    }

    async fn collect_all(mut cursor: Cursor, database: &Database) -> Vec<FeedItem> {
        let mut items = Vec::new();
        while !cursor.is_end() {
            let feed = next_page(&cursor, AccountId::UNKNOWN, database)
                .await
                .unwrap();
            items.extend(feed.items);
            cursor = feed.cursor;
        }
        items
    }

    fn item(post_id: i64, repost_id: Option<i64>) -> FeedItem {
        FeedItem {
            post_id: PostId(post_id),
            repost_id: repost_id.map(RepostId),
        }
    }

    #[tokio::test]
    async fn test_user_feed_interleaves_reposts_by_time() {
        let (db, _dir) = create_test_database().await;
        seed(&db).await;

        let feed = next_page(&Cursor::user_feed("kashi", 2), AccountId::UNKNOWN, &db)
            .await
            .unwrap();
        assert_eq!(feed.items, vec![item(2, Some(10)), item(3, None)]);
        assert_eq!(feed.cursor.position, CursorPosition::Middle);
        assert_eq!(feed.cursor.sort_key, 3_000);

        // Everything needed to render the page
        assert!(feed.trove.posts.contains_key(&PostId(2)));
        assert!(feed.trove.posts.contains_key(&PostId(3)));
        assert!(feed.trove.reposts.contains_key(&RepostId(10)));
        assert!(feed.trove.accounts.contains_key(&AccountId(1)));
        assert!(feed.trove.accounts.contains_key(&AccountId(2)));

        let feed = next_page(&feed.cursor, AccountId::UNKNOWN, &db)
            .await
            .unwrap();
        assert_eq!(feed.items, vec![item(1, None)]);
        assert!(feed.is_end());

        let feed = next_page(&feed.cursor, AccountId::UNKNOWN, &db)
            .await
            .unwrap();
        assert!(feed.is_empty());
        assert!(feed.is_end());
    }

    #[tokio::test]
    async fn test_pagination_with_ties_is_complete() {
        let (db, _dir) = create_test_database().await;
        seed(&db).await;

        // Every post has zero likes, so only the tie-break keys order them
        let items = collect_all(Cursor::new(SortOrder::MostLiked, 2), &db).await;
        assert_eq!(
            items,
            vec![
                item(5, None),
                item(3, None),
                item(2, Some(10)),
                item(2, None),
                item(1, None),
            ]
        );

        let oldest_first = collect_all(Cursor::new(SortOrder::OldestFirst, 3), &db).await;
        assert_eq!(
            oldest_first,
            vec![
                item(1, None),
                item(2, None),
                item(3, None),
                item(2, Some(10)),
                item(5, None),
            ]
        );
    }

    #[tokio::test]
    async fn test_position_only_cursor_is_strict_both_ways() {
        let (db, _dir) = create_test_database().await;
        seed(&db).await;

        let mut oldest = Cursor::new(SortOrder::OldestFirst, 10);
        oldest.position = CursorPosition::Middle;
        oldest.sort_key = 2_000;
        let items = collect_all(oldest, &db).await;
        assert_eq!(items, vec![item(3, None), item(2, Some(10)), item(5, None)]);

        let mut newest = Cursor::new(SortOrder::NewestFirst, 10);
        newest.position = CursorPosition::Middle;
        newest.sort_key = 4_000;
        let items = collect_all(newest, &db).await;
        assert_eq!(items, vec![item(3, None), item(2, None), item(1, None)]);
    }

    #[tokio::test]
    async fn test_search_filters() {
        let (db, _dir) = create_test_database().await;
        seed(&db).await;

        let search = |query: &str| {
            let mut cursor = Cursor::from_search_query(query).unwrap();
            cursor.page_size = 10;
            cursor
        };

        let items = collect_all(search("tank"), &db).await;
        assert_eq!(items, vec![item(1, None)]);

        let items = collect_all(search("filter:images"), &db).await;
        assert_eq!(items, vec![item(1, None)]);

        let items = collect_all(search("from:kashi -filter:images"), &db).await;
        assert_eq!(items, vec![item(2, Some(10)), item(3, None)]);

        let items = collect_all(search("retweeted_by:KASHI"), &db).await;
        assert_eq!(items, vec![item(2, Some(10))]);

        let items = collect_all(search("quoted_tweet_id:2"), &db).await;
        assert_eq!(items, vec![item(3, None)]);

        let items = collect_all(search("since:1970-01-01 until:1970-01-01"), &db).await;
        assert!(items.is_empty());

        let no_replies = Cursor::new(SortOrder::NewestFirst, 10).with_filters(SearchFilters {
            replies: FilterMode::Exclude,
            reposts: FilterMode::Exclude,
            ..Default::default()
        });
        let items = collect_all(no_replies, &db).await;
        assert_eq!(items, vec![item(5, None), item(2, None), item(1, None)]);
    }

    #[tokio::test]
    async fn test_likes_feed_and_viewer_flags() {
        let (db, _dir) = create_test_database().await;
        seed(&db).await;
        for (sort_index, post_id) in [(7, 5), (9, 1)] {
            Like {
                sort_index,
                post_id: PostId(post_id),
                liker_id: AccountId(1),
            }
            .save(&db)
            .await
            .unwrap();
        }

        let feed = next_page(&Cursor::likes_feed(AccountId(1), 10), AccountId(1), &db)
            .await
            .unwrap();
        assert_eq!(feed.items, vec![item(1, None), item(5, None)]);
        assert!(feed.trove.posts[&PostId(1)].is_liked_by_viewer);
        assert!(!feed.trove.posts[&PostId(1)].is_bookmarked_by_viewer);

        let err = next_page(&Cursor::new(SortOrder::LikedAt, 10), AccountId(1), &db)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            crate::ArchivistError::InvalidQuery(SearchError::LikedAtWithoutLiker)
        ));
    }

    #[tokio::test]
    async fn test_quoted_posts_are_fanned_out() {
        let (db, _dir) = create_test_database().await;
        seed(&db).await;

        let cursor = Cursor::new(SortOrder::NewestFirst, 10).with_filters(SearchFilters {
            quoted_post_id: Some(PostId(2)),
            ..Default::default()
        });
        let feed = next_page(&cursor, AccountId::UNKNOWN, &db).await.unwrap();
        assert_eq!(feed.items, vec![item(3, None)]);
        assert!(feed.trove.posts.contains_key(&PostId(2)));
        assert!(feed.trove.accounts.contains_key(&AccountId(2)));
    }

    #[test]
    fn test_query_is_a_single_union() {
        let cursor = Cursor::from_search_query("tank from:kashi").unwrap();
        let (sql, binds) = build_page_query(&cursor).unwrap();
        assert_eq!(sql.matches("UNION ALL").count(), 1);
        // two filters plus the limit
        assert_eq!(binds.len(), 3);
    }
}
