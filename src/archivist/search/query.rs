use chrono::{DateTime, NaiveDate, Utc};

use super::{ContentFilter, SearchError, SearchFilters};
use crate::archivist::ids::PostId;

/// A whitespace-separated token. `quoted` tokens started with a double quote and are
/// always keywords.
struct Token {
    text: String,
    quoted: bool,
}

fn tokenize(query: &str) -> Result<Vec<Token>, SearchError> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    let mut in_quotes = false;

    for c in query.chars() {
        match c {
            '"' => {
                if !in_quotes && current.is_empty() {
                    quoted = true;
                }
                in_quotes = !in_quotes;
            }
            c if c.is_whitespace() && !in_quotes => {
                if !current.is_empty() {
                    tokens.push(Token {
                        text: std::mem::take(&mut current),
                        quoted,
                    });
                }
                quoted = false;
            }
            c => current.push(c),
        }
    }

    if in_quotes {
        return Err(SearchError::UnmatchedQuotes(query.to_string()));
    }
    if !current.is_empty() {
        tokens.push(Token {
            text: current,
            quoted,
        });
    }
    Ok(tokens)
}

fn parse_date(value: &str) -> Result<DateTime<Utc>, SearchError> {
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|datetime| datetime.and_utc())
        .ok_or_else(|| SearchError::InvalidDate(value.to_string()))
}

fn handle(value: &str) -> String {
    value.trim_start_matches('@').to_string()
}

/// Parses a search expression into filters.
///
/// Supported qualifiers are `from:`, `to:` (repeatable), `retweeted_by:`, `since:DATE`,
/// `until:DATE`, `filter:KIND` / `-filter:KIND` and `quoted_tweet_id:N`. Anything else is
/// a keyword; a double-quoted run is one keyword. Malformed qualifiers are errors.
pub fn parse_search_query(query: &str) -> Result<SearchFilters, SearchError> {
    let mut filters = SearchFilters::default();

    for token in tokenize(query)? {
        if token.quoted {
            filters.keywords.push(token.text);
            continue;
        }

        let Some((qualifier, value)) = token.text.split_once(':') else {
            filters.keywords.push(token.text);
            continue;
        };

        match qualifier {
            "from" => filters.from_handle = Some(handle(value)),
            "to" => filters.to_handles.push(handle(value)),
            "retweeted_by" => filters.reposted_by_handle = Some(handle(value)),
            "since" => filters.since = Some(parse_date(value)?),
            "until" => filters.until = Some(parse_date(value)?),
            "filter" => filters.required_content.push(value.parse::<ContentFilter>()?),
            "-filter" => filters.excluded_content.push(value.parse::<ContentFilter>()?),
            "quoted_tweet_id" => {
                let id = value
                    .parse::<i64>()
                    .map_err(|_| SearchError::InvalidPostId(value.to_string()))?;
                filters.quoted_post_id = Some(PostId(id));
            }
            // Not a qualifier (e.g. a URL or a time of day)
            _ => filters.keywords.push(token.text),
        }
    }

    Ok(filters)
}
