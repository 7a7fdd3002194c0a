use diesel::r2d2::{ConnectionManager, Pool};
use diesel::PgConnection;
use serde::Serialize;

pub type DbPool = Pool<ConnectionManager<PgConnection>>;

/// Run a blocking diesel closure on the blocking pool. Handlers and
/// background tasks must not hold a connection across an await point.
pub async fn run_blocking<T, F>(pool: &DbPool, f: F) -> anyhow::Result<T>
where
    F: FnOnce(&mut PgConnection) -> anyhow::Result<T> + Send + 'static,
    T: Send + 'static,
{
    let pool = pool.clone();
    tokio::task::spawn_blocking(move || {
        let mut conn = pool.get()?;
        f(&mut conn)
    })
    .await?
}

/// Rough token estimate: ~4 chars per token for western text, same heuristic
/// the embedding batcher uses to stay under provider input limits.
pub fn estimate_token_count(text: &str) -> usize {
    text.len().div_ceil(4)
}

/// Truncate to a character budget at a char boundary, appending a marker when
/// anything was dropped.
pub fn truncate_for_prompt(text: &str, max_chars: usize) -> String {
    if text.len() <= max_chars {
        return text.to_string();
    }
    let mut cut = max_chars;
    while cut > 0 && !text.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}\n\n[Content truncated...]", &text[..cut])
}

#[derive(Debug, Serialize)]
pub struct Page<T: Serialize> {
    pub items: Vec<T>,
    pub total: i64,
    pub page: i64,
    pub page_size: i64,
}

impl<T: Serialize> Page<T> {
    pub fn new(items: Vec<T>, total: i64, skip: i64, limit: i64) -> Self {
        let limit = limit.max(1);
        Self {
            items,
            total,
            page: (skip / limit) + 1,
            page_size: limit,
        }
    }
}

/// Clamp user-supplied paging parameters to sane bounds.
pub fn clamp_paging(skip: Option<i64>, limit: Option<i64>, max_limit: i64) -> (i64, i64) {
    let skip = skip.unwrap_or(0).max(0);
    let limit = limit.unwrap_or(20).clamp(1, max_limit);
    (skip, limit)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_estimate_token_count() {
        assert_eq!(estimate_token_count(""), 0);
        assert_eq!(estimate_token_count("abcd"), 1);
        assert_eq!(estimate_token_count("abcde"), 2);
    }

    #[test]
    fn test_truncate_for_prompt_keeps_short_text() {
        assert_eq!(truncate_for_prompt("hello", 10), "hello");
    }

    #[test]
    fn test_truncate_for_prompt_cuts_long_text() {
        let out = truncate_for_prompt(&"x".repeat(100), 10);
        assert!(out.starts_with("xxxxxxxxxx"));
        assert!(out.ends_with("[Content truncated...]"));
    }

    #[test]
    fn test_truncate_respects_char_boundary() {
        let text = "héllo wörld and more text beyond the budget";
        let out = truncate_for_prompt(text, 2);
        assert!(out.ends_with("[Content truncated...]"));
    }

    #[test]
    fn test_page_numbering() {
        let page = Page::new(vec![1, 2, 3], 30, 20, 10);
        assert_eq!(page.page, 3);
        assert_eq!(page.page_size, 10);
    }

    #[test]
    fn test_clamp_paging() {
        assert_eq!(clamp_paging(None, None, 100), (0, 20));
        assert_eq!(clamp_paging(Some(-5), Some(500), 100), (0, 100));
        assert_eq!(clamp_paging(Some(10), Some(0), 100), (10, 1));
    }
}
