//! Offset page tokens for list operations on the schema transport.
//!
//! A token is the decimal offset of the next item. Tokens are only
//! meaningful against the same deterministic ordering they were issued for.

use crate::core::error::{FleetError, FleetResult};

/// One page of results.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page<T> {
    pub items: Vec<T>,
    /// Token for the next page; empty when nothing remains.
    pub next_page_token: String,
}

impl<T> Page<T> {
    fn empty() -> Self {
        Self {
            items: Vec::new(),
            next_page_token: String::new(),
        }
    }

    pub fn map<U>(self, f: impl FnMut(T) -> U) -> Page<U> {
        Page {
            items: self.items.into_iter().map(f).collect(),
            next_page_token: self.next_page_token,
        }
    }
}

/// Decode a page token into an offset. The empty token is offset zero.
pub fn decode_page_token(token: &str) -> FleetResult<usize> {
    if token.is_empty() {
        return Ok(0);
    }
    token
        .trim()
        .parse::<usize>()
        .map_err(|_| FleetError::invalid_argument("page_token", format!("invalid page token: {}", token)))
}

/// Encode an offset as a page token.
pub fn encode_page_token(offset: usize) -> String {
    offset.to_string()
}

/// Cut one page out of `items`.
///
/// `page_size <= 0` returns everything from the offset on. An offset at or
/// past the end yields an empty page without a token.
pub fn paginate<T>(items: Vec<T>, page_token: &str, page_size: i32) -> FleetResult<Page<T>> {
    let start = decode_page_token(page_token)?;
    let len = items.len();
    if start >= len {
        return Ok(Page::empty());
    }
    let size = if page_size <= 0 {
        len - start
    } else {
        page_size as usize
    };
    let end = start.saturating_add(size).min(len);
    let next_page_token = if end < len {
        encode_page_token(end)
    } else {
        String::new()
    };
    let items = items.into_iter().skip(start).take(end - start).collect();
    Ok(Page {
        items,
        next_page_token,
    })
}
