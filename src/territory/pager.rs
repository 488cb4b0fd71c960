//! Paginated bulk reads past the store's per-request row cap.
//!
//! Pages are fetched strictly in sequence because each offset depends on the
//! previous page. A fixed pause between pages throttles the request rate.
//! A failing page ends the read: whatever was gathered so far is returned
//! and the interruption is recorded on the result.

use std::time::Duration;

use serde::de::DeserializeOwned;

use crate::db::{Select, StoreLimits, TabularStore, from_row};

pub const DEFAULT_PAGE_SIZE: usize = 1000;
pub const DEFAULT_PAGE_DELAY: Duration = Duration::from_millis(50);

/// Page size and inter-page pause.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageOptions {
    pub page_size: usize,
    pub delay: Duration,
}

impl Default for PageOptions {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            delay: DEFAULT_PAGE_DELAY,
        }
    }
}

impl PageOptions {
    pub fn new(page_size: usize) -> Self {
        Self {
            page_size,
            ..Self::default()
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Page size clamped to `[1, limits.max_page_rows]`.
    pub fn effective_page_size(&self, limits: StoreLimits) -> usize {
        self.page_size.clamp(1, limits.max_page_rows.max(1))
    }
}

/// Result of a best-effort sequential read.
#[derive(Debug, Clone, PartialEq)]
pub struct Paged<T> {
    pub rows: Vec<T>,
    /// Pages successfully fetched.
    pub pages: usize,
    /// Why the read stopped early, if it did.
    pub interrupted: Option<String>,
}

impl<T> Default for Paged<T> {
    fn default() -> Self {
        Self {
            rows: Vec::new(),
            pages: 0,
            interrupted: None,
        }
    }
}

impl<T> Paged<T> {
    /// Empty, complete result for reads that were never issued.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Empty result for a read that could not be issued.
    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            interrupted: Some(reason.into()),
            ..Self::default()
        }
    }

    pub fn is_complete(&self) -> bool {
        self.interrupted.is_none()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn map<U>(self, f: impl FnMut(T) -> U) -> Paged<U> {
        Paged {
            rows: self.rows.into_iter().map(f).collect(),
            pages: self.pages,
            interrupted: self.interrupted,
        }
    }
}

/// Read every row of `select`, page by page, decoding into `T`.
///
/// `select` must carry a deterministic order, otherwise rows can repeat or
/// vanish between pages. A select whose filter can match nothing returns
/// immediately without touching the store.
pub async fn read_all<T: DeserializeOwned>(
    store: &dyn TabularStore,
    select: &Select,
    options: &PageOptions,
) -> Paged<T> {
    let mut out = Paged::empty();
    if select.is_unsatisfiable() {
        return out;
    }

    let page_size = options.effective_page_size(store.limits());
    let mut offset = 0usize;

    loop {
        if out.pages > 0 && !options.delay.is_zero() {
            tokio::time::sleep(options.delay).await;
        }

        let page = match store.select_range(select, offset, page_size).await {
            Ok(page) => page,
            Err(e) => {
                tracing::warn!(
                    table = %select.table,
                    offset,
                    rows_so_far = out.rows.len(),
                    "page fetch failed, returning partial result: {}",
                    e
                );
                out.interrupted = Some(e.to_string());
                return out;
            }
        };
        out.pages += 1;

        let fetched = page.len();
        for row in page {
            match from_row::<T>(row) {
                Ok(record) => out.rows.push(record),
                Err(e) => {
                    tracing::warn!(
                        table = %select.table,
                        offset,
                        "undecodable row, returning partial result: {}",
                        e
                    );
                    out.interrupted = Some(e.to_string());
                    return out;
                }
            }
        }

        if fetched < page_size {
            break;
        }
        offset += fetched;
    }

    tracing::debug!(
        table = %select.table,
        rows = out.rows.len(),
        pages = out.pages,
        "bulk read complete"
    );
    out
}
