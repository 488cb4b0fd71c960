//! Membership queries over id sets larger than the store's predicate limit.
//!
//! An id set is split into consecutive chunks of at most `C` distinct ids.
//! Either each chunk is queried separately and the results concatenated
//! ([`fetch_chunked`]), or the chunks are folded into one disjunction of
//! bounded membership predicates ([`membership_filter`]) when the set has to
//! be combined with other predicates inside a single paginated read.

use std::collections::HashSet;

use serde::de::DeserializeOwned;
use uuid::Uuid;

use crate::db::{Filter, Select, StoreLimits, TabularStore};
use crate::territory::pager::{PageOptions, read_all};

pub const DEFAULT_CHUNK_SIZE: usize = 500;

/// One bounded slice of an id set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdChunk {
    /// Zero-based position of this chunk.
    pub index: usize,
    pub ids: Vec<Uuid>,
}

impl IdChunk {
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// `column IN (ids)`.
    pub fn filter(&self, column: &'static str) -> Filter {
        Filter::is_in(column, self.ids.iter())
    }
}

/// Chunk size clamped to `[1, limits.max_membership]`.
pub fn effective_chunk_size(requested: usize, limits: StoreLimits) -> usize {
    requested.clamp(1, limits.max_membership.max(1))
}

/// Deduplicate `ids` (first occurrence wins) and split them into chunks of at
/// most `chunk_size`. No chunk is empty; an empty input yields no chunks.
pub fn chunk_ids<'a, I>(ids: I, chunk_size: usize) -> Vec<IdChunk>
where
    I: IntoIterator<Item = &'a Uuid>,
{
    let chunk_size = chunk_size.max(1);
    let mut seen = HashSet::new();
    let distinct: Vec<Uuid> = ids.into_iter().copied().filter(|id| seen.insert(*id)).collect();

    distinct
        .chunks(chunk_size)
        .enumerate()
        .map(|(index, ids)| IdChunk {
            index,
            ids: ids.to_vec(),
        })
        .collect()
}

/// Bounded membership predicate for `column` over `ids`.
///
/// Returns `None` when `ids` is empty; the caller must treat that as a query
/// that matches nothing and skip the store entirely.
pub fn membership_filter<'a, I>(column: &'static str, ids: I, chunk_size: usize) -> Option<Filter>
where
    I: IntoIterator<Item = &'a Uuid>,
{
    let mut parts: Vec<Filter> = chunk_ids(ids, chunk_size)
        .iter()
        .map(|chunk| chunk.filter(column))
        .collect();
    match parts.len() {
        0 => None,
        1 => parts.pop(),
        _ => Some(Filter::Or(parts)),
    }
}

/// Rows gathered by one chunked read.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunked<T> {
    pub rows: Vec<T>,
    /// Chunks queried.
    pub chunks: usize,
    /// Chunks whose read failed or stopped early.
    pub failed_chunks: usize,
}

impl<T> Default for Chunked<T> {
    fn default() -> Self {
        Self {
            rows: Vec::new(),
            chunks: 0,
            failed_chunks: 0,
        }
    }
}

impl<T> Chunked<T> {
    pub fn is_complete(&self) -> bool {
        self.failed_chunks == 0
    }
}

/// Run `base` once per chunk of `ids`, restricted by `column ∈ chunk`, and
/// concatenate the results.
///
/// Chunks are read one after another. A chunk whose read fails keeps the rows
/// it managed to read, is logged and counted in `failed_chunks`, and the
/// remaining chunks are still queried.
pub async fn fetch_chunked<T: DeserializeOwned>(
    store: &dyn TabularStore,
    base: &Select,
    column: &'static str,
    ids: &[Uuid],
    chunk_size: usize,
    options: &PageOptions,
) -> Chunked<T> {
    let mut out = Chunked::default();
    if base.is_unsatisfiable() {
        return out;
    }

    let chunk_size = effective_chunk_size(chunk_size, store.limits());
    for chunk in chunk_ids(ids, chunk_size) {
        let select = base.clone().filter(chunk.filter(column));
        let paged = read_all::<T>(store, &select, options).await;
        out.chunks += 1;
        if let Some(reason) = &paged.interrupted {
            tracing::warn!(
                table = %base.table,
                column,
                chunk = chunk.index,
                ids = chunk.len(),
                "chunked read degraded: {}",
                reason
            );
            out.failed_chunks += 1;
        } else {
            tracing::debug!(
                table = %base.table,
                chunk = chunk.index,
                rows = paged.rows.len(),
                "chunk read"
            );
        }
        out.rows.extend(paged.rows);
    }
    out
}
