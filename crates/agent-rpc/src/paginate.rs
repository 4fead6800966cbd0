//! Pagination drivers
//!
//! Every crawl shares the same control structure: fetch a page, then decide
//! whether to continue. The caller's fetch function does the API call and
//! record handling; the driver only advances the position and stops.
//!
//! The loop ends when a page reports `has_more == false`, when the fetch
//! returns [`PageOutcome::Stop`] (incremental crawls that reached their
//! watermark), or on the first error, which is returned as is. Retrying a
//! page is the API client's job, not the driver's.

use crate::{Result, RpcError};
use std::future::Future;
use tracing::trace;

/// Result of one pagination step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PageInfo {
    pub has_more: bool,

    /// Number of items the source used for this page
    pub page_size: usize,

    /// Total items reported by the source, when known
    pub total: usize,
}

impl PageInfo {
    pub fn more(page_size: usize) -> Self {
        Self {
            has_more: true,
            page_size,
            total: 0,
        }
    }

    pub fn last(page_size: usize) -> Self {
        Self {
            has_more: false,
            page_size,
            total: 0,
        }
    }

    pub fn with_total(mut self, total: usize) -> Self {
        self.total = total;
        self
    }
}

/// What a fetch function tells the driver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageOutcome {
    /// A page was processed, continue if it says there is more
    Page(PageInfo),
    /// Stop now without fetching further pages
    Stop,
}

/// Position of an offset-paginated request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub start_at: usize,
    pub max_results: usize,
}

/// Drive an offset-based crawl (`startAt` / `maxResults` style APIs)
///
/// `max_results` is the ceiling the caller asks for. The next `start_at` is
/// advanced by the page size the source actually reports, so a source that
/// lowers the ceiling is still walked without gaps.
///
/// Returns the number of fetch calls made.
pub async fn paginate_offset<F, Fut>(max_results: usize, mut fetch: F) -> Result<usize>
where
    F: FnMut(PageRequest) -> Fut,
    Fut: Future<Output = Result<PageOutcome>>,
{
    let mut request = PageRequest {
        start_at: 0,
        max_results,
    };
    let mut calls = 0;

    loop {
        calls += 1;
        let info = match fetch(request).await? {
            PageOutcome::Stop => {
                trace!(calls, "Pagination stopped by caller");
                return Ok(calls);
            }
            PageOutcome::Page(info) => info,
        };

        if !info.has_more {
            return Ok(calls);
        }
        if info.page_size == 0 {
            return Err(RpcError::Pagination(format!(
                "page at offset {} reported more results with a page size of 0",
                request.start_at
            )));
        }

        request.start_at += info.page_size;
        trace!(start_at = request.start_at, total = info.total, "Fetching next page");
    }
}

/// Drive a cursor-based crawl (next-link or GraphQL `endCursor` style APIs)
///
/// `fetch` receives the cursor returned by the previous page (`None` for the
/// first page) and returns the page outcome plus the next cursor. A page that
/// says it has more but provides no cursor ends the loop.
///
/// Returns the number of fetch calls made.
pub async fn paginate_cursor<F, Fut>(mut fetch: F) -> Result<usize>
where
    F: FnMut(Option<String>) -> Fut,
    Fut: Future<Output = Result<(PageOutcome, Option<String>)>>,
{
    let mut cursor = None;
    let mut calls = 0;

    loop {
        calls += 1;
        let (outcome, next) = fetch(cursor.take()).await?;
        match outcome {
            PageOutcome::Stop => return Ok(calls),
            PageOutcome::Page(info) if !info.has_more => return Ok(calls),
            PageOutcome::Page(_) => match next {
                Some(next) => cursor = Some(next),
                None => return Ok(calls),
            },
        }
    }
}
