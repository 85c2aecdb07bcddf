//! Paged search driven through the retry policy.

use async_trait::async_trait;
use tracing::{debug, info};

use crate::directory::{Directory, DirectoryEntry, Paging, SearchRequest};
use crate::error::{DirectoryError, Failure, Result};
use crate::filter::Filter;
use crate::retry::{self, Operation};
use crate::session::Session;


/// Reads every page of one search request.
///
/// Entries collected before a transient failure are kept; the retry starts
/// over from the first page, so the result may hold duplicates.
struct PagedSearch<'a> {
    request: &'a SearchRequest,
    entries: Vec<DirectoryEntry>,
    pages: usize,
}
#[async_trait]
impl<'a> Operation for PagedSearch<'a> {
    type Output = ();

    fn name(&self) -> &'static str { "search" }
    fn target(&self) -> &str { &self.request.base_dn }

    async fn attempt(&mut self, connection: &mut dyn Directory) -> std::result::Result<(), Failure> {
        let mut cookie = None;
        loop {
            let page = connection.search_page(self.request, cookie.as_ref()).await?;
            self.pages += 1;
            debug!(base = %self.request.base_dn, page = self.pages, entries = page.entries.len(), "received search page");
            self.entries.extend(page.entries);

            match page.paging {
                Paging::More(next) => cookie = Some(next),
                Paging::Done => return Ok(()),
                Paging::Unsupported => {
                    if cookie.is_none() {
                        info!(base = %self.request.base_dn, "server returned no paging control; treating result as a single page");
                    }
                    return Ok(());
                },
            }
        }
    }

    fn reject(&self, failure: Failure) -> DirectoryError {
        DirectoryError::Search { base: self.request.base_dn.clone(), cause: failure.message }
    }
}


/// Runs a paged search and returns all entries in server order.
///
/// The filter must parse; a malformed filter is rejected before anything is
/// sent to the server.
pub async fn search(session: &mut Session, request: &SearchRequest) -> Result<Vec<DirectoryEntry>> {
    Filter::parse(&request.filter)?;
    if request.page_size == 0 {
        return Err(DirectoryError::InvalidArgument("page size must be positive".to_owned()));
    }

    let mut operation = PagedSearch { request, entries: Vec::new(), pages: 0 };
    retry::run(session, &mut operation).await?;
    debug!(base = %request.base_dn, pages = operation.pages, entries = operation.entries.len(), "search finished");
    Ok(operation.entries)
}
