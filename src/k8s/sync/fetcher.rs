use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{Error, Result};
use crate::k8s::descriptor::WatchDescriptor;
use crate::k8s::resource::Resource;

/// One page of a paginated list: the items, the list's resourceVersion, and
/// the continuation cursor for the next page (absent on the last page).
#[derive(Debug, Clone)]
pub struct ResourceListPage {
    pub items: Vec<Resource>,
    pub resource_version: String,
    pub continue_token: Option<String>,
}

/// The REST collaborator seam: one page request per call.
#[async_trait]
pub trait ResourceLister: Send + Sync {
    async fn list_page(
        &self,
        query: &WatchDescriptor,
        limit: u32,
        continue_token: Option<&str>,
    ) -> Result<ResourceListPage>;
}

/// What a completed list run settles on. `resource_version` comes from the
/// final page and is the gap-free starting point for the live watch.
#[derive(Debug)]
pub struct ListOutcome {
    pub resources: Vec<Arc<Resource>>,
    pub resource_version: String,
    pub pages: usize,
}

/// Drives one query's pagination to exhaustion.
pub struct ListFetcher {
    lister: Arc<dyn ResourceLister>,
    page_limit: u32,
}

impl ListFetcher {
    #[must_use]
    pub fn new(lister: Arc<dyn ResourceLister>, page_limit: u32) -> Self {
        Self { lister, page_limit }
    }

    /// Fetch pages sequentially until a page arrives without a continuation
    /// token, invoking `on_page` for every non-empty page as it lands.
    ///
    /// Cancellation is checked before each page request and again before
    /// each `on_page` call, so an unsubscribe mid-run stops further
    /// requests and discards the in-flight result.
    ///
    /// # Errors
    ///
    /// Returns `Error::Cancelled` when `cancel` fires mid-run, or the page
    /// request's error, which aborts the run. Pages already delivered
    /// through `on_page` are not rolled back.
    pub async fn fetch_all<F>(
        &self,
        query: &WatchDescriptor,
        cancel: &CancellationToken,
        mut on_page: F,
    ) -> Result<ListOutcome>
    where
        F: FnMut(Vec<Arc<Resource>>),
    {
        let mut continue_token: Option<String> = None;
        let mut resources = Vec::new();
        let mut resource_version = String::new();
        let mut pages = 0;
        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let page = self
                .lister
                .list_page(query, self.page_limit, continue_token.as_deref())
                .await?;
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            pages += 1;
            resource_version = page.resource_version;
            debug!(
                kind = %query.kind,
                page = pages,
                items = page.items.len(),
                "list page fetched"
            );
            if !page.items.is_empty() {
                let items: Vec<Arc<Resource>> = page.items.into_iter().map(Arc::new).collect();
                resources.extend(items.iter().map(Arc::clone));
                on_page(items);
            }
            match page.continue_token {
                Some(token) if !token.is_empty() => continue_token = Some(token),
                _ => break,
            }
        }
        Ok(ListOutcome {
            resources,
            resource_version,
            pages,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::serde_json::{from_value, json};
    use std::collections::VecDeque;
    use std::sync::Mutex;

    fn pod(name: &str, rv: &str) -> Resource {
        from_value(json!({
            "kind": "Pod",
            "metadata": {"name": name, "namespace": "ns1", "resourceVersion": rv},
        }))
        .unwrap()
    }

    struct ScriptedLister {
        pages: Mutex<VecDeque<Result<ResourceListPage>>>,
        seen_tokens: Mutex<Vec<Option<String>>>,
    }

    impl ScriptedLister {
        fn new(pages: Vec<Result<ResourceListPage>>) -> Arc<Self> {
            Arc::new(Self {
                pages: Mutex::new(pages.into()),
                seen_tokens: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl ResourceLister for ScriptedLister {
        async fn list_page(
            &self,
            _query: &WatchDescriptor,
            _limit: u32,
            continue_token: Option<&str>,
        ) -> Result<ResourceListPage> {
            self.seen_tokens
                .lock()
                .unwrap()
                .push(continue_token.map(ToOwned::to_owned));
            self.pages
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(Error::Custom("script exhausted".into())))
        }
    }

    #[tokio::test]
    async fn paginates_until_the_continue_token_runs_out() {
        let lister = ScriptedLister::new(vec![
            Ok(ResourceListPage {
                items: vec![pod("a", "1"), pod("b", "2")],
                resource_version: "9".into(),
                continue_token: Some("tok1".into()),
            }),
            Ok(ResourceListPage {
                items: vec![pod("c", "3")],
                resource_version: "11".into(),
                continue_token: None,
            }),
        ]);
        let fetcher = ListFetcher::new(lister.clone(), 250);
        let mut page_sizes = Vec::new();
        let outcome = fetcher
            .fetch_all(
                &WatchDescriptor::new("Pod").namespace("ns1"),
                &CancellationToken::new(),
                |page| page_sizes.push(page.len()),
            )
            .await
            .unwrap();

        assert_eq!(outcome.pages, 2);
        assert_eq!(outcome.resources.len(), 3);
        assert_eq!(outcome.resource_version, "11");
        assert_eq!(page_sizes, vec![2, 1]);
        assert_eq!(
            *lister.seen_tokens.lock().unwrap(),
            vec![None, Some("tok1".to_owned())]
        );
    }

    #[tokio::test]
    async fn empty_token_terminates_like_a_missing_one() {
        let lister = ScriptedLister::new(vec![Ok(ResourceListPage {
            items: vec![pod("a", "1")],
            resource_version: "5".into(),
            continue_token: Some(String::new()),
        })]);
        let fetcher = ListFetcher::new(lister, 250);
        let outcome = fetcher
            .fetch_all(
                &WatchDescriptor::new("Pod"),
                &CancellationToken::new(),
                |_| {},
            )
            .await
            .unwrap();
        assert_eq!(outcome.pages, 1);
    }

    #[tokio::test]
    async fn empty_first_page_is_terminal() {
        let lister = ScriptedLister::new(vec![Ok(ResourceListPage {
            items: vec![],
            resource_version: "44".into(),
            continue_token: None,
        })]);
        let fetcher = ListFetcher::new(lister, 250);
        let mut pages_seen = 0;
        let outcome = fetcher
            .fetch_all(
                &WatchDescriptor::new("Pod"),
                &CancellationToken::new(),
                |_| pages_seen += 1,
            )
            .await
            .unwrap();
        assert_eq!(outcome.resources.len(), 0);
        assert_eq!(outcome.resource_version, "44");
        assert_eq!(pages_seen, 0, "empty pages are not delivered");
    }

    #[tokio::test]
    async fn a_failed_page_aborts_but_keeps_delivered_pages() {
        let lister = ScriptedLister::new(vec![
            Ok(ResourceListPage {
                items: vec![pod("a", "1")],
                resource_version: "9".into(),
                continue_token: Some("tok1".into()),
            }),
            Err(Error::ListFetch("HTTP 500".into())),
        ]);
        let fetcher = ListFetcher::new(lister, 250);
        let mut delivered = 0;
        let err = fetcher
            .fetch_all(
                &WatchDescriptor::new("Pod"),
                &CancellationToken::new(),
                |page| delivered += page.len(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ListFetch(_)));
        assert_eq!(delivered, 1, "the first page was already delivered");
    }

    #[tokio::test]
    async fn cancellation_stops_further_requests() {
        let lister = ScriptedLister::new(vec![Ok(ResourceListPage {
            items: vec![pod("a", "1")],
            resource_version: "9".into(),
            continue_token: Some("tok1".into()),
        })]);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let fetcher = ListFetcher::new(lister.clone(), 250);
        let err = fetcher
            .fetch_all(&WatchDescriptor::new("Pod"), &cancel, |_| {
                panic!("no page should be delivered after cancellation")
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        assert!(lister.seen_tokens.lock().unwrap().is_empty());
    }
}
