//! Cursor-based enumeration.
//!
//! Four backend commands walk a keyspace or a collection a page at a time and
//! hand back a cursor to resume from: the whole keyspace, members of a set,
//! fields of a hash and members of a sorted set. [`ScanIterator`] hides the paging
//! behind `next`/`val`/`err`. A [`PageFetcher`] is the only backend-specific part.
//!
//! Enumeration is not a snapshot. A key present for the whole scan is visited at
//! least once; keys created or removed mid-scan may be missed or repeated.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::context::Context;
use crate::error::StoreError;

/// Cursor value that starts a scan and, when returned again, ends it.
pub const START_CURSOR: u64 = 0;

/// The enumeration command a scanner drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScanCommand {
    /// Every key in the selected database.
    Keys,
    /// Members of one set.
    SetMembers,
    /// Field names of one hash.
    HashFields,
    /// Members of one sorted set.
    SortedSetMembers,
}

impl ScanCommand {
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            ScanCommand::Keys => "SCAN",
            ScanCommand::SetMembers => "SSCAN",
            ScanCommand::HashFields => "HSCAN",
            ScanCommand::SortedSetMembers => "ZSCAN",
        }
    }

    /// Whether the command walks a single parent key.
    #[must_use]
    pub fn is_keyed(self) -> bool {
        !matches!(self, ScanCommand::Keys)
    }

    /// Reply entries per yielded item: hashes and sorted sets interleave a value
    /// or score after each field or member.
    #[must_use]
    pub fn stride(self) -> usize {
        match self {
            ScanCommand::Keys | ScanCommand::SetMembers => 1,
            ScanCommand::HashFields | ScanCommand::SortedSetMembers => 2,
        }
    }
}

impl fmt::Display for ScanCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Arguments for one page fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    pub key: Option<String>,
    pub cursor: u64,
    pub pattern: Option<String>,
    pub count: Option<usize>,
}

/// One page of results plus the cursor to resume from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Page {
    pub cursor: u64,
    pub items: Vec<String>,
}

/// Fetches a single page from a backend.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    fn command(&self) -> ScanCommand;

    async fn fetch(&self, ctx: &Context, request: &PageRequest) -> Result<Page, StoreError>;
}

/// Produces an iterator from the arguments it was built with.
#[async_trait]
pub trait Scanner: Send + Sync {
    async fn scan(&self, ctx: &Context) -> ScanIterator;
}

/// Scanner over a command that needs no parent key.
#[derive(Clone)]
pub struct CursorScanner {
    fetcher: Arc<dyn PageFetcher>,
    cursor: u64,
    pattern: Option<String>,
    count: Option<usize>,
}

impl CursorScanner {
    #[must_use]
    pub fn new(fetcher: Arc<dyn PageFetcher>) -> Self {
        Self {
            fetcher,
            cursor: START_CURSOR,
            pattern: None,
            count: None,
        }
    }

    /// A new scanner with its own cursor, match pattern and batch hint.
    ///
    /// The receiver is left untouched, so one base scanner can seed many
    /// differently configured scans. An empty pattern or a zero count means
    /// "unset".
    #[must_use]
    pub fn with_args(&self, cursor: u64, pattern: &str, count: usize) -> Self {
        Self {
            fetcher: Arc::clone(&self.fetcher),
            cursor,
            pattern: (!pattern.is_empty()).then(|| pattern.to_string()),
            count: (count > 0).then_some(count),
        }
    }

    #[must_use]
    pub fn command(&self) -> ScanCommand {
        self.fetcher.command()
    }

    #[must_use]
    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    #[must_use]
    pub fn pattern(&self) -> Option<&str> {
        self.pattern.as_deref()
    }

    #[must_use]
    pub fn count(&self) -> Option<usize> {
        self.count
    }

    fn request(&self, key: Option<String>) -> PageRequest {
        PageRequest {
            key,
            cursor: self.cursor,
            pattern: self.pattern.clone(),
            count: self.count,
        }
    }
}

impl fmt::Debug for CursorScanner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CursorScanner")
            .field("command", &self.command())
            .field("cursor", &self.cursor)
            .field("pattern", &self.pattern)
            .field("count", &self.count)
            .finish()
    }
}

#[async_trait]
impl Scanner for CursorScanner {
    async fn scan(&self, ctx: &Context) -> ScanIterator {
        if self.command().is_keyed() {
            return ScanIterator::failed(StoreError::ScanError(format!(
                "{} needs a parent key; use a KeyCursorScanner",
                self.command()
            )));
        }
        ScanIterator::start(ctx, Arc::clone(&self.fetcher), self.request(None)).await
    }
}

/// Scanner scoped to the members or fields of one parent key.
#[derive(Clone, Debug)]
pub struct KeyCursorScanner {
    base: CursorScanner,
    key: String,
}

impl KeyCursorScanner {
    #[must_use]
    pub fn new(fetcher: Arc<dyn PageFetcher>) -> Self {
        Self {
            base: CursorScanner::new(fetcher),
            key: String::new(),
        }
    }

    /// A new scanner for `key` with its own cursor, pattern and batch hint.
    #[must_use]
    pub fn with_args(&self, key: &str, cursor: u64, pattern: &str, count: usize) -> Self {
        Self {
            base: self.base.with_args(cursor, pattern, count),
            key: key.to_string(),
        }
    }

    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    #[must_use]
    pub fn command(&self) -> ScanCommand {
        self.base.command()
    }

    #[must_use]
    pub fn cursor(&self) -> u64 {
        self.base.cursor()
    }

    #[must_use]
    pub fn pattern(&self) -> Option<&str> {
        self.base.pattern()
    }

    #[must_use]
    pub fn count(&self) -> Option<usize> {
        self.base.count()
    }
}

#[async_trait]
impl Scanner for KeyCursorScanner {
    async fn scan(&self, ctx: &Context) -> ScanIterator {
        if self.key.is_empty() {
            return ScanIterator::failed(StoreError::ScanError(format!(
                "{} requires a key",
                self.command()
            )));
        }
        let request = self.base.request(Some(self.key.clone()));
        ScanIterator::start(ctx, Arc::clone(&self.base.fetcher), request).await
    }
}

/// The four scanner bases a key-value store hands out.
///
/// Built once per store and passed in explicitly; derive configured scanners
/// with `with_args`.
#[derive(Clone, Debug)]
pub struct Scanners {
    pub keys: CursorScanner,
    pub set_members: KeyCursorScanner,
    pub hash_fields: KeyCursorScanner,
    pub sorted_set_members: KeyCursorScanner,
}

impl Scanners {
    /// Build all four bases from a fetcher factory.
    pub fn from_fn<F>(mut make: F) -> Self
    where
        F: FnMut(ScanCommand) -> Arc<dyn PageFetcher>,
    {
        Self {
            keys: CursorScanner::new(make(ScanCommand::Keys)),
            set_members: KeyCursorScanner::new(make(ScanCommand::SetMembers)),
            hash_fields: KeyCursorScanner::new(make(ScanCommand::HashFields)),
            sorted_set_members: KeyCursorScanner::new(make(ScanCommand::SortedSetMembers)),
        }
    }
}

/// Iterator over scan results.
///
/// Check [`ScanIterator::err`] before the first `next` (setup failure) and after
/// the last one (exhaustion vs. failure).
pub struct ScanIterator {
    fetcher: Option<Arc<dyn PageFetcher>>,
    request: PageRequest,
    buffer: VecDeque<String>,
    current: Option<String>,
    done: bool,
    err: Option<StoreError>,
}

impl ScanIterator {
    /// Iterator that yields nothing and reports `err`.
    #[must_use]
    pub fn failed(err: StoreError) -> Self {
        Self {
            fetcher: None,
            request: PageRequest {
                key: None,
                cursor: START_CURSOR,
                pattern: None,
                count: None,
            },
            buffer: VecDeque::new(),
            current: None,
            done: true,
            err: Some(err),
        }
    }

    /// Fetch the first page eagerly so setup failures show up in `err()`.
    pub async fn start(
        ctx: &Context,
        fetcher: Arc<dyn PageFetcher>,
        request: PageRequest,
    ) -> Self {
        let mut iter = Self {
            fetcher: Some(fetcher),
            request,
            buffer: VecDeque::new(),
            current: None,
            done: false,
            err: None,
        };
        iter.fetch_page(ctx).await;
        iter
    }

    async fn fetch_page(&mut self, ctx: &Context) {
        let Some(fetcher) = self.fetcher.as_ref() else {
            self.done = true;
            return;
        };
        match fetcher.fetch(ctx, &self.request).await {
            Ok(page) => {
                tracing::trace!(
                    command = %fetcher.command(),
                    cursor = page.cursor,
                    items = page.items.len(),
                    "scan page fetched"
                );
                self.buffer.extend(page.items);
                self.request.cursor = page.cursor;
                if page.cursor == START_CURSOR {
                    self.done = true;
                }
            }
            Err(err) => {
                tracing::debug!(command = %fetcher.command(), error = %err, "scan page failed");
                self.err = Some(err);
                self.done = true;
            }
        }
    }

    /// Advance to the next element, fetching pages as needed.
    ///
    /// Returns `false` once the scan is exhausted or has failed.
    pub async fn next(&mut self, ctx: &Context) -> bool {
        self.current = None;
        if self.err.is_some() {
            return false;
        }
        loop {
            if let Some(item) = self.buffer.pop_front() {
                self.current = Some(item);
                return true;
            }
            if self.done {
                return false;
            }
            // Empty pages with a live cursor are normal; keep going.
            self.fetch_page(ctx).await;
            if self.err.is_some() {
                return false;
            }
        }
    }

    /// Element produced by the last successful `next`.
    #[must_use]
    pub fn val(&self) -> Option<&str> {
        self.current.as_deref()
    }

    #[must_use]
    pub fn err(&self) -> Option<&StoreError> {
        self.err.as_ref()
    }

    /// Drain the remaining elements.
    ///
    /// # Errors
    /// Returns the scan's error if any page fetch failed.
    pub async fn collect_all(mut self, ctx: &Context) -> Result<Vec<String>, StoreError> {
        let mut out = Vec::new();
        while self.next(ctx).await {
            if let Some(item) = self.current.take() {
                out.push(item);
            }
        }
        match self.err {
            Some(err) => Err(err),
            None => Ok(out),
        }
    }
}

impl fmt::Debug for ScanIterator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScanIterator")
            .field("request", &self.request)
            .field("buffered", &self.buffer.len())
            .field("done", &self.done)
            .field("err", &self.err)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    /// Serves fixed pages in order and records every request it saw.
    struct FakeFetcher {
        command: ScanCommand,
        pages: Vec<Result<Page, String>>,
        seen: Mutex<Vec<PageRequest>>,
    }

    impl FakeFetcher {
        fn new(command: ScanCommand, pages: Vec<Result<Page, String>>) -> Arc<Self> {
            Arc::new(Self {
                command,
                pages,
                seen: Mutex::new(Vec::new()),
            })
        }

        fn requests(&self) -> Vec<PageRequest> {
            self.seen.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl PageFetcher for FakeFetcher {
        fn command(&self) -> ScanCommand {
            self.command
        }

        async fn fetch(&self, _ctx: &Context, request: &PageRequest) -> Result<Page, StoreError> {
            let mut seen = self.seen.lock().unwrap();
            let idx = seen.len();
            seen.push(request.clone());
            match self.pages.get(idx) {
                Some(Ok(page)) => Ok(page.clone()),
                Some(Err(msg)) => Err(StoreError::Other(msg.clone())),
                None => Err(StoreError::Other("fetched past the last page".into())),
            }
        }
    }

    fn page(cursor: u64, items: &[&str]) -> Result<Page, String> {
        Ok(Page {
            cursor,
            items: items.iter().map(ToString::to_string).collect(),
        })
    }

    #[tokio::test]
    async fn visits_each_key_once() {
        let fetcher = FakeFetcher::new(
            ScanCommand::Keys,
            vec![
                page(7, &["session:a"]),
                page(3, &["session:b"]),
                page(0, &["session:c"]),
            ],
        );
        let scanner = CursorScanner::new(fetcher.clone());
        let ctx = Context::background();

        let mut iter = scanner.scan(&ctx).await;
        assert!(iter.err().is_none());
        let mut seen = Vec::new();
        while iter.next(&ctx).await {
            seen.push(iter.val().unwrap().to_string());
        }
        assert!(iter.err().is_none());
        assert_eq!(seen, ["session:a", "session:b", "session:c"]);
        assert!(iter.val().is_none());

        let cursors: Vec<u64> = fetcher.requests().iter().map(|r| r.cursor).collect();
        assert_eq!(cursors, [0, 7, 3]);
    }

    #[tokio::test]
    async fn with_args_leaves_receiver_untouched() {
        let fetcher = FakeFetcher::new(ScanCommand::Keys, vec![page(0, &[])]);
        let base = CursorScanner::new(fetcher);

        let first = base.with_args(42, "session:*", 10);
        let second = base.with_args(0, "", 0);

        assert_eq!(base.cursor(), 0);
        assert_eq!(base.pattern(), None);
        assert_eq!(base.count(), None);

        assert_eq!(first.cursor(), 42);
        assert_eq!(first.pattern(), Some("session:*"));
        assert_eq!(first.count(), Some(10));

        assert_eq!(second.cursor(), 0);
        assert_eq!(second.pattern(), None);
        assert_eq!(second.count(), None);
    }

    #[tokio::test]
    async fn first_request_carries_scanner_args() {
        let fetcher = FakeFetcher::new(ScanCommand::HashFields, vec![page(0, &["name"])]);
        let scanner = KeyCursorScanner::new(fetcher.clone()).with_args("user:1", 5, "n*", 50);
        let ctx = Context::background();

        let items = scanner.scan(&ctx).await.collect_all(&ctx).await.unwrap();
        assert_eq!(items, ["name"]);
        assert_eq!(
            fetcher.requests(),
            [PageRequest {
                key: Some("user:1".into()),
                cursor: 5,
                pattern: Some("n*".into()),
                count: Some(50),
            }]
        );
    }

    #[tokio::test]
    async fn setup_failure_is_visible_before_next() {
        let fetcher = FakeFetcher::new(ScanCommand::Keys, vec![Err("connection refused".into())]);
        let ctx = Context::background();
        let mut iter = CursorScanner::new(fetcher).scan(&ctx).await;
        assert!(iter.err().is_some());
        assert!(!iter.next(&ctx).await);
        assert!(iter.err().is_some());
    }

    #[tokio::test]
    async fn keyed_scanner_without_key_fails_setup() {
        let fetcher = FakeFetcher::new(ScanCommand::SetMembers, vec![]);
        let ctx = Context::background();
        let iter = KeyCursorScanner::new(fetcher.clone()).scan(&ctx).await;
        assert!(matches!(iter.err(), Some(StoreError::ScanError(_))));
        assert!(fetcher.requests().is_empty());
    }

    #[tokio::test]
    async fn mid_scan_failure_is_sticky() {
        let fetcher = FakeFetcher::new(
            ScanCommand::Keys,
            vec![page(9, &["a", "b"]), Err("io timeout".into())],
        );
        let ctx = Context::background();
        let mut iter = CursorScanner::new(fetcher.clone()).scan(&ctx).await;
        assert!(iter.next(&ctx).await);
        assert!(iter.next(&ctx).await);
        assert!(!iter.next(&ctx).await);
        assert!(iter.err().is_some());
        assert!(!iter.next(&ctx).await);
        assert_eq!(fetcher.requests().len(), 2);
    }

    #[tokio::test]
    async fn skips_empty_pages_until_cursor_wraps() {
        let fetcher = FakeFetcher::new(
            ScanCommand::Keys,
            vec![page(4, &[]), page(8, &[]), page(0, &["only"])],
        );
        let ctx = Context::background();
        let items = CursorScanner::new(fetcher)
            .scan(&ctx)
            .await
            .collect_all(&ctx)
            .await
            .unwrap();
        assert_eq!(items, ["only"]);
    }

    #[tokio::test]
    async fn empty_keyspace_ends_after_one_page() {
        let fetcher = FakeFetcher::new(ScanCommand::Keys, vec![page(0, &[])]);
        let ctx = Context::background();
        let mut iter = CursorScanner::new(fetcher).scan(&ctx).await;
        assert!(!iter.next(&ctx).await);
        assert!(iter.err().is_none());
    }

    #[tokio::test]
    async fn scanners_get_one_fetcher_per_command() {
        let scanners = Scanners::from_fn(|command| {
            FakeFetcher::new(command, vec![page(0, &["x"])]) as Arc<dyn PageFetcher>
        });
        assert_eq!(scanners.keys.command(), ScanCommand::Keys);
        assert_eq!(scanners.set_members.command(), ScanCommand::SetMembers);
        assert_eq!(scanners.hash_fields.command(), ScanCommand::HashFields);
        assert_eq!(
            scanners.sorted_set_members.command(),
            ScanCommand::SortedSetMembers
        );

        let ctx = Context::background();
        let items = scanners.keys.scan(&ctx).await.collect_all(&ctx).await.unwrap();
        assert_eq!(items, ["x"]);
    }

    #[tokio::test]
    async fn plain_scanner_rejects_keyed_command() {
        let fetcher = FakeFetcher::new(ScanCommand::SortedSetMembers, vec![]);
        let ctx = Context::background();
        let iter = CursorScanner::new(fetcher).scan(&ctx).await;
        assert!(matches!(iter.err(), Some(StoreError::ScanError(_))));
    }
}
