//! Result virtualizer
//!
//! A `ResultSet` turns a statement's row stream into random-access windows.
//! Two sources back it:
//!
//! - **Buffered**: every delivered batch is kept, oldest-used batches spill
//!   to an anonymous temp file once `max_buffered_rows` is exceeded and are
//!   read back on demand.
//! - **Paged**: single pageable queries on backends with `LIMIT/OFFSET`
//!   support. The statement itself returns page 0; later pages are
//!   re-queried under the session's execution lock and kept in a small LRU.
//!
//! Requests past what has arrived wait for the stream instead of failing.
//! `RowCursor` is the forward-only reader used by exports.

use crate::config::Settings;
use crate::db::provider::{StreamEvent, collect_partial};
use crate::db::{ColumnDef, Row};
use crate::engine::{PagePlan, Statement, StatementStatus};
use crate::error::{Result, StatementError, StatementResult, VizdbError};
use crate::fuzzy::fuzzy_match;
use crate::session::Session;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::AbortHandle;

/// A slice of a result set
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultWindow {
    /// Offset of the first row (in the filtered sequence for filtered windows)
    pub offset: usize,
    pub columns: Vec<ColumnDef>,
    pub rows: Vec<Row>,
    /// Position of each row in the unfiltered result
    pub positions: Vec<usize>,
    /// Rows (or matches) known so far
    pub total_known: usize,
    /// Nothing exists past this window
    pub exhausted: bool,
    /// Why the stream or a page fetch failed; rows before it are still served
    pub error: Option<StatementError>,
}

/// Row predicate for `filtered_window`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowFilter {
    /// Case-insensitive substring of any cell
    Substring(String),
    /// Characters of the pattern appear in order within one cell
    Fuzzy(String),
}

impl RowFilter {
    fn matches(&self, row: &Row) -> bool {
        match self {
            RowFilter::Substring(needle) => row.contains_lowercase(&needle.to_lowercase()),
            RowFilter::Fuzzy(pattern) => row
                .values
                .iter()
                .any(|v| fuzzy_match(pattern, &v.export_string()).is_some()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VirtualizerOptions {
    pub max_buffered_rows: usize,
    pub page_cache: usize,
}

impl Default for VirtualizerOptions {
    fn default() -> Self {
        Self {
            max_buffered_rows: 100_000,
            page_cache: 16,
        }
    }
}

impl From<&Settings> for VirtualizerOptions {
    fn from(settings: &Settings) -> Self {
        Self {
            max_buffered_rows: settings.limits.max_buffered_rows,
            page_cache: settings.limits.page_cache,
        }
    }
}

// --- buffered storage ---

struct Batch {
    start: usize,
    len: usize,
    rows: Option<Arc<Vec<Row>>>,
    /// Byte range in the spill file, once written
    spilled: Option<(u64, u64)>,
    pins: usize,
    last_used: u64,
}

struct SpillFile {
    file: File,
    end: u64,
}

struct BatchStore {
    batches: Vec<Batch>,
    total: usize,
    resident: usize,
    max_resident: usize,
    tick: u64,
    spill: Option<SpillFile>,
}

impl BatchStore {
    fn new(max_resident: usize) -> Self {
        Self {
            batches: Vec::new(),
            total: 0,
            resident: 0,
            max_resident: max_resident.max(1),
            tick: 0,
            spill: None,
        }
    }

    fn append(&mut self, rows: Vec<Row>) {
        if rows.is_empty() {
            return;
        }
        self.tick += 1;
        let len = rows.len();
        self.batches.push(Batch {
            start: self.total,
            len,
            rows: Some(Arc::new(rows)),
            spilled: None,
            pins: 0,
            last_used: self.tick,
        });
        self.total += len;
        self.resident += len;
        self.evict();
    }

    /// Spill least recently used, unpinned batches until under the ceiling
    fn evict(&mut self) {
        while self.resident > self.max_resident {
            let victim = self
                .batches
                .iter()
                .enumerate()
                .filter(|(_, b)| b.rows.is_some() && b.pins == 0)
                .min_by_key(|(_, b)| b.last_used)
                .map(|(idx, _)| idx);
            let Some(idx) = victim else { break };
            if let Err(e) = self.spill_batch(idx) {
                // Keep it resident rather than lose rows
                tracing::warn!(error = %e, "spilling result batch failed");
                break;
            }
        }
    }

    fn spill_batch(&mut self, idx: usize) -> std::io::Result<()> {
        let batch = &self.batches[idx];
        if batch.spilled.is_none() {
            let Some(rows) = &batch.rows else {
                return Ok(());
            };
            let bytes = bincode::serialize(rows.as_slice()).map_err(std::io::Error::other)?;
            if self.spill.is_none() {
                self.spill = Some(SpillFile {
                    file: tempfile::tempfile()?,
                    end: 0,
                });
            }
            let Some(spill) = self.spill.as_mut() else {
                return Ok(());
            };
            spill.file.seek(SeekFrom::Start(spill.end))?;
            spill.file.write_all(&bytes)?;
            let range = (spill.end, bytes.len() as u64);
            spill.end += bytes.len() as u64;
            self.batches[idx].spilled = Some(range);
        }
        let batch = &mut self.batches[idx];
        batch.rows = None;
        self.resident -= batch.len;
        tracing::trace!(start = batch.start, len = batch.len, "spilled batch");
        Ok(())
    }

    fn load(&mut self, idx: usize) -> std::io::Result<Arc<Vec<Row>>> {
        self.tick += 1;
        self.batches[idx].last_used = self.tick;
        if let Some(rows) = &self.batches[idx].rows {
            return Ok(rows.clone());
        }
        let (offset, len) = self.batches[idx]
            .spilled
            .ok_or_else(|| std::io::Error::other("batch is neither resident nor spilled"))?;
        let spill = self
            .spill
            .as_mut()
            .ok_or_else(|| std::io::Error::other("spill file missing"))?;
        let mut bytes = vec![0u8; len as usize];
        spill.file.seek(SeekFrom::Start(offset))?;
        spill.file.read_exact(&mut bytes)?;
        let rows: Vec<Row> = bincode::deserialize(&bytes).map_err(std::io::Error::other)?;
        let rows = Arc::new(rows);
        let batch = &mut self.batches[idx];
        batch.rows = Some(rows.clone());
        self.resident += batch.len;
        self.evict();
        Ok(rows)
    }

    /// Copy rows `[offset, offset + count)` that exist
    fn read(&mut self, offset: usize, count: usize) -> std::io::Result<Vec<Row>> {
        let end = (offset + count).min(self.total);
        if offset >= end {
            return Ok(Vec::new());
        }
        let first = self.batches.partition_point(|b| b.start + b.len <= offset);
        let last = self.batches.partition_point(|b| b.start < end);
        let span = first..last;

        for b in &mut self.batches[span.clone()] {
            b.pins += 1;
        }
        let mut out = Vec::with_capacity(end - offset);
        let mut failure = None;
        for idx in span.clone() {
            match self.load(idx) {
                Ok(rows) => {
                    let start = self.batches[idx].start;
                    let from = offset.saturating_sub(start);
                    let to = (end - start).min(rows.len());
                    out.extend_from_slice(&rows[from..to]);
                }
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }
        for b in &mut self.batches[span] {
            b.pins -= 1;
        }
        self.evict();
        match failure {
            Some(e) => Err(e),
            None => Ok(out),
        }
    }
}

// --- paged storage ---

struct PageCache {
    capacity: usize,
    /// Most recently used last
    pages: Vec<(usize, Arc<Vec<Row>>)>,
}

impl PageCache {
    fn get(&mut self, page: usize) -> Option<Arc<Vec<Row>>> {
        let pos = self.pages.iter().position(|(p, _)| *p == page)?;
        let entry = self.pages.remove(pos);
        let rows = entry.1.clone();
        self.pages.push(entry);
        Some(rows)
    }

    fn insert(&mut self, page: usize, rows: Arc<Vec<Row>>) {
        self.pages.retain(|(p, _)| *p != page);
        if self.pages.len() >= self.capacity {
            self.pages.remove(0);
        }
        self.pages.push((page, rows));
    }
}

struct PagedSource {
    session: Arc<Session>,
    plan: PagePlan,
    cache: parking_lot::Mutex<PageCache>,
    /// Highest row count seen and whether the last page was reached
    extent: parking_lot::Mutex<(usize, bool)>,
    /// Error of a page that broke off part-way; its rows are cached
    failure: parking_lot::Mutex<Option<StatementError>>,
    fetching: tokio::sync::Mutex<()>,
}

// --- shared state ---

struct State {
    columns: Vec<ColumnDef>,
    store: BatchStore,
    ended: bool,
    status: StatementStatus,
    error: Option<StatementError>,
}

struct Shared {
    state: parking_lot::Mutex<State>,
    progress: watch::Sender<u64>,
}

impl Shared {
    fn bump(&self) {
        self.progress.send_modify(|v| *v += 1);
    }
}

struct FilterCache {
    filter: RowFilter,
    /// Absolute positions of matches found so far
    matches: Vec<usize>,
    /// Rows examined so far
    scanned: usize,
    done: bool,
    error: Option<StatementError>,
}

struct PumpGuard(AbortHandle);

impl Drop for PumpGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Random-access view over one statement's rows
#[derive(Clone)]
pub struct ResultSet {
    shared: Arc<Shared>,
    paged: Option<Arc<PagedSource>>,
    filter: Arc<tokio::sync::Mutex<Option<FilterCache>>>,
    _pump: Arc<PumpGuard>,
}

/// Rows read per step while scanning for filter matches
const SCAN_CHUNK: usize = 1024;

struct Fetched {
    rows: Vec<Row>,
    total_known: usize,
    exhausted: bool,
    error: Option<StatementError>,
}

impl ResultSet {
    /// Take over `statement`'s row stream
    pub fn open(statement: &mut Statement, options: VirtualizerOptions) -> Result<Self> {
        let events = statement.take_events().ok_or_else(|| {
            VizdbError::Statement(StatementError::driver("statement rows were already taken"))
        })?;
        let paged = statement.paging().cloned().map(|plan| {
            Arc::new(PagedSource {
                session: statement.session().clone(),
                plan,
                cache: parking_lot::Mutex::new(PageCache {
                    capacity: options.page_cache.max(1),
                    pages: Vec::new(),
                }),
                extent: parking_lot::Mutex::new((0, false)),
                failure: parking_lot::Mutex::new(None),
                fetching: tokio::sync::Mutex::new(()),
            })
        });

        let (progress, _) = watch::channel(0u64);
        let shared = Arc::new(Shared {
            state: parking_lot::Mutex::new(State {
                columns: Vec::new(),
                store: BatchStore::new(options.max_buffered_rows),
                ended: false,
                status: statement.status(),
                error: None,
            }),
            progress,
        });
        let pump = tokio::spawn(pump(shared.clone(), events, statement.watch()));
        Ok(Self {
            shared,
            paged,
            filter: Arc::new(tokio::sync::Mutex::new(None)),
            _pump: Arc::new(PumpGuard(pump.abort_handle())),
        })
    }

    pub fn columns(&self) -> Vec<ColumnDef> {
        self.shared.state.lock().columns.clone()
    }

    /// Last status seen by the stream reader
    pub fn status(&self) -> StatementStatus {
        self.shared.state.lock().status.clone()
    }

    pub fn is_paged(&self) -> bool {
        self.paged.is_some()
    }

    /// Rows known so far
    pub fn known_rows(&self) -> usize {
        let buffered = self.shared.state.lock().store.total;
        match &self.paged {
            Some(src) => src.extent.lock().0.max(buffered),
            None => buffered,
        }
    }

    /// Wait until the stream has ended
    pub async fn finished(&self) -> StatementStatus {
        let mut progress = self.shared.progress.subscribe();
        loop {
            {
                let state = self.shared.state.lock();
                if state.ended {
                    return state.status.clone();
                }
            }
            if progress.changed().await.is_err() {
                return self.status();
            }
        }
    }

    /// Rows `[offset, offset + count)`, waiting until they arrive or the
    /// stream ends
    pub async fn window(&self, offset: usize, count: usize) -> ResultWindow {
        let fetched = self.fetch(offset, count).await;
        ResultWindow {
            offset,
            columns: self.columns(),
            positions: (offset..offset + fetched.rows.len()).collect(),
            rows: fetched.rows,
            total_known: fetched.total_known,
            exhausted: fetched.exhausted,
            error: fetched.error,
        }
    }

    /// Like `window`, over the rows matching `filter`
    ///
    /// Scans forward only until `offset + count` matches are known (or the
    /// rows run out); matches found earlier are remembered per filter.
    pub async fn filtered_window(
        &self,
        filter: &RowFilter,
        offset: usize,
        count: usize,
    ) -> ResultWindow {
        let mut guard = self.filter.lock().await;
        if guard.as_ref().is_none_or(|c| &c.filter != filter) {
            *guard = Some(FilterCache {
                filter: filter.clone(),
                matches: Vec::new(),
                scanned: 0,
                done: false,
                error: None,
            });
        }
        let Some(cache) = guard.as_mut() else {
            return ResultWindow::default();
        };

        while cache.matches.len() < offset + count && !cache.done {
            let chunk = self.fetch(cache.scanned, SCAN_CHUNK).await;
            for (i, row) in chunk.rows.iter().enumerate() {
                if cache.filter.matches(row) {
                    cache.matches.push(cache.scanned + i);
                }
            }
            cache.scanned += chunk.rows.len();
            if chunk.error.is_some() {
                cache.error = chunk.error;
            }
            // A failed stream still has rows worth scanning up to where it broke
            if chunk.exhausted || chunk.rows.is_empty() {
                cache.done = true;
            }
        }

        let end = (offset + count).min(cache.matches.len());
        let positions: Vec<usize> = cache.matches.get(offset..end).unwrap_or_default().to_vec();
        let mut rows = Vec::with_capacity(positions.len());
        for &pos in &positions {
            let mut one = self.fetch(pos, 1).await;
            rows.append(&mut one.rows);
        }
        ResultWindow {
            offset,
            columns: self.columns(),
            rows,
            positions,
            total_known: cache.matches.len(),
            exhausted: cache.done && end >= cache.matches.len(),
            error: cache.error.clone(),
        }
    }

    async fn fetch(&self, offset: usize, count: usize) -> Fetched {
        match &self.paged {
            Some(src) => self.fetch_paged(src, offset, count).await,
            None => self.fetch_buffered(offset, count).await,
        }
    }

    async fn fetch_buffered(&self, offset: usize, count: usize) -> Fetched {
        let mut progress = self.shared.progress.subscribe();
        loop {
            {
                let mut state = self.shared.state.lock();
                let available = state.store.total;
                if available >= offset + count || state.ended {
                    return match state.store.read(offset, count) {
                        Ok(rows) => Fetched {
                            exhausted: state.ended && offset + rows.len() >= available,
                            rows,
                            total_known: available,
                            error: state.error.clone(),
                        },
                        Err(e) => Fetched {
                            rows: Vec::new(),
                            total_known: available,
                            exhausted: false,
                            error: Some(StatementError::driver(format!(
                                "reading spilled rows failed: {}",
                                e
                            ))),
                        },
                    };
                }
            }
            if progress.changed().await.is_err() {
                return Fetched {
                    rows: Vec::new(),
                    total_known: 0,
                    exhausted: true,
                    error: None,
                };
            }
        }
    }

    async fn fetch_paged(&self, src: &PagedSource, offset: usize, count: usize) -> Fetched {
        // Page 0 is the statement's own stream
        self.finished().await;
        let (first_page_rows, stream_error) = {
            let state = self.shared.state.lock();
            (state.store.total, state.error.clone())
        };
        let size = src.plan.page_size.max(1);
        {
            let mut extent = src.extent.lock();
            extent.0 = extent.0.max(first_page_rows);
            if first_page_rows < size {
                extent.1 = true;
            }
        }
        if let Some(error) = stream_error {
            // Page 0 broke off; what arrived is all there is
            src.extent.lock().1 = true;
            let rows = self
                .shared
                .state
                .lock()
                .store
                .read(offset, count)
                .unwrap_or_default();
            return Fetched {
                exhausted: offset + rows.len() >= first_page_rows,
                rows,
                total_known: first_page_rows,
                error: Some(error),
            };
        }
        if count == 0 {
            return Fetched {
                rows: Vec::new(),
                total_known: first_page_rows,
                exhausted: src.extent.lock().1,
                error: None,
            };
        }

        let end = offset + count;
        let mut rows = Vec::with_capacity(count);
        let mut error = None;
        for page in offset / size..=(end - 1) / size {
            let page_rows = match self.page(src, page).await {
                Ok(rows) => rows,
                Err(e) => {
                    error = Some(e);
                    break;
                }
            };
            let page_start = page * size;
            let from = offset.saturating_sub(page_start).min(page_rows.len());
            let to = (end - page_start).min(page_rows.len());
            rows.extend_from_slice(&page_rows[from..to]);
            if page_rows.len() < size {
                break;
            }
        }
        let (known, last_seen) = *src.extent.lock();
        Fetched {
            exhausted: error.is_none() && last_seen && offset + rows.len() >= known,
            rows,
            total_known: known,
            error: error.or_else(|| src.failure.lock().clone()),
        }
    }

    async fn page(&self, src: &PagedSource, page: usize) -> StatementResult<Arc<Vec<Row>>> {
        let size = src.plan.page_size.max(1);
        if page == 0 {
            let rows = self
                .shared
                .state
                .lock()
                .store
                .read(0, size)
                .map_err(|e| StatementError::driver(format!("reading page failed: {}", e)))?;
            return Ok(Arc::new(rows));
        }
        if let Some(rows) = src.cache.lock().get(page) {
            return Ok(rows);
        }
        // Past the known last page there is nothing to fetch
        {
            let (known, last_seen) = *src.extent.lock();
            if last_seen && page * size >= known {
                return Ok(Arc::new(Vec::new()));
            }
        }

        let _fetching = src.fetching.lock().await;
        if let Some(rows) = src.cache.lock().get(page) {
            return Ok(rows);
        }
        let descriptor = src.session.descriptor();
        let sql = descriptor
            .paginate_sql(&src.plan.sql, size, page * size)
            .ok_or_else(|| StatementError::driver("backend does not paginate"))?;
        src.session
            .check_usable()
            .map_err(|e| StatementError::ConnectivityLost(e.to_string()))?;
        tracing::debug!(page, session = %src.session.id(), "fetching page");

        let exec_lock = src.session.exec_lock();
        let _exec = exec_lock.lock().await;
        let conn = src.session.connection();
        let (_, rows, outcome) = collect_partial(conn.as_ref(), &sql).await;
        let failure = outcome.err();
        if let Some(e) = &failure {
            if e.is_connectivity_lost() {
                src.session.invalidate(e.to_string());
            }
            tracing::debug!(page, rows = rows.len(), error = %e, "page fetch failed");
        }
        if let Some(e) = failure.clone().filter(|_| rows.is_empty()) {
            // Nothing to keep; a later request may try again
            return Err(e);
        }
        {
            let mut extent = src.extent.lock();
            extent.0 = extent.0.max(page * size + rows.len());
            // A partial page ends the result as far as it can be read
            if rows.len() < size || failure.is_some() {
                extent.1 = true;
            }
        }
        if let Some(e) = failure {
            *src.failure.lock() = Some(e);
        }
        let rows = Arc::new(rows);
        src.cache.lock().insert(page, rows.clone());
        Ok(rows)
    }
}

/// Move the row stream into the store, then record the terminal status
async fn pump(
    shared: Arc<Shared>,
    mut events: mpsc::Receiver<StreamEvent>,
    mut status: watch::Receiver<StatementStatus>,
) {
    while let Some(event) = events.recv().await {
        {
            let mut state = shared.state.lock();
            match event {
                StreamEvent::Columns(columns) => state.columns = columns,
                StreamEvent::Batch(rows) => state.store.append(rows),
            }
        }
        shared.bump();
    }
    let mut terminal = None;
    if let Ok(done) = status.wait_for(StatementStatus::is_terminal).await {
        terminal = Some(done.clone());
    }
    let terminal = terminal.unwrap_or_else(|| status.borrow().clone());
    {
        let mut state = shared.state.lock();
        if let StatementStatus::Failed(e) = &terminal {
            state.error = Some(e.clone());
        }
        state.status = terminal;
        state.ended = true;
    }
    shared.bump();
}

/// Forward-only reader: each batch is handed out once and not kept
pub struct RowCursor {
    events: mpsc::Receiver<StreamEvent>,
    status: watch::Receiver<StatementStatus>,
    columns: Option<Vec<ColumnDef>>,
    pending: Option<Vec<Row>>,
}

impl RowCursor {
    pub fn open(statement: &mut Statement) -> Result<Self> {
        let events = statement.take_events().ok_or_else(|| {
            VizdbError::Statement(StatementError::driver("statement rows were already taken"))
        })?;
        Ok(Self {
            events,
            status: statement.watch(),
            columns: None,
            pending: None,
        })
    }

    /// Column metadata; empty for statements that return no rows
    pub async fn columns(&mut self) -> Vec<ColumnDef> {
        while self.columns.is_none() {
            match self.events.recv().await {
                Some(StreamEvent::Columns(columns)) => self.columns = Some(columns),
                Some(StreamEvent::Batch(rows)) => {
                    self.pending = Some(rows);
                    self.columns = Some(Vec::new());
                }
                None => self.columns = Some(Vec::new()),
            }
        }
        self.columns.clone().unwrap_or_default()
    }

    pub async fn next_batch(&mut self) -> Option<Vec<Row>> {
        if let Some(rows) = self.pending.take() {
            return Some(rows);
        }
        loop {
            match self.events.recv().await? {
                StreamEvent::Columns(columns) => self.columns = Some(columns),
                StreamEvent::Batch(rows) => return Some(rows),
            }
        }
    }

    /// Drop remaining rows and wait for the terminal status
    pub async fn finish(mut self) -> StatementStatus {
        self.events.close();
        if let Ok(done) = self.status.wait_for(StatementStatus::is_terminal).await {
            return done.clone();
        }
        self.status.borrow().clone()
    }
}
