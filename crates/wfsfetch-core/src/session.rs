//! The fetch session: paginate, spill under memory pressure, merge.
//!
//! A session is created fresh for every [`get_data`] call and consumed by
//! [`FeatureFetchSession::run`]. Its spill directory is owned by the session,
//! so it is removed whichever way `run` returns.

use std::fmt;
use std::path::Path;

use log::{debug, info, warn};
use wfs_geojson::{Feature, PageResponse};

use crate::columnar::encode_spill_batch;
use crate::dataset::{FetchStats, ResultDataset};
use crate::error::{PaginationError, Result};
use crate::memory::{MemoryPressureMonitor, MemoryProbe, SystemMemoryProbe};
use crate::merge::Merger;
use crate::options::FetchOptions;
use crate::query::{FeatureQuery, PageRequest, QueryExecutor};
use crate::schema::SessionSchema;
use crate::spill::SpillCache;

/// Lifecycle of a [`FeatureFetchSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Init,
    Fetching,
    Spilling,
    Merging,
    Done,
    Failed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Init => "INIT",
            Self::Fetching => "FETCHING",
            Self::Spilling => "SPILLING",
            Self::Merging => "MERGING",
            Self::Done => "DONE",
            Self::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

/// One `get_data` invocation.
pub struct FeatureFetchSession<'a> {
    executor: &'a dyn QueryExecutor,
    query: FeatureQuery,
    options: FetchOptions,
    state: SessionState,
    monitor: MemoryPressureMonitor,
    cache: SpillCache,
    pending: Vec<Feature>,
    cumulative_returned: u64,
    number_matched: u64,
    stats: FetchStats,
}

impl<'a> FeatureFetchSession<'a> {
    /// Create a session sampling system memory.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for invalid options and a spill error if
    /// the session directory cannot be created.
    pub fn new(executor: &'a dyn QueryExecutor, query: FeatureQuery, options: FetchOptions) -> Result<Self> {
        Self::with_probe(executor, query, options, Box::new(SystemMemoryProbe::new()))
    }

    /// Create a session reading memory from `probe`.
    ///
    /// # Errors
    ///
    /// See [`Self::new`].
    pub fn with_probe(
        executor: &'a dyn QueryExecutor,
        query: FeatureQuery,
        options: FetchOptions,
        probe: Box<dyn MemoryProbe>,
    ) -> Result<Self> {
        options.validate()?;
        let cache = SpillCache::create(options.spill_dir.as_deref())?;
        let monitor = MemoryPressureMonitor::new(probe, options.memory);

        Ok(Self {
            executor,
            query,
            options,
            state: SessionState::Init,
            monitor,
            cache,
            pending: Vec::new(),
            cumulative_returned: 0,
            number_matched: 0,
            stats: FetchStats::default(),
        })
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Directory holding this session's spill files.
    #[must_use]
    pub fn spill_dir(&self) -> &Path {
        self.cache.dir()
    }

    /// Fetch every page and assemble the dataset.
    ///
    /// # Errors
    ///
    /// Any transport, decode, schema, pagination, spill or merge failure ends
    /// the session; no partial dataset is returned.
    pub async fn run(mut self) -> Result<ResultDataset> {
        info!("Fetching {}", self.query.dataset);
        match self.drive().await {
            Ok(dataset) => {
                self.transition(SessionState::Done);
                info!("Fetched {}: {}", self.query.dataset, dataset.stats);
                Ok(dataset)
            },
            Err(err) => {
                self.transition(SessionState::Failed);
                warn!("Fetching {} failed: {err}", self.query.dataset);
                Err(err)
            },
        }
    }

    async fn drive(&mut self) -> Result<ResultDataset> {
        self.transition(SessionState::Fetching);

        let first = self.fetch_page().await?;
        let schema = SessionSchema::discover(&first, &self.query, &self.options, self.executor.srs_name());
        schema.validate(&first, 0)?;
        self.number_matched = first.number_matched;
        info!("{} feature(s) match", self.number_matched);

        let mut progressed = self.absorb(first);
        let mut stalled = 0u32;
        let mut page_index = 1usize;

        while self.cumulative_returned < self.number_matched {
            if progressed {
                stalled = 0;
                if self.monitor.under_pressure() {
                    self.spill_pending(&schema)?;
                    self.transition(SessionState::Fetching);
                }
            } else {
                stalled += 1;
                warn!(
                    "Empty page at start index {} of {} matching (attempt {stalled})",
                    self.cumulative_returned, self.number_matched
                );
                if stalled >= self.options.max_stalled_pages {
                    return Err(PaginationError::Stalled {
                        start_index: self.cumulative_returned,
                        attempts: stalled,
                        returned: self.cumulative_returned,
                        matched: self.number_matched,
                    }
                    .into());
                }
            }

            let page = self.fetch_page().await?;
            schema.validate(&page, page_index)?;
            page_index += 1;
            progressed = self.absorb(page);
        }

        if self.cumulative_returned > self.number_matched {
            warn!(
                "Service returned {} feature(s) but reported {} matching",
                self.cumulative_returned, self.number_matched
            );
        }

        self.merge(&schema).await
    }

    async fn fetch_page(&mut self) -> Result<PageResponse> {
        let request = PageRequest {
            start_index: (self.cumulative_returned > 0).then_some(self.cumulative_returned),
            count: Some(self.options.page_size),
        };
        debug!(
            "Requesting page {} of {} (startIndex={})",
            self.stats.pages_fetched + 1,
            self.query.dataset,
            self.cumulative_returned
        );
        let page = self.executor.fetch(&self.query, request).await?;
        self.stats.pages_fetched += 1;
        Ok(page)
    }

    /// Append a page to the pending batch; returns whether it carried features.
    fn absorb(&mut self, page: PageResponse) -> bool {
        let received = page.features.len() as u64;
        if page.number_returned != received {
            debug!(
                "Page reports {} returned but carries {received} feature(s)",
                page.number_returned
            );
        }
        if page.number_matched != self.number_matched {
            warn!(
                "Page reports {} matching feature(s); keeping {}",
                page.number_matched, self.number_matched
            );
        }

        self.cumulative_returned += received;
        self.pending.extend(page.features);
        debug!(
            "{} of {} feature(s) received, {} pending",
            self.cumulative_returned,
            self.number_matched,
            self.pending.len()
        );
        received > 0
    }

    fn spill_pending(&mut self, schema: &SessionSchema) -> Result<()> {
        self.transition(SessionState::Spilling);

        let encoded = encode_spill_batch(schema, &self.pending)?;
        self.stats.rejected_rows += encoded.rejected;
        self.stats.coerced_values += encoded.coerced;
        self.cache.spill(&encoded.batch)?;
        self.pending.clear();
        self.monitor.rebaseline();
        Ok(())
    }

    async fn merge(&mut self, schema: &SessionSchema) -> Result<ResultDataset> {
        self.transition(SessionState::Merging);

        let merged = if self.cache.is_empty() {
            Merger::new(schema).merge_in_memory(&self.pending)?
        } else {
            if !self.pending.is_empty() {
                self.spill_pending(schema)?;
                self.transition(SessionState::Merging);
            }
            Merger::new(schema).merge_spilled(self.cache.files()).await?
        };
        self.pending.clear();

        self.stats.rejected_rows += merged.rejected;
        self.stats.coerced_values += merged.coerced;
        self.stats.spill_files = self.cache.len();
        self.stats.rows = merged.batch.num_rows();

        let delivered = u64::try_from(self.stats.rows + self.stats.rejected_rows).unwrap_or(u64::MAX);
        if delivered != self.number_matched {
            warn!(
                "Dataset has {} row(s) ({} rejected) but the service reported {}",
                self.stats.rows, self.stats.rejected_rows, self.number_matched
            );
        }

        Ok(ResultDataset {
            batch: merged.batch,
            geometry_column: schema.geometry_column().to_string(),
            crs: schema.crs().to_string(),
            stats: self.stats,
        })
    }

    fn transition(&mut self, next: SessionState) {
        debug!("Session {} -> {next}", self.state);
        self.state = next;
    }
}

/// Fetch every feature matching `query` into one dataset.
///
/// # Errors
///
/// See [`FeatureFetchSession::run`].
pub async fn get_data(
    executor: &dyn QueryExecutor,
    query: FeatureQuery,
    options: FetchOptions,
) -> Result<ResultDataset> {
    FeatureFetchSession::new(executor, query, options)?.run().await
}

/// [`get_data`] with an explicit memory probe.
///
/// # Errors
///
/// See [`FeatureFetchSession::run`].
pub async fn get_data_with_probe(
    executor: &dyn QueryExecutor,
    query: FeatureQuery,
    options: FetchOptions,
    probe: Box<dyn MemoryProbe>,
) -> Result<ResultDataset> {
    FeatureFetchSession::with_probe(executor, query, options, probe)?
        .run()
        .await
}
