//! src/dataloader/iterator/single.rs
//!
//! Synchronous iteration (`num_workers = 0`): samples are fetched, collated
//! and pinned in the calling thread.
//!
//! The calling thread's RNG is seeded like worker 0's, but
//! [`worker_info`](crate::dataloader::worker_info) stays `None`.

use super::{IndexPlan, IteratorConfig};
use crate::dataloader::common::thread::init_worker_rng;
use crate::dataloader::pin::PinMemory;
use crate::dataloader::shutdown::ShutdownToken;
use crate::dataloader::workers::fetch::{FetchRequest, Fetcher};
use anyhow::{Context, Result};
use std::sync::Arc;

pub(crate) struct SingleProcessIter<B> {
    plan: IndexPlan,
    fetcher: Box<dyn Fetcher<B>>,
    pinner: Option<Arc<dyn PinMemory<B>>>,
    token: ShutdownToken,
}

impl<B> SingleProcessIter<B> {
    pub(crate) fn new(config: IteratorConfig<B>) -> Result<Self> {
        init_worker_rng(0, config.epoch, config.runtime_seed);
        let fetcher = config
            .factory
            .create(config.batching)
            .context("Failed to prepare the dataset for single-threaded loading")?;

        Ok(Self {
            plan: config.plan,
            fetcher,
            pinner: config.pinner,
            token: ShutdownToken::new(),
        })
    }

    pub(crate) fn token(&self) -> &ShutdownToken {
        &self.token
    }

    pub(crate) fn close(&mut self) {
        self.token.begin_shutdown();
        self.plan = IndexPlan::Done;
        self.token.mark_terminated();
    }

    fn next_request(&mut self) -> Option<FetchRequest> {
        match &mut self.plan {
            IndexPlan::Indexed(batches) => batches.next().map(FetchRequest::Indices),
            IndexPlan::Stream => Some(FetchRequest::Next),
            IndexPlan::Done => None,
        }
    }

    fn load(&mut self, request: FetchRequest) -> Result<Option<B>> {
        let batch = match self.fetcher.fetch(request) {
            Ok(Some(batch)) => batch,
            Ok(None) => return Ok(None),
            Err(e) => return Err(e.error),
        };
        match &self.pinner {
            Some(pinner) => pinner.pin(batch).map(Some).context("Failed to pin batch"),
            None => Ok(Some(batch)),
        }
    }
}

impl<B> Iterator for SingleProcessIter<B> {
    type Item = Result<B>;

    fn next(&mut self) -> Option<Self::Item> {
        if !self.token.is_running() {
            return None;
        }
        let Some(request) = self.next_request() else {
            self.close();
            return None;
        };

        match self.load(request) {
            Ok(Some(batch)) => Some(Ok(batch)),
            Ok(None) => {
                self.close();
                None
            }
            Err(e) => {
                // an error ends the pass, as it does with workers
                self.close();
                Some(Err(e))
            }
        }
    }
}
