//! Rate-limited store wrapper.

use std::num::NonZeroU32;

use async_trait::async_trait;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};

use super::DocumentStore;
use crate::error::{ReconcileError, Result};
use crate::record::{Cursor, FieldUpdate, Fields, Page, ProbeFilter, Record};

/// Admits calls to the inner store at no more than a fixed rate.
///
/// The engine's fixed page/unit delays only space out units of work. This
/// wrapper bounds every individual call, including the probes and target
/// creations inside a unit.
pub struct RateLimitedStore<S> {
    inner: S,
    limiter: DefaultDirectRateLimiter,
}

impl<S: DocumentStore> RateLimitedStore<S> {
    /// Allow at most `calls_per_second` store calls per second.
    pub fn per_second(inner: S, calls_per_second: u32) -> Result<Self> {
        let rate = NonZeroU32::new(calls_per_second).ok_or_else(|| ReconcileError::Config {
            message: "calls_per_second must be greater than zero".into(),
        })?;
        Ok(Self {
            inner,
            limiter: RateLimiter::direct(Quota::per_second(rate)),
        })
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }
}

#[async_trait]
impl<S: DocumentStore> DocumentStore for RateLimitedStore<S> {
    async fn scan_page(
        &self,
        collection: &str,
        page_size: usize,
        cursor: Option<&Cursor>,
    ) -> Result<Page> {
        self.limiter.until_ready().await;
        self.inner.scan_page(collection, page_size, cursor).await
    }

    async fn probe_one(&self, collection: &str, filter: &ProbeFilter) -> Result<Option<Record>> {
        self.limiter.until_ready().await;
        self.inner.probe_one(collection, filter).await
    }

    async fn create_record(&self, collection: &str, fields: Fields) -> Result<String> {
        self.limiter.until_ready().await;
        self.inner.create_record(collection, fields).await
    }

    async fn commit_batch(&self, updates: &[FieldUpdate]) -> Result<()> {
        self.limiter.until_ready().await;
        self.inner.commit_batch(updates).await
    }

    fn max_batch_size(&self) -> usize {
        self.inner.max_batch_size()
    }
}
