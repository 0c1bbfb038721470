//! Snapshot sources
//!
//! A source produces one fresh snapshot per tick. The poller makes no
//! assumption about how long a fetch takes or what it talks to.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::BoxError;

/// Trait for anything that can fetch the next snapshot
#[async_trait]
pub trait SnapshotSource<T>: Send + Sync {
    /// Fetch a fresh snapshot
    async fn fetch(&self) -> Result<T, BoxError>;
}

/// Adapts an async closure into a [`SnapshotSource`]
pub(crate) struct FnSource<F> {
    request: F,
}

impl<F> FnSource<F> {
    pub(crate) fn new(request: F) -> Self {
        Self { request }
    }
}

#[async_trait]
impl<T, F, Fut, E> SnapshotSource<T> for FnSource<F>
where
    T: Send + 'static,
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<T, E>> + Send,
    E: Into<BoxError>,
{
    async fn fetch(&self) -> Result<T, BoxError> {
        (self.request)().await.map_err(Into::into)
    }
}

/// Wraps a source so that failed fetches yield a fallback snapshot instead
///
/// This is how views keep their poller ticking through backend hiccups:
/// a failed count request reads as "nothing pending" rather than a gap.
pub struct FallbackSource<T> {
    inner: Arc<dyn SnapshotSource<T>>,
    fallback: T,
}

impl<T> FallbackSource<T> {
    pub fn new(inner: Arc<dyn SnapshotSource<T>>, fallback: T) -> Self {
        Self { inner, fallback }
    }
}

#[async_trait]
impl<T> SnapshotSource<T> for FallbackSource<T>
where
    T: Clone + Send + Sync + 'static,
{
    async fn fetch(&self) -> Result<T, BoxError> {
        match self.inner.fetch().await {
            Ok(snapshot) => Ok(snapshot),
            Err(e) => {
                tracing::warn!("Snapshot request failed, using fallback: {}", e);
                Ok(self.fallback.clone())
            }
        }
    }
}

/// Convenience constructor for [`FallbackSource`]
pub fn with_fallback<T>(inner: Arc<dyn SnapshotSource<T>>, fallback: T) -> Arc<dyn SnapshotSource<T>>
where
    T: Clone + Send + Sync + 'static,
{
    Arc::new(FallbackSource::new(inner, fallback))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FlakySource {
        calls: AtomicU32,
    }

    #[async_trait]
    impl SnapshotSource<u32> for FlakySource {
        async fn fetch(&self) -> Result<u32, BoxError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call % 2 == 1 {
                Err("backend unavailable".into())
            } else {
                Ok(call)
            }
        }
    }

    #[tokio::test]
    async fn test_closure_source() {
        let source = FnSource::new(|| async { Ok::<_, std::io::Error>(12_u32) });
        assert_eq!(SnapshotSource::<u32>::fetch(&source).await.unwrap(), 12);
    }

    #[tokio::test]
    async fn test_closure_source_error() {
        let source = FnSource::new(|| async {
            Err::<u32, _>(std::io::Error::new(std::io::ErrorKind::TimedOut, "timeout"))
        });
        let err = SnapshotSource::<u32>::fetch(&source).await.unwrap_err();
        assert_eq!(err.to_string(), "timeout");
    }

    #[tokio::test]
    async fn test_fallback_replaces_failures() {
        let inner: Arc<dyn SnapshotSource<u32>> = Arc::new(FlakySource {
            calls: AtomicU32::new(0),
        });
        let source = with_fallback(inner, 99);

        assert_eq!(source.fetch().await.unwrap(), 0);
        assert_eq!(source.fetch().await.unwrap(), 99);
        assert_eq!(source.fetch().await.unwrap(), 2);
    }
}
