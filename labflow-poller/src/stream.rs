//! Subscriber handles for consuming snapshots
//!
//! A [`SnapshotStream`] receives every snapshot its poller publishes, in
//! publication order. Several streams may observe the same poller; each one
//! buffers independently. A subscriber that falls more than `buffer_size`
//! snapshots behind skips the overwritten ones and carries on with the
//! oldest snapshot still buffered.

use std::sync::Arc;
use std::time::Duration;

use futures::Stream;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::sync::{broadcast, watch};
use tokio::time::timeout;

use crate::error::{PollingError, PollingResult};

/// Stream of snapshots published by one poller
pub struct SnapshotStream<T> {
    /// Fan-out receiver fed by the polling task
    receiver: broadcast::Receiver<T>,

    /// Set once the poller is stopped
    stopped: watch::Receiver<bool>,

    /// Poller label, for log lines
    label: Arc<str>,

    /// Snapshots delivered to the consumer
    received: u64,

    /// Snapshots skipped because this subscriber fell behind
    lagged: u64,

    /// Whether the stream has ended
    finished: bool,
}

impl<T: Clone> SnapshotStream<T> {
    pub(crate) fn new(
        receiver: broadcast::Receiver<T>,
        stopped: watch::Receiver<bool>,
        label: Arc<str>,
    ) -> Self {
        Self {
            receiver,
            stopped,
            label,
            received: 0,
            lagged: 0,
            finished: false,
        }
    }

    /// Wait for the next snapshot
    ///
    /// Returns `None` once the poller has stopped and every snapshot
    /// published before the stop has been delivered.
    pub async fn next_async(&mut self) -> Option<T> {
        loop {
            if self.finished {
                return None;
            }

            let received = tokio::select! {
                biased;
                received = self.receiver.recv() => Some(received),
                _ = self.stopped.wait_for(|stopped| *stopped) => None,
            };

            match received {
                Some(Ok(snapshot)) => return Some(self.deliver(snapshot)),
                Some(Err(RecvError::Lagged(skipped))) => self.record_lag(skipped),
                Some(Err(RecvError::Closed)) => self.finished = true,
                None => return self.drain(),
            }
        }
    }

    /// Wait for the next snapshot, giving up after `timeout_duration`
    pub async fn next_timeout(&mut self, timeout_duration: Duration) -> PollingResult<Option<T>> {
        timeout(timeout_duration, self.next_async())
            .await
            .map_err(|_| PollingError::Timeout)
    }

    /// Take a buffered snapshot without waiting
    pub fn try_next(&mut self) -> Option<T> {
        if self.finished {
            return None;
        }

        loop {
            match self.receiver.try_recv() {
                Ok(snapshot) => return Some(self.deliver(snapshot)),
                Err(TryRecvError::Lagged(skipped)) => self.record_lag(skipped),
                Err(TryRecvError::Empty) => {
                    if *self.stopped.borrow() {
                        self.finished = true;
                    }
                    return None;
                }
                Err(TryRecvError::Closed) => {
                    self.finished = true;
                    return None;
                }
            }
        }
    }

    /// Blocking iterator for consumers on plain threads
    ///
    /// Must not be used from within an async context.
    pub fn iter(&mut self) -> BlockingSnapshots<'_, T> {
        BlockingSnapshots { inner: self }
    }

    /// Convert into a [`futures::Stream`]
    pub fn into_stream(self) -> impl Stream<Item = T> + Send + 'static
    where
        T: Send + 'static,
    {
        futures::stream::unfold(self, |mut snapshots| async move {
            let snapshot = snapshots.next_async().await?;
            Some((snapshot, snapshots))
        })
    }

    /// Snapshots delivered so far
    pub fn received(&self) -> u64 {
        self.received
    }

    /// Snapshots skipped because this subscriber fell behind
    pub fn lagged(&self) -> u64 {
        self.lagged
    }

    /// Whether the stream has ended
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    fn blocking_next(&mut self) -> Option<T> {
        loop {
            if self.finished {
                return None;
            }
            if *self.stopped.borrow() {
                return self.drain();
            }

            // The polling task drops its sender when it exits, which ends this wait
            match self.receiver.blocking_recv() {
                Ok(snapshot) => return Some(self.deliver(snapshot)),
                Err(RecvError::Lagged(skipped)) => self.record_lag(skipped),
                Err(RecvError::Closed) => self.finished = true,
            }
        }
    }

    /// Hand out what was published before the stop, then end
    fn drain(&mut self) -> Option<T> {
        let snapshot = self.try_next();
        if snapshot.is_none() {
            self.finished = true;
        }
        snapshot
    }

    fn deliver(&mut self, snapshot: T) -> T {
        self.received += 1;
        snapshot
    }

    fn record_lag(&mut self, skipped: u64) {
        self.lagged += skipped;
        tracing::warn!(
            "Subscriber of {} fell behind, skipped {} snapshots",
            self.label,
            skipped
        );
    }
}

/// Blocking iterator over a [`SnapshotStream`]
pub struct BlockingSnapshots<'a, T> {
    inner: &'a mut SnapshotStream<T>,
}

impl<T: Clone> Iterator for BlockingSnapshots<'_, T> {
    type Item = T;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.blocking_next()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channels() -> (
        broadcast::Sender<u32>,
        watch::Sender<bool>,
        SnapshotStream<u32>,
    ) {
        let (tx, rx) = broadcast::channel(4);
        let (stop_tx, stop_rx) = watch::channel(false);
        let stream = SnapshotStream::new(rx, stop_rx, Arc::from("test"));
        (tx, stop_tx, stream)
    }

    #[tokio::test]
    async fn test_delivers_in_order() {
        let (tx, _stop, mut stream) = channels();
        for value in 1..=3 {
            tx.send(value).unwrap();
        }

        assert_eq!(stream.next_async().await, Some(1));
        assert_eq!(stream.next_async().await, Some(2));
        assert_eq!(stream.next_async().await, Some(3));
        assert_eq!(stream.received(), 3);
    }

    #[tokio::test]
    async fn test_drains_buffer_after_stop() {
        let (tx, stop, mut stream) = channels();
        tx.send(7).unwrap();
        tx.send(8).unwrap();
        stop.send_replace(true);

        assert_eq!(stream.next_async().await, Some(7));
        assert_eq!(stream.next_async().await, Some(8));
        assert_eq!(stream.next_async().await, None);
        assert!(stream.is_finished());
    }

    #[tokio::test]
    async fn test_ends_when_sender_dropped() {
        let (tx, _stop, mut stream) = channels();
        tx.send(1).unwrap();
        drop(tx);

        assert_eq!(stream.next_async().await, Some(1));
        assert_eq!(stream.next_async().await, None);
    }

    #[tokio::test]
    async fn test_lagging_subscriber_skips_oldest() {
        let (tx, _stop, mut stream) = channels();
        for value in 0..6 {
            tx.send(value).unwrap();
        }

        // Capacity 4: values 0 and 1 were overwritten
        assert_eq!(stream.next_async().await, Some(2));
        assert_eq!(stream.lagged(), 2);
        assert_eq!(stream.next_async().await, Some(3));
    }

    #[tokio::test]
    async fn test_try_next() {
        let (tx, stop, mut stream) = channels();
        assert_eq!(stream.try_next(), None);
        assert!(!stream.is_finished());

        tx.send(5).unwrap();
        assert_eq!(stream.try_next(), Some(5));

        stop.send_replace(true);
        assert_eq!(stream.try_next(), None);
        assert!(stream.is_finished());
    }

    #[tokio::test(start_paused = true)]
    async fn test_next_timeout() {
        let (_tx, _stop, mut stream) = channels();
        let result = stream.next_timeout(Duration::from_secs(1)).await;
        assert!(matches!(result, Err(PollingError::Timeout)));
    }

    #[tokio::test]
    async fn test_into_stream() {
        use futures::StreamExt;

        let (tx, stop, stream) = channels();
        tx.send(1).unwrap();
        tx.send(2).unwrap();
        stop.send_replace(true);

        let collected: Vec<u32> = stream.into_stream().collect().await;
        assert_eq!(collected, vec![1, 2]);
    }

    #[test]
    fn test_blocking_iter() {
        let (tx, _stop, mut stream) = channels();
        let producer = std::thread::spawn(move || {
            for value in 10..13 {
                tx.send(value).unwrap();
            }
        });
        producer.join().unwrap();

        let collected: Vec<u32> = stream.iter().collect();
        assert_eq!(collected, vec![10, 11, 12]);
    }
}
