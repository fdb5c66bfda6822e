use futures::{FutureExt, Stream};
use std::{
    pin::Pin,
    task::{ready, Context, Poll},
    time::Duration,
};
use tokio::time::sleep;

/// The default ceiling for a single backoff interval.
const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(30);

/// A stream that yields exponentially increasing backoff durations.
///
/// Every item is yielded only after the stream has slept for that duration, so a retry loop
/// can simply `backoff.next().await` between attempts and give up once the stream ends.
#[derive(Debug)]
pub struct ExponentialBackoff {
    /// Current number of retries.
    retry_count: usize,
    /// Maximum number of retries before closing the stream.
    /// If `None`, the stream will retry indefinitely.
    max_retries: Option<usize>,
    /// The current backoff duration.
    backoff: Duration,
    /// Upper bound for a single backoff duration.
    max_backoff: Duration,
    /// The current backoff timeout, if any.
    /// We need the timeout to be pinned (`Sleep` is not `Unpin`)
    timeout: Option<Pin<Box<tokio::time::Sleep>>>,
}

impl ExponentialBackoff {
    /// Creates a new exponential backoff stream with the given initial duration and max retries.
    pub fn new(initial: Duration, max_retries: Option<usize>) -> Self {
        Self {
            retry_count: 0,
            max_retries,
            backoff: initial,
            max_backoff: DEFAULT_MAX_BACKOFF.max(initial),
            timeout: None,
        }
    }

    /// Caps every yielded backoff at `max`.
    pub fn with_max_backoff(mut self, max: Duration) -> Self {
        self.max_backoff = max;
        self.backoff = self.backoff.min(max);
        self
    }

    /// Returns how many backoff intervals have elapsed so far.
    pub fn retries(&self) -> usize {
        self.retry_count
    }

    /// Resets the stream to its initial interval, e.g. after a successful reconnect.
    pub fn reset(&mut self, initial: Duration) {
        self.retry_count = 0;
        self.backoff = initial.min(self.max_backoff);
        self.timeout = None;
    }
}

impl Stream for ExponentialBackoff {
    type Item = Duration;

    /// Polls the exponential backoff stream. Returns `Poll::Ready` with the elapsed backoff
    /// duration once its timeout has fired, otherwise returns `Poll::Pending`.
    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        // Close the stream
        if this.max_retries.is_some_and(|max| this.retry_count >= max) {
            return Poll::Ready(None);
        }

        let backoff = this.backoff;
        let timeout = this.timeout.get_or_insert_with(|| Box::pin(sleep(backoff)));
        ready!(timeout.poll_unpin(cx));

        // Timeout has elapsed, so clear it and double the backoff for the next round
        this.timeout = None;
        this.retry_count += 1;
        this.backoff = (backoff * 2).min(this.max_backoff);

        Poll::Ready(Some(backoff))
    }
}
