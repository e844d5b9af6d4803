//! Labeled fan-in of several streams.

use std::pin::Pin;
use std::task::{Context, Poll};

use futures::stream::{BoxStream, Stream, StreamExt};
use tokio_stream::StreamMap;

use rusty_realtime_core::types::StreamLabel;

/// Merges labeled sources into one stream of `(label, item)` pairs.
///
/// Whichever source is ready first is yielded first. Order within one label
/// is preserved; order across labels is arrival order. Sources that end are
/// dropped without blocking the others, and the merged stream ends once all
/// of them have ended. Dropping the multiplexer drops every source.
pub struct StreamMultiplexer<T> {
    sources: StreamMap<StreamLabel, BoxStream<'static, T>>,
}

impl<T: 'static> StreamMultiplexer<T> {
    pub fn new() -> Self {
        Self {
            sources: StreamMap::new(),
        }
    }

    /// Add a source. Returns the source previously registered under `label`.
    pub fn insert<S>(&mut self, label: StreamLabel, source: S) -> Option<BoxStream<'static, T>>
    where
        S: Stream<Item = T> + Send + 'static,
    {
        self.sources.insert(label, source.boxed())
    }

    /// Detach a source that has not ended yet.
    pub fn remove(&mut self, label: StreamLabel) -> Option<BoxStream<'static, T>> {
        self.sources.remove(&label)
    }

    pub fn contains(&self, label: StreamLabel) -> bool {
        self.sources.contains_key(&label)
    }

    /// Number of sources that have not ended.
    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}

impl<T: 'static> Default for StreamMultiplexer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Stream for StreamMultiplexer<T> {
    type Item = (StreamLabel, T);

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.sources).poll_next(cx)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.sources.size_hint()
    }
}

/// Merge labeled sources.
pub fn merge<T, S, I>(sources: I) -> StreamMultiplexer<T>
where
    T: 'static,
    S: Stream<Item = T> + Send + 'static,
    I: IntoIterator<Item = (StreamLabel, S)>,
{
    let mut mux = StreamMultiplexer::new();
    for (label, source) in sources {
        mux.insert(label, source);
    }
    mux
}
