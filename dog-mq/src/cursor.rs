//! Restartable listings.
//!
//! Listings are finite streams ordered by a marker. A [`Cursor`] remembers the
//! marker of the last item it yielded, so a caller can stop anywhere and later
//! resume with `marker = cursor.next_marker()` without seeing an item twice.

use std::pin::Pin;
use std::task::{Context, Poll};

use futures::{Stream, StreamExt};
use pin_project::pin_project;

use crate::backend::BoxStream;
use crate::error::BrokerResult;
use crate::types::{Message, QueueSummary};

/// Items that can be resumed after
pub trait Paged {
    fn marker(&self) -> String;
}

impl Paged for Message {
    fn marker(&self) -> String {
        self.id.to_string()
    }
}

impl Paged for QueueSummary {
    fn marker(&self) -> String {
        self.name.clone()
    }
}

/// One materialized page
#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
    pub items: Vec<T>,
    /// Pass back as `marker` to continue; `None` for an empty page
    pub next_marker: Option<String>,
}

impl<T> Page<T> {
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }
}

/// Lazy listing that tracks where it stopped
#[pin_project]
pub struct Cursor<T> {
    #[pin]
    inner: BoxStream<BrokerResult<T>>,
    last_marker: Option<String>,
}

impl<T: Paged + Send + 'static> Cursor<T> {
    pub fn new(inner: BoxStream<BrokerResult<T>>) -> Self {
        Self {
            inner,
            last_marker: None,
        }
    }

    pub fn empty() -> Self {
        Self::new(Box::pin(futures::stream::empty()))
    }

    /// Marker of the last item yielded so far
    pub fn next_marker(&self) -> Option<&str> {
        self.last_marker.as_deref()
    }

    /// Drain the rest of the listing into a page
    pub async fn into_page(mut self) -> BrokerResult<Page<T>> {
        let mut items = Vec::new();
        while let Some(item) = self.next().await {
            items.push(item?);
        }
        Ok(Page {
            items,
            next_marker: self.last_marker,
        })
    }
}

impl<T: Paged> Stream for Cursor<T> {
    type Item = BrokerResult<T>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.project();
        let polled = this.inner.poll_next(cx);
        if let Poll::Ready(Some(Ok(item))) = &polled {
            *this.last_marker = Some(item.marker());
        }
        polled
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summaries(names: &[&str]) -> Cursor<QueueSummary> {
        let items: Vec<BrokerResult<QueueSummary>> = names
            .iter()
            .map(|n| {
                Ok(QueueSummary {
                    name: n.to_string(),
                    metadata: None,
                })
            })
            .collect();
        Cursor::new(Box::pin(futures::stream::iter(items)))
    }

    #[tokio::test]
    async fn cursor_tracks_the_last_marker() {
        let mut cursor = summaries(&["a", "b", "c"]);
        assert_eq!(cursor.next_marker(), None);

        cursor.next().await.unwrap().unwrap();
        cursor.next().await.unwrap().unwrap();
        assert_eq!(cursor.next_marker(), Some("b"));
    }

    #[tokio::test]
    async fn page_collects_everything() {
        let page = summaries(&["a", "b"]).into_page().await.unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page.next_marker.as_deref(), Some("b"));

        let empty = Cursor::<QueueSummary>::empty().into_page().await.unwrap();
        assert!(empty.is_empty());
        assert_eq!(empty.next_marker, None);
    }
}
