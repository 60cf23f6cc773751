//! Body wrapper that observes a stream while it is forwarded

use std::fmt::Display;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use bytes::{Bytes, BytesMut};
use hyper::body::{Body, Frame, SizeHint};
use hyper::HeaderMap;
use tracing::debug;

type Completion = Box<dyn FnOnce(Bytes, Option<HeaderMap>) + Send + Sync>;
type Failure = Box<dyn FnOnce(String) + Send + Sync>;

/// Passes frames through untouched while keeping a copy
///
/// Once the wrapped body has been read to the end, the completion callback
/// receives the buffered bytes and trailers. A body that fails or is dropped
/// part way through never completes; the failure callback, if any, gets the
/// reason instead. Exactly one of the two runs.
pub struct TapBody<B: Body> {
    inner: B,
    buffer: BytesMut,
    trailers: Option<HeaderMap>,
    on_complete: Option<Completion>,
    on_failure: Option<Failure>,
}

impl<B: Body> TapBody<B> {
    /// Wrap `inner`, calling `on_complete` once it has been fully read
    pub fn new<F>(inner: B, on_complete: F) -> Self
    where
        F: FnOnce(Bytes, Option<HeaderMap>) + Send + Sync + 'static,
    {
        Self {
            inner,
            buffer: BytesMut::new(),
            trailers: None,
            on_complete: Some(Box::new(on_complete)),
            on_failure: None,
        }
    }

    /// Call `on_failure` if the body errors or is dropped before its end
    #[must_use]
    pub fn on_failure<F>(mut self, on_failure: F) -> Self
    where
        F: FnOnce(String) + Send + Sync + 'static,
    {
        self.on_failure = Some(Box::new(on_failure));
        self
    }

    fn complete(&mut self) {
        if let Some(on_complete) = self.on_complete.take() {
            let body = std::mem::take(&mut self.buffer).freeze();
            on_complete(body, self.trailers.take());
        }
    }

    fn fail(&mut self, reason: &str) {
        if self.on_complete.take().is_none() {
            return;
        }
        debug!("Body {} after {} bytes", reason, self.buffer.len());
        if let Some(on_failure) = self.on_failure.take() {
            on_failure(format!("body {reason} after {} bytes", self.buffer.len()));
        }
    }
}

impl<B> Body for TapBody<B>
where
    B: Body<Data = Bytes> + Unpin,
    B::Error: Display,
{
    type Data = Bytes;
    type Error = B::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        match ready!(Pin::new(&mut this.inner).poll_frame(cx)) {
            Some(Ok(frame)) => {
                if let Some(data) = frame.data_ref() {
                    this.buffer.extend_from_slice(data);
                } else if let Some(trailers) = frame.trailers_ref() {
                    this.trailers = Some(trailers.clone());
                }
                Poll::Ready(Some(Ok(frame)))
            }
            Some(Err(e)) => {
                this.fail(&format!("failed ({e})"));
                Poll::Ready(Some(Err(e)))
            }
            None => {
                this.complete();
                Poll::Ready(None)
            }
        }
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

impl<B: Body> Drop for TapBody<B> {
    // Readers may stop polling once the inner body reports its end.
    fn drop(&mut self) {
        if self.inner.is_end_stream() {
            self.complete();
        } else {
            self.fail("dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;
    use http_body_util::{BodyExt, Full, StreamBody};
    use std::convert::Infallible;
    use std::sync::{Arc, Mutex};

    type Seen = Arc<Mutex<Option<(Bytes, Option<HeaderMap>)>>>;

    fn recorder() -> (Seen, impl FnOnce(Bytes, Option<HeaderMap>) + Send + Sync + 'static) {
        let seen: Seen = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&seen);
        (seen, move |body, trailers| {
            *sink.lock().unwrap() = Some((body, trailers));
        })
    }

    #[tokio::test]
    async fn test_tap_passes_through_and_completes() {
        let (seen, on_complete) = recorder();
        let body = TapBody::new(Full::new(Bytes::from("hello")), on_complete);

        let forwarded = body.collect().await.unwrap().to_bytes();
        assert_eq!(forwarded, Bytes::from("hello"));

        let (buffered, trailers) = seen.lock().unwrap().take().unwrap();
        assert_eq!(buffered, Bytes::from("hello"));
        assert!(trailers.is_none());
    }

    #[tokio::test]
    async fn test_tap_captures_chunks_and_trailers() {
        let mut trailer_map = HeaderMap::new();
        trailer_map.insert("x-checksum", "abc".parse().unwrap());

        let frames: Vec<Result<Frame<Bytes>, Infallible>> = vec![
            Ok(Frame::data(Bytes::from("he"))),
            Ok(Frame::data(Bytes::from("llo"))),
            Ok(Frame::trailers(trailer_map)),
        ];
        let stream = stream::iter(frames);

        let (seen, on_complete) = recorder();
        let body = TapBody::new(StreamBody::new(stream), on_complete);
        let collected = body.collect().await.unwrap();
        assert_eq!(collected.trailers().unwrap()["x-checksum"], "abc");

        let (buffered, trailers) = seen.lock().unwrap().take().unwrap();
        assert_eq!(buffered, Bytes::from("hello"));
        assert_eq!(trailers.unwrap()["x-checksum"], "abc");
    }

    fn failures() -> (Arc<Mutex<Vec<String>>>, impl FnOnce(String) + Send + Sync + 'static) {
        let failed = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&failed);
        (failed, move |reason| sink.lock().unwrap().push(reason))
    }

    #[test]
    fn test_tap_abandoned_does_not_complete() {
        let (seen, on_complete) = recorder();
        let (failed, on_failure) = failures();
        let frames: Vec<Result<Frame<Bytes>, Infallible>> =
            vec![Ok(Frame::data(Bytes::from("partial")))];
        let body = TapBody::new(StreamBody::new(stream::iter(frames)), on_complete)
            .on_failure(on_failure);
        drop(body);

        assert!(seen.lock().unwrap().is_none());
        assert_eq!(*failed.lock().unwrap(), vec!["body dropped after 0 bytes".to_string()]);
    }

    #[tokio::test]
    async fn test_tap_error_reports_failure_once() {
        let (seen, on_complete) = recorder();
        let (failed, on_failure) = failures();
        let frames: Vec<Result<Frame<Bytes>, String>> = vec![
            Ok(Frame::data(Bytes::from("abc"))),
            Err("connection reset".to_string()),
        ];
        let body = TapBody::new(StreamBody::new(stream::iter(frames)), on_complete)
            .on_failure(on_failure);

        let error = body.collect().await.unwrap_err();
        assert_eq!(error, "connection reset");

        assert!(seen.lock().unwrap().is_none());
        assert_eq!(
            *failed.lock().unwrap(),
            vec!["body failed (connection reset) after 3 bytes".to_string()]
        );
    }
}
