//! Response body plumbing for the proxy path

use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full, StreamBody};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;

/// Body type returned by every proxy handler
pub type ProxyBody = BoxBody<Bytes, std::io::Error>;

pub fn empty() -> ProxyBody {
    Empty::new().map_err(|never| match never {}).boxed()
}

pub fn full(bytes: impl Into<Bytes>) -> ProxyBody {
    Full::new(bytes.into()).map_err(|never| match never {}).boxed()
}

/// A channel-backed streaming body.
///
/// Frames written to the sender flow to the public client without buffering
/// the whole payload; dropping the sender ends the stream.
pub fn channel(capacity: usize) -> (mpsc::Sender<Result<Bytes, std::io::Error>>, ProxyBody) {
    let (tx, rx) = mpsc::channel(capacity);
    let stream = ReceiverStream::new(rx)
        .map(|item: Result<Bytes, std::io::Error>| item.map(hyper::body::Frame::data));
    (tx, StreamBody::new(stream).boxed())
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    #[tokio::test]
    async fn test_full_body_collects() {
        let body = full("hello");
        let collected = body.collect().await.unwrap().to_bytes();
        assert_eq!(&collected[..], b"hello");
    }

    #[tokio::test]
    async fn test_channel_body_streams() {
        let (tx, body) = channel(4);
        tokio::spawn(async move {
            tx.send(Ok(Bytes::from_static(b"one"))).await.unwrap();
            tx.send(Ok(Bytes::from_static(b"two"))).await.unwrap();
        });

        let collected = body.collect().await.unwrap().to_bytes();
        assert_eq!(&collected[..], b"onetwo");
    }
}
