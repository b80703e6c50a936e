//! Deadline-bounded byte copies for everything that leaves the process.
//!
//! The copy runs as its own task and races a timer. Losing the race aborts
//! the task, which drops the destination it owns; whatever was written by
//! then stays written. Nothing is retried here.

use std::io::{self, Cursor};
use std::time::Duration;

use axum::body::{Body, Bytes};
use futures::{StreamExt, future, stream};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::oneshot;
use tokio_util::io::ReaderStream;
use tracing::warn;

use crate::errors::StreamError;

/// Pipe buffer between a timed copy and the HTTP response body.
const BODY_PIPE_BYTES: usize = 64 * 1024;

/// Copy `src` into `dst`, failing with [`StreamError::Timeout`] if the copy
/// has not finished within `deadline`. Returns the number of bytes copied.
pub async fn stream_with_timeout<W, R>(
    dst: W,
    src: R,
    deadline: Duration,
) -> Result<u64, StreamError>
where
    W: AsyncWrite + Unpin + Send + 'static,
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut copy = tokio::spawn(async move {
        let (mut dst, mut src) = (dst, src);
        let copied = tokio::io::copy(&mut src, &mut dst).await?;
        dst.flush().await?;
        Ok::<u64, io::Error>(copied)
    });

    tokio::select! {
        joined = &mut copy => match joined {
            Ok(result) => result.map_err(StreamError::from),
            Err(e) => Err(StreamError::Io(io::Error::other(e))),
        },
        _ = tokio::time::sleep(deadline) => {
            copy.abort();
            Err(StreamError::Timeout { after: deadline })
        }
    }
}

/// [`stream_with_timeout`] over an in-memory source.
pub async fn write_with_timeout<W>(
    dst: W,
    bytes: Bytes,
    deadline: Duration,
) -> Result<u64, StreamError>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    stream_with_timeout(dst, Cursor::new(bytes), deadline).await
}

/// Response body fed from `src` under `deadline`.
///
/// On timeout the body ends with an error item, so the server tears the
/// response down instead of presenting a truncated payload as complete.
pub fn timed_body<R>(src: R, deadline: Duration, label: String) -> Body
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let (writer, reader) = tokio::io::duplex(BODY_PIPE_BYTES);
    let (fail_tx, fail_rx) = oneshot::channel::<io::Error>();

    tokio::spawn(async move {
        if let Err(e) = stream_with_timeout(writer, src, deadline).await {
            warn!(target: "transport", asset = %label, error = %e, "response stream aborted");
            let kind = if e.is_timeout() {
                io::ErrorKind::TimedOut
            } else {
                io::ErrorKind::BrokenPipe
            };
            let _ = fail_tx.send(io::Error::new(kind, e.to_string()));
        }
    });

    let failure = stream::once(fail_rx).filter_map(|r| future::ready(r.ok().map(Err)));
    Body::from_stream(ReaderStream::new(reader).chain(failure))
}

/// [`timed_body`] over an in-memory payload.
pub fn timed_bytes(bytes: Bytes, deadline: Duration, label: String) -> Body {
    timed_body(Cursor::new(bytes), deadline, label)
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;
    use tokio::io::AsyncReadExt;
    use tokio::time::Instant;

    #[tokio::test]
    async fn test_copy_completes_within_deadline() {
        let (writer, mut reader) = tokio::io::duplex(1024 * 1024);
        let payload = Bytes::from(vec![7u8; 100_000]);
        let copied = write_with_timeout(writer, payload.clone(), Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(copied, 100_000);

        let mut received = Vec::new();
        reader.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, payload.to_vec());
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_reader_times_out_at_deadline() {
        // Tiny pipe that nobody drains: the copy blocks after 16 bytes.
        let (writer, _reader) = tokio::io::duplex(16);
        let start = Instant::now();
        let err = write_with_timeout(
            writer,
            Bytes::from(vec![0u8; 10 * 1024 * 1024]),
            Duration::from_secs(2),
        )
        .await
        .unwrap_err();
        assert!(err.is_timeout());
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(2));
        assert!(elapsed < Duration::from_millis(2100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_source_times_out() {
        let (writer, _reader) = tokio::io::duplex(1024);
        let (_held_open, stalled) = tokio::io::duplex(1024);
        let err = stream_with_timeout(writer, stalled, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, StreamError::Timeout { after } if after == Duration::from_secs(5)));
    }

    #[tokio::test]
    async fn test_timed_body_delivers_payload() {
        let body = timed_bytes(
            Bytes::from_static(b"console.log('hi')"),
            Duration::from_secs(2),
            "test".into(),
        );
        let collected = body.collect().await.unwrap().to_bytes();
        assert_eq!(&collected[..], b"console.log('hi')");
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_body_errors_instead_of_truncating() {
        let (mut feeder, src) = tokio::io::duplex(1024);
        feeder.write_all(b"partial").await.unwrap();
        let body = timed_body(src, Duration::from_secs(2), "test".into());
        // `feeder` stays open, so the copy can never finish.
        assert!(body.collect().await.is_err());
        drop(feeder);
    }
}
