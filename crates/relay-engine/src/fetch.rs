//! # Chunked fetcher
//!
//! Retrieves a remote resource as a readable byte stream. When the total
//! size is known in advance the resource is pulled as sequential ranged
//! chunks (much faster on media CDNs than one long-lived request); when it
//! is unknown, a single pass-through request is used and the response's
//! `Content-Length` header, if present, is reported as the effective length.
//!
//! The returned [`MediaStream`] is fed through an in-memory pipe: the
//! network copy runs as a background task while the caller consumes the
//! reader half, so consumption starts before the fetch completes and the
//! bounded pipe provides natural backpressure.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::StreamExt;
use reqwest::{Client, StatusCode, Url};
use tokio::io::AsyncRead;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::config::{FetcherConfig, create_client};
use crate::error::FetchError;

/// Size of one ranged request during a multi-request fetch.
pub const FETCH_CHUNK_SIZE: u64 = 10_000_000;

type ByteResult = Result<Bytes, io::Error>;

/// A byte-producing handle plus what is known about its total size.
///
/// Exclusively owned by the consuming stage until closed; ownership
/// transfers along the pipeline, never shared.
pub struct MediaStream {
    total_bytes: u64,
    reader: StreamReader<ReceiverStream<ByteResult>, Bytes>,
}

impl MediaStream {
    /// Total length in bytes, `0` when unknown.
    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }
}

impl AsyncRead for MediaStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.reader).poll_read(cx, buf)
    }
}

/// Fetcher for streaming remote resources, chunked when the size is known.
pub struct ChunkedFetcher {
    client: Client,
}

impl ChunkedFetcher {
    /// Create a new fetcher with default configuration
    pub fn new() -> Result<Self, FetchError> {
        Self::with_config(FetcherConfig::default())
    }

    /// Create a new fetcher with custom configuration
    pub fn with_config(config: FetcherConfig) -> Result<Self, FetchError> {
        let client = create_client(&config)?;
        Ok(Self { client })
    }

    /// Start fetching `url`.
    ///
    /// `known_length > 0` selects the ranged chunk loop; `0` selects a
    /// single unranged pass. The returned stream can be read immediately;
    /// transport errors after this point surface as the stream's terminal
    /// error (see [`crate::error::fetch_error_from_io`]).
    #[instrument(skip(self, token), level = "debug")]
    pub async fn fetch(
        &self,
        url: Url,
        known_length: u64,
        token: CancellationToken,
    ) -> Result<MediaStream, FetchError> {
        let (tx, rx) = mpsc::channel::<ByteResult>(2);
        let reader = StreamReader::new(ReceiverStream::new(rx));

        if known_length > 0 {
            info!(url = %url, total = known_length, "starting chunked fetch");
            let client = self.client.clone();
            tokio::spawn(run_chunk_loop(client, url, known_length, tx, token));
            return Ok(MediaStream {
                total_bytes: known_length,
                reader,
            });
        }

        // Some resources carry no length information; fall back to one
        // unranged request and report whatever the response declares.
        info!(url = %url, "content length unknown, starting single-pass fetch");
        let response = tokio::select! {
            _ = token.cancelled() => return Err(FetchError::Cancelled),
            response = self.client.get(url.clone()).send() => response?,
        };
        if !response.status().is_success() {
            return Err(FetchError::unexpected_status(response.status(), 0));
        }
        let effective_length = response.content_length().unwrap_or(0);
        debug!(url = %url, effective_length, "single-pass response received");

        tokio::spawn(forward_body(response, tx, token));
        Ok(MediaStream {
            total_bytes: effective_length,
            reader,
        })
    }
}

/// Sequentially fetch ranged chunks and feed them into the pipe.
///
/// The offset advances by the number of bytes actually forwarded, not the
/// requested chunk size, so short chunk bodies are tolerated.
async fn run_chunk_loop(
    client: Client,
    url: Url,
    total: u64,
    tx: mpsc::Sender<ByteResult>,
    token: CancellationToken,
) {
    let mut offset: u64 = 0;
    while offset < total {
        match fetch_chunk(&client, &url, offset, &tx, &token).await {
            Ok(0) => {
                // An empty 206 body would make this loop spin forever.
                warn!(url = %url, offset, "empty ranged response body");
                let _ = tx
                    .send(Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "empty ranged response body",
                    )))
                    .await;
                return;
            }
            Ok(written) => offset += written,
            Err(err) => {
                if !err.is_cancelled() {
                    warn!(url = %url, offset, error = %err, "chunk fetch failed");
                }
                let _ = tx.send(Err(err.into_io())).await;
                return;
            }
        }
    }
    debug!(url = %url, total, "chunked fetch complete");
    // Dropping tx closes the stream cleanly.
}

/// Fetch one chunk at `offset` and forward its body. Returns the number of
/// bytes forwarded.
async fn fetch_chunk(
    client: &Client,
    url: &Url,
    offset: u64,
    tx: &mpsc::Sender<ByteResult>,
    token: &CancellationToken,
) -> Result<u64, FetchError> {
    let range = format!("bytes={}-{}", offset, offset + FETCH_CHUNK_SIZE - 1);
    let response = tokio::select! {
        _ = token.cancelled() => return Err(FetchError::Cancelled),
        response = client
            .get(url.clone())
            .header(reqwest::header::RANGE, range)
            .send() => response?,
    };

    if response.status() != StatusCode::PARTIAL_CONTENT {
        return Err(FetchError::unexpected_status(response.status(), offset));
    }

    let mut body = response.bytes_stream();
    let mut written: u64 = 0;
    loop {
        let chunk = tokio::select! {
            _ = token.cancelled() => return Err(FetchError::Cancelled),
            chunk = body.next() => chunk,
        };
        match chunk {
            Some(Ok(bytes)) => {
                written += bytes.len() as u64;
                let sent = tokio::select! {
                    _ = token.cancelled() => return Err(FetchError::Cancelled),
                    sent = tx.send(Ok(bytes)) => sent,
                };
                if sent.is_err() {
                    // Consumer went away; treat as cancellation.
                    return Err(FetchError::Cancelled);
                }
            }
            Some(Err(err)) => return Err(FetchError::from(err)),
            None => return Ok(written),
        }
    }
}

/// Copy the body of an unranged response into the pipe.
async fn forward_body(
    response: reqwest::Response,
    tx: mpsc::Sender<ByteResult>,
    token: CancellationToken,
) {
    let mut body = response.bytes_stream();
    loop {
        let chunk = tokio::select! {
            _ = token.cancelled() => {
                let _ = tx.send(Err(FetchError::Cancelled.into_io())).await;
                return;
            }
            chunk = body.next() => chunk,
        };
        match chunk {
            Some(Ok(bytes)) => {
                let sent = tokio::select! {
                    _ = token.cancelled() => {
                        let _ = tx.send(Err(FetchError::Cancelled.into_io())).await;
                        return;
                    }
                    sent = tx.send(Ok(bytes)) => sent,
                };
                if sent.is_err() {
                    return;
                }
            }
            Some(Err(err)) => {
                let _ = tx.send(Err(FetchError::from(err).into_io())).await;
                return;
            }
            None => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::fetch_error_from_io;
    use axum::extract::State;
    use axum::http::{HeaderMap, StatusCode, header};
    use axum::response::{IntoResponse, Response};
    use axum::routing::get;
    use axum::Router;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::AsyncReadExt;

    #[derive(Clone)]
    struct Served {
        data: Arc<Vec<u8>>,
        range_requests: Arc<AtomicUsize>,
        // When set, ranged requests are answered with 200 + full body.
        refuse_ranges: bool,
    }

    async fn serve(State(served): State<Served>, headers: HeaderMap) -> Response {
        let data = served.data.as_ref();
        let Some(range) = headers.get(header::RANGE) else {
            return (StatusCode::OK, data.clone()).into_response();
        };

        served.range_requests.fetch_add(1, Ordering::SeqCst);
        if served.refuse_ranges {
            return (StatusCode::OK, data.clone()).into_response();
        }

        let spec = range.to_str().unwrap().trim_start_matches("bytes=");
        let (start, end) = spec.split_once('-').unwrap();
        let start: usize = start.parse().unwrap();
        let end: usize = end.parse::<usize>().unwrap().min(data.len() - 1);
        (StatusCode::PARTIAL_CONTENT, data[start..=end].to_vec()).into_response()
    }

    async fn start_server(served: Served) -> Url {
        let app = Router::new().route("/media", get(serve)).with_state(served);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}/media").parse().unwrap()
    }

    fn patterned(len: usize) -> Arc<Vec<u8>> {
        Arc::new((0..len).map(|i| (i % 251) as u8).collect())
    }

    fn served(data: Arc<Vec<u8>>, refuse_ranges: bool) -> Served {
        Served {
            data,
            range_requests: Arc::new(AtomicUsize::new(0)),
            refuse_ranges,
        }
    }

    #[tokio::test]
    async fn chunked_fetch_reassembles_known_length() {
        let data = patterned(25_000_000);
        let state = served(data.clone(), false);
        let requests = state.range_requests.clone();
        let url = start_server(state).await;

        let fetcher = ChunkedFetcher::new().unwrap();
        let mut stream = fetcher
            .fetch(url, data.len() as u64, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(stream.total_bytes(), data.len() as u64);

        let mut out = Vec::with_capacity(data.len());
        stream.read_to_end(&mut out).await.unwrap();
        assert_eq!(out.len(), data.len());
        assert_eq!(&out, data.as_ref());
        // ceil(25_000_000 / 10_000_000) ranged requests
        assert_eq!(requests.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn single_pass_when_length_unknown() {
        let data = patterned(12_345_678);
        let state = served(data.clone(), false);
        let requests = state.range_requests.clone();
        let url = start_server(state).await;

        let fetcher = ChunkedFetcher::new().unwrap();
        let mut stream = fetcher
            .fetch(url, 0, CancellationToken::new())
            .await
            .unwrap();
        // Effective length comes from the response's Content-Length header.
        assert_eq!(stream.total_bytes(), data.len() as u64);

        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.unwrap();
        assert_eq!(&out, data.as_ref());
        assert_eq!(requests.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn non_partial_status_aborts_stream() {
        let data = patterned(1_000_000);
        let url = start_server(served(data.clone(), true)).await;

        let fetcher = ChunkedFetcher::new().unwrap();
        let mut stream = fetcher
            .fetch(url, data.len() as u64, CancellationToken::new())
            .await
            .unwrap();

        let err = stream.read_to_end(&mut Vec::new()).await.unwrap_err();
        match fetch_error_from_io(&err) {
            Some(FetchError::UnexpectedStatus { status, offset }) => {
                assert_eq!(*status, reqwest::StatusCode::OK);
                assert_eq!(*offset, 0);
            }
            other => panic!("expected UnexpectedStatus, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn cancellation_closes_stream_with_cancelled() {
        let data = patterned(25_000_000);
        let url = start_server(served(data.clone(), false)).await;

        let fetcher = ChunkedFetcher::new().unwrap();
        let token = CancellationToken::new();
        let mut stream = fetcher
            .fetch(url, data.len() as u64, token.clone())
            .await
            .unwrap();

        let mut first = vec![0u8; 4096];
        stream.read_exact(&mut first).await.unwrap();
        token.cancel();

        // The producer observes cancellation within one read/write cycle and
        // closes the pipe with the cancellation error.
        let err = loop {
            let mut buf = vec![0u8; 64 * 1024];
            match stream.read(&mut buf).await {
                Ok(0) => panic!("stream ended cleanly despite cancellation"),
                Ok(_) => continue,
                Err(err) => break err,
            }
        };
        assert!(matches!(
            fetch_error_from_io(&err),
            Some(FetchError::Cancelled)
        ));
    }
}
