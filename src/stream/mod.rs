//! Streaming datapath: reads a backend token stream, canonicalizes chunks,
//! enforces backpressure and deadlines, and accounts TTFT/inter-token
//! latency.
//!
//! One bounded channel sits between the producer task (backend reader) and
//! the consuming adapter. The producer blocks when the channel is full; a
//! client that stays slow past the push timeout aborts the stream. The
//! in-flight queue guard lives inside the producer task, so `mark_end` runs
//! on success, backend failure, deadline, slow-client abort and client
//! disconnect alike. Within one stream, chunks are delivered strictly in
//! backend order.

pub mod pool;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::backend::{Backend, RawChunk, TokenStream};
use crate::error::ProxyError;
use crate::routing::queue::InFlightGuard;
use pool::FramePool;

/// Chunks buffered between reader and writer.
pub const CHANNEL_CAPACITY: usize = 10;

/// How long the producer tolerates a full channel before aborting.
pub const BACKPRESSURE_TIMEOUT: Duration = Duration::from_secs(5);

/// Per-frame deadline for adapters that observe their own writes (WS,
/// gRPC).
pub const WRITE_DEADLINE: Duration = Duration::from_secs(10);

/// Canonical token event delivered to every adapter. The first non-empty
/// chunk carries `ttft_ms`, later ones `inter_token_ms`, the terminal one
/// the stream totals.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TokenChunk {
    pub token: String,
    pub done: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ttft_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inter_token_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend_id: Option<String>,
}

/// What the adapter pops off the channel: chunks until either the terminal
/// chunk or one in-band error, after which the channel closes.
pub type StreamItem = Result<TokenChunk, ProxyError>;

/// Spawn the producer task for one streaming request and hand back the
/// consumer end.
///
/// `guard` is this request's in-flight token; it drops when the producer
/// exits, on every path. `deadline` (from the request's `deadline_ms`)
/// bounds the whole stream.
pub fn relay(
    backend: Arc<dyn Backend>,
    stream: TokenStream,
    guard: InFlightGuard,
    deadline: Option<Duration>,
) -> mpsc::Receiver<StreamItem> {
    relay_with_push_timeout(backend, stream, guard, deadline, BACKPRESSURE_TIMEOUT)
}

fn relay_with_push_timeout(
    backend: Arc<dyn Backend>,
    mut stream: TokenStream,
    guard: InFlightGuard,
    deadline: Option<Duration>,
    push_timeout: Duration,
) -> mpsc::Receiver<StreamItem> {
    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
    let backend_id = backend.spec().id.clone();

    tokio::spawn(async move {
        let _guard = guard;
        let opened = Instant::now();
        let deadline_at = deadline.map(|d| opened + d);

        let mut first_token_at: Option<Instant> = None;
        let mut last_token_at: Option<Instant> = None;
        let mut token_count: u32 = 0;
        let mut success = false;

        loop {
            let next = match deadline_at {
                Some(at) => match tokio::time::timeout_at(at, stream.next()).await {
                    Ok(item) => item,
                    Err(_) => {
                        let _ = tx
                            .send_timeout(Err(ProxyError::BackendTimeout), push_timeout)
                            .await;
                        break;
                    }
                },
                None => stream.next().await,
            };

            match next {
                None => {
                    // Backend closed without a terminal chunk; synthesize
                    // one so clients always see the totals.
                    let chunk = finish_chunk(
                        RawChunk {
                            done: true,
                            ..RawChunk::default()
                        },
                        &backend_id,
                        opened,
                        &mut first_token_at,
                        &mut last_token_at,
                        &mut token_count,
                    );
                    success = tx
                        .send_timeout(Ok(chunk), push_timeout)
                        .await
                        .is_ok();
                    break;
                }
                Some(Err(e)) => {
                    // Typed in-band error before close; adapters frame it
                    // for their transport.
                    let _ = tx
                        .send_timeout(
                            Err(ProxyError::Backend {
                                backend_id: backend_id.clone(),
                                message: e.to_string(),
                            }),
                            push_timeout,
                        )
                        .await;
                    break;
                }
                Some(Ok(raw)) => {
                    let done = raw.done;
                    let chunk = finish_chunk(
                        raw,
                        &backend_id,
                        opened,
                        &mut first_token_at,
                        &mut last_token_at,
                        &mut token_count,
                    );

                    match tx.send_timeout(Ok(chunk), push_timeout).await {
                        Ok(()) => {
                            if done {
                                success = true;
                                break;
                            }
                        }
                        Err(SendTimeoutError::Timeout(_)) => {
                            warn!(backend = %backend_id, "Stream aborted: client too slow");
                            break;
                        }
                        Err(SendTimeoutError::Closed(_)) => {
                            // Client went away; nothing left to tell it.
                            debug!(backend = %backend_id, "Stream cancelled by client");
                            break;
                        }
                    }
                }
            }
        }

        backend.record_outcome(opened.elapsed(), success);
        // _guard drops here: mark_end for this request.
    });

    rx
}

/// Stamp one raw chunk with timing and terminal metadata.
fn finish_chunk(
    raw: RawChunk,
    backend_id: &str,
    opened: Instant,
    first_token_at: &mut Option<Instant>,
    last_token_at: &mut Option<Instant>,
    token_count: &mut u32,
) -> TokenChunk {
    let mut chunk = TokenChunk {
        token: raw.token,
        done: raw.done,
        ..TokenChunk::default()
    };

    if !chunk.token.is_empty() {
        let now = Instant::now();
        if first_token_at.is_none() {
            *first_token_at = Some(now);
            let ttft = now.duration_since(opened).as_millis() as u64;
            chunk.ttft_ms = Some(ttft);
            debug!(backend = %backend_id, ttft_ms = ttft, "First token");
        } else if let Some(prev) = *last_token_at {
            chunk.inter_token_ms = Some(now.duration_since(prev).as_millis() as u64);
        }
        *last_token_at = Some(now);
        *token_count += 1;
    }

    if chunk.done {
        chunk.total_tokens = Some(raw.total_tokens.unwrap_or(*token_count));
        chunk.total_duration_ms = Some(opened.elapsed().as_millis() as u64);
        chunk.backend_id = Some(backend_id.to_string());
    }

    chunk
}

/// Server-Sent-Events framer over pooled buffers.
#[derive(Debug, Clone, Default)]
pub struct SseFramer {
    pool: FramePool,
}

impl SseFramer {
    fn framed(&self, prefix: &[u8], payload: &impl Serialize) -> Bytes {
        let mut buf = self.pool.acquire();
        buf.extend_from_slice(prefix);
        // Serializing a plain struct into a Vec cannot fail.
        serde_json::to_writer(&mut buf, payload).expect("frame serialization");
        buf.extend_from_slice(b"\n\n");
        let frame = Bytes::copy_from_slice(&buf);
        self.pool.recycle(buf);
        frame
    }

    /// `data: <minified-json>\n\n`
    pub fn chunk(&self, chunk: &TokenChunk) -> Bytes {
        self.framed(b"data: ", chunk)
    }

    /// `event: error\ndata: {"error":{...}}\n\n`
    pub fn error(&self, err: &ProxyError) -> Bytes {
        self.framed(b"event: error\ndata: ", &err.stream_frame())
    }

    /// Terminal `data: [DONE]\n\n`
    pub fn done(&self) -> Bytes {
        Bytes::from_static(b"data: [DONE]\n\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::scripted::{FailPoint, ScriptedBackend};
    use crate::backend::GenerateRequest;
    use crate::routing::annotations::Priority;
    use crate::routing::queue::QueueManager;

    async fn open_relay(
        backend: ScriptedBackend,
        queues: &QueueManager,
        deadline: Option<Duration>,
    ) -> mpsc::Receiver<StreamItem> {
        let backend = Arc::new(backend);
        let guard = queues.mark_start(&backend.spec().id, Priority::Normal);
        let stream = backend
            .generate_stream(GenerateRequest::default())
            .await
            .unwrap();
        relay(backend, stream, guard, deadline)
    }

    async fn drain(mut rx: mpsc::Receiver<StreamItem>) -> Vec<StreamItem> {
        let mut items = Vec::new();
        while let Some(item) = rx.recv().await {
            items.push(item);
        }
        items
    }

    #[tokio::test]
    async fn happy_path_delivers_ordered_chunks_and_totals() {
        let queues = QueueManager::new();
        let backend = ScriptedBackend::named("b").with_tokens(&["a", "b", "c"]);
        let rx = open_relay(backend, &queues, None).await;
        let items = drain(rx).await;

        assert_eq!(items.len(), 4);
        let tokens: Vec<String> = items
            .iter()
            .map(|i| i.as_ref().unwrap().token.clone())
            .collect();
        assert_eq!(tokens, vec!["a", "b", "c", ""]);

        let terminal = items.last().unwrap().as_ref().unwrap();
        assert!(terminal.done);
        assert_eq!(terminal.total_tokens, Some(3));
        assert_eq!(terminal.backend_id.as_deref(), Some("b"));
        assert!(terminal.total_duration_ms.is_some());

        // First chunk carries TTFT, later ones do not.
        assert!(items[0].as_ref().unwrap().ttft_ms.is_some());
        assert!(items[1].as_ref().unwrap().ttft_ms.is_none());

        // Guard released on completion.
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(queues.depth("b"), 0);
    }

    #[tokio::test]
    async fn backend_error_mid_stream_yields_in_band_error_then_close() {
        let queues = QueueManager::new();
        let backend = ScriptedBackend::named("b")
            .with_tokens(&["a", "b", "c", "d"])
            .failing_stream_at(FailPoint::MidStream(2));
        let rx = open_relay(backend, &queues, None).await;
        let items = drain(rx).await;

        assert_eq!(items.len(), 3);
        assert!(items[0].is_ok());
        assert!(items[1].is_ok());
        match items[2].as_ref().unwrap_err() {
            ProxyError::Backend { backend_id, .. } => assert_eq!(backend_id, "b"),
            other => panic!("unexpected: {other:?}"),
        }

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(queues.depth("b"), 0);
    }

    #[tokio::test]
    async fn first_read_failure_still_releases_guard() {
        let queues = QueueManager::new();
        let backend = ScriptedBackend::named("b").failing_stream_at(FailPoint::FirstRead);
        let rx = open_relay(backend, &queues, None).await;
        let items = drain(rx).await;

        assert_eq!(items.len(), 1);
        assert!(items[0].is_err());
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(queues.depth("b"), 0);
    }

    #[tokio::test]
    async fn client_drop_cancels_and_releases_guard() {
        let queues = QueueManager::new();
        let backend = ScriptedBackend::named("b")
            .with_tokens(&["a"; 50])
            .with_token_delay(Duration::from_millis(5));
        let mut rx = open_relay(backend, &queues, None).await;

        // Read one chunk, then walk away.
        let first = rx.recv().await.unwrap();
        assert!(first.is_ok());
        drop(rx);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(queues.depth("b"), 0);
    }

    #[tokio::test]
    async fn deadline_terminates_stream_with_timeout_error() {
        let queues = QueueManager::new();
        let backend = ScriptedBackend::named("b")
            .with_tokens(&["a"; 100])
            .with_token_delay(Duration::from_millis(10));
        let rx = open_relay(backend, &queues, Some(Duration::from_millis(40))).await;
        let items = drain(rx).await;

        assert!(matches!(
            items.last().unwrap(),
            Err(ProxyError::BackendTimeout)
        ));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(queues.depth("b"), 0);
    }

    #[tokio::test]
    async fn slow_client_aborts_stream_and_releases_guard() {
        let queues = QueueManager::new();
        let backend = Arc::new(ScriptedBackend::named("b").with_tokens(&["a"; 50]));
        let guard = queues.mark_start("b", Priority::Normal);
        let stream = backend
            .generate_stream(GenerateRequest::default())
            .await
            .unwrap();

        // Consumer never reads: the channel fills, then the shortened push
        // timeout fires and the producer gives up.
        let rx = relay_with_push_timeout(
            Arc::clone(&backend) as Arc<dyn Backend>,
            stream,
            guard,
            None,
            Duration::from_millis(30),
        );

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(queues.depth("b"), 0);

        // The buffered chunks are still there; the stream just ends early
        // with no terminal chunk.
        let items = drain(rx).await;
        assert_eq!(items.len(), CHANNEL_CAPACITY);
        assert!(items.iter().all(|i| i.is_ok()));
        assert!(!items.last().unwrap().as_ref().unwrap().done);
    }

    #[tokio::test]
    async fn eof_without_done_synthesizes_terminal_chunk() {
        let queues = QueueManager::new();
        let backend = Arc::new(ScriptedBackend::named("b"));
        let guard = queues.mark_start("b", Priority::Normal);
        let stream: TokenStream = Box::pin(futures::stream::empty());
        let rx = relay(backend, stream, guard, None);
        let items = drain(rx).await;

        assert_eq!(items.len(), 1);
        let terminal = items[0].as_ref().unwrap();
        assert!(terminal.done);
        assert_eq!(terminal.total_tokens, Some(0));
        assert_eq!(terminal.backend_id.as_deref(), Some("b"));
    }

    #[test]
    fn sse_framing_shapes() {
        let framer = SseFramer::default();
        let chunk = TokenChunk {
            token: "hi".into(),
            ..TokenChunk::default()
        };
        let frame = framer.chunk(&chunk);
        let text = std::str::from_utf8(&frame).unwrap();
        assert!(text.starts_with("data: {"));
        assert!(text.ends_with("\n\n"));
        assert!(text.contains("\"token\":\"hi\""));

        assert_eq!(&framer.done()[..], b"data: [DONE]\n\n");

        let err = ProxyError::Backend {
            backend_id: "b".into(),
            message: "boom".into(),
        };
        let text = String::from_utf8(framer.error(&err).to_vec()).unwrap();
        assert!(text.starts_with("event: error\ndata: {"));
        assert!(text.contains("\"type\":\"stream_error\""));
    }

    #[test]
    fn chunk_serializes_minified_without_empty_fields() {
        let chunk = TokenChunk {
            token: "x".into(),
            ..TokenChunk::default()
        };
        let json = serde_json::to_string(&chunk).unwrap();
        assert_eq!(json, r#"{"token":"x","done":false}"#);
    }
}
