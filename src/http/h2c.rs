//! HTTP/2 over cleartext through the HTTP/1.1 `Upgrade: h2c` handshake.
//!
//! # Data Flow
//! ```text
//! HTTP/1.1 request with Upgrade: h2c + HTTP2-Settings
//!     → 101 Switching Protocols
//!     → upgraded IO: client preface + SETTINGS, then the upgrade request
//!       re-encoded as HEADERS on stream 1, then the rest of the client bytes
//!     → hyper HTTP/2 connection serving the same app
//! ```
//!
//! # Design Decisions
//! - Prior-knowledge HTTP/2 never reaches this module; hyper detects the
//!   preface on its own
//! - Only requests without a body are upgraded; others are answered over
//!   HTTP/1.1, which the upgrade protocol allows
//! - Upgraded connections leave axum-server's bookkeeping, so they are
//!   tracked here and drained by `Server::shutdown`

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use std::time::Duration;

use axum::body::Body;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode, Version};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Router;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use bytes::{BufMut, Bytes, BytesMut};
use hyper::upgrade::OnUpgrade;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use hyper_util::service::TowerToHyperService;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::watch;
use tower::ServiceExt;

use crate::config::ServerConfig;
use crate::net::idle::{Activity, TrackedService};

const PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";
const FRAME_HEADER_LEN: usize = 9;
const MAX_FRAME_PAYLOAD: usize = 16_384;

const FRAME_HEADERS: u8 = 0x1;
const FRAME_CONTINUATION: u8 = 0x9;
const FLAG_END_STREAM: u8 = 0x1;
const FLAG_END_HEADERS: u8 = 0x4;

/// Headers that only mean something on the HTTP/1.1 hop.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "upgrade",
    "http2-settings",
    "host",
    "keep-alive",
    "proxy-connection",
    "transfer-encoding",
    "te",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Drain {
    Running,
    Graceful,
    Immediate,
}

/// Connections that switched to HTTP/2 after an upgrade.
#[derive(Debug)]
pub(crate) struct UpgradedConnections {
    drain: watch::Sender<Drain>,
    active: watch::Sender<usize>,
}

impl UpgradedConnections {
    pub(crate) fn new() -> Self {
        Self {
            drain: watch::channel(Drain::Running).0,
            active: watch::channel(0).0,
        }
    }

    /// Drop every upgraded connection now.
    pub(crate) fn close(&self) {
        self.drain.send_replace(Drain::Immediate);
    }

    /// Ask upgraded connections to finish; force them closed after `deadline`.
    pub(crate) fn graceful(self: &Arc<Self>, deadline: Duration) {
        let started = self.drain.send_if_modified(|drain| {
            if *drain == Drain::Running {
                *drain = Drain::Graceful;
                true
            } else {
                false
            }
        });
        if started {
            let connections = Arc::clone(self);
            tokio::spawn(async move {
                tokio::time::sleep(deadline).await;
                connections.close();
            });
        }
    }

    /// Resolves once no upgraded connection is left.
    pub(crate) async fn wait_idle(&self) {
        let mut active = self.active.subscribe();
        let _ = active.wait_for(|n| *n == 0).await;
    }

    pub(crate) fn active(&self) -> usize {
        *self.active.borrow()
    }

    fn enter(self: &Arc<Self>) -> ActiveConnection {
        self.active.send_modify(|n| *n += 1);
        ActiveConnection(Arc::clone(self))
    }
}

struct ActiveConnection(Arc<UpgradedConnections>);

impl Drop for ActiveConnection {
    fn drop(&mut self) {
        self.0.active.send_modify(|n| *n = n.saturating_sub(1));
    }
}

/// State of the upgrade middleware: the app served on upgraded connections.
pub(crate) struct H2cUpgrade {
    app: Router,
    connections: Arc<UpgradedConnections>,
    config: ServerConfig,
}

impl H2cUpgrade {
    pub(crate) fn new(app: Router, connections: Arc<UpgradedConnections>, config: ServerConfig) -> Self {
        Self {
            app,
            connections,
            config,
        }
    }

    fn spawn(
        self: &Arc<Self>,
        on_upgrade: OnUpgrade,
        stream_one: Bytes,
        remote: Option<SocketAddr>,
        activity: Activity,
    ) {
        let upgrade = Arc::clone(self);
        let active = self.connections.enter();
        tokio::spawn(async move {
            let _active = active;
            let upgraded = match on_upgrade.await {
                Ok(upgraded) => upgraded,
                Err(e) => {
                    tracing::debug!(error = %e, "h2c upgrade aborted");
                    return;
                }
            };

            // The socket below is still wrapped in its IdleStream; sharing
            // its Activity keeps open streams from counting as idle.
            let io = Splice::new(TokioIo::new(upgraded), stream_one);
            let app = upgrade.app.clone().map_request(move |mut request: Request<hyper::body::Incoming>| {
                if let Some(addr) = remote {
                    request.extensions_mut().insert(ConnectInfo(addr));
                }
                request
            });
            let service = TowerToHyperService::new(TrackedService::new(app, activity));

            let mut builder = hyper::server::conn::http2::Builder::new(TokioExecutor::new());
            builder
                .timer(TokioTimer::new())
                .max_header_list_size(u32::try_from(upgrade.config.max_header_bytes).unwrap_or(u32::MAX));
            let conn = builder.serve_connection(TokioIo::new(io), service);
            tokio::pin!(conn);

            let mut drain = upgrade.connections.drain.subscribe();
            tokio::select! {
                result = conn.as_mut() => {
                    if let Err(e) = result {
                        tracing::debug!(error = %e, "h2c connection ended with error");
                    }
                }
                _ = drained(&mut drain, |d| *d != Drain::Running) => {
                    conn.as_mut().graceful_shutdown();
                    tokio::select! {
                        _ = conn.as_mut() => {}
                        _ = drained(&mut drain, |d| *d == Drain::Immediate) => {}
                    }
                }
            }
        });
    }
}

async fn drained(drain: &mut watch::Receiver<Drain>, until: impl FnMut(&Drain) -> bool) {
    let _ = drain.wait_for(until).await;
}

/// Middleware answering `Upgrade: h2c` requests with `101 Switching Protocols`.
pub(crate) async fn upgrade_h2c(
    State(upgrade): State<Arc<H2cUpgrade>>,
    mut request: Request,
    next: Next,
) -> Response {
    if !wants_h2c(&request) {
        return next.run(request).await;
    }
    let stream_one = encode_stream_one(&request);

    let remote = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let activity = request.extensions().get::<Activity>().cloned().unwrap_or_default();
    let on_upgrade = hyper::upgrade::on(&mut request);
    upgrade.spawn(on_upgrade, stream_one, remote, activity);

    (
        StatusCode::SWITCHING_PROTOCOLS,
        [
            (header::CONNECTION, HeaderValue::from_static("Upgrade")),
            (header::UPGRADE, HeaderValue::from_static("h2c")),
        ],
        Body::empty(),
    )
        .into_response()
}

fn has_token(headers: &HeaderMap, name: header::HeaderName, token: &str) -> bool {
    headers
        .get_all(name)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|t| t.trim().eq_ignore_ascii_case(token))
}

/// An HTTP/1.1 request without a body asking for `h2c` with valid settings.
fn wants_h2c(request: &Request) -> bool {
    let headers = request.headers();
    if request.version() != Version::HTTP_11
        || !has_token(headers, header::UPGRADE, "h2c")
        || !has_token(headers, header::CONNECTION, "upgrade")
        || !has_token(headers, header::CONNECTION, "http2-settings")
    {
        return false;
    }

    let mut settings = headers.get_all("http2-settings").iter();
    let valid_settings = match (settings.next(), settings.next()) {
        (Some(value), None) => value
            .to_str()
            .ok()
            .and_then(|v| URL_SAFE_NO_PAD.decode(v.trim().trim_end_matches('=')).ok())
            .is_some_and(|payload| payload.len() % 6 == 0),
        _ => false,
    };

    let bodyless = !headers.contains_key(header::TRANSFER_ENCODING)
        && headers
            .get(header::CONTENT_LENGTH)
            .map_or(true, |v| v.as_bytes() == b"0");

    valid_settings && bodyless
}

/// The upgrade request as HEADERS (+ CONTINUATION) frames on stream 1.
fn encode_stream_one(request: &Request) -> Bytes {
    let headers = request.headers();
    let connection_named: Vec<String> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|t| t.trim().to_ascii_lowercase())
        .collect();

    let mut block = Vec::new();
    hpack_literal(&mut block, b":method", request.method().as_str().as_bytes());
    hpack_literal(&mut block, b":scheme", b"http");
    if let Some(host) = headers.get(header::HOST) {
        hpack_literal(&mut block, b":authority", host.as_bytes());
    }
    let path = request.uri().path_and_query().map_or("/", |pq| pq.as_str());
    hpack_literal(&mut block, b":path", path.as_bytes());

    for (name, value) in headers {
        let name = name.as_str();
        if HOP_BY_HOP.contains(&name) || connection_named.iter().any(|c| c == name) {
            continue;
        }
        hpack_literal(&mut block, name.as_bytes(), value.as_bytes());
    }

    header_frames(1, &block)
}

/// HPACK "literal header field without indexing, new name", no Huffman.
fn hpack_literal(dst: &mut Vec<u8>, name: &[u8], value: &[u8]) {
    dst.push(0x00);
    hpack_int(dst, 7, name.len());
    dst.extend_from_slice(name);
    hpack_int(dst, 7, value.len());
    dst.extend_from_slice(value);
}

fn hpack_int(dst: &mut Vec<u8>, prefix_bits: u8, value: usize) {
    let max = (1usize << prefix_bits) - 1;
    if value < max {
        dst.push(value as u8);
        return;
    }
    dst.push(max as u8);
    let mut rest = value - max;
    while rest >= 0x80 {
        dst.push((rest & 0x7f) as u8 | 0x80);
        rest >>= 7;
    }
    dst.push(rest as u8);
}

fn header_frames(stream_id: u32, block: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(block.len() + FRAME_HEADER_LEN * 2);
    let mut chunks = block.chunks(MAX_FRAME_PAYLOAD).peekable();
    let mut first = true;
    loop {
        let chunk = chunks.next().unwrap_or(&[]);
        let last = chunks.peek().is_none();
        let (kind, mut flags) = if first {
            (FRAME_HEADERS, FLAG_END_STREAM)
        } else {
            (FRAME_CONTINUATION, 0)
        };
        if last {
            flags |= FLAG_END_HEADERS;
        }
        let len = chunk.len() as u32;
        out.put_slice(&len.to_be_bytes()[1..]);
        out.put_u8(kind);
        out.put_u8(flags);
        out.put_u32(stream_id & 0x7fff_ffff);
        out.put_slice(chunk);
        first = false;
        if last {
            break;
        }
    }
    out.freeze()
}

enum Preface {
    Incomplete,
    Complete(usize),
    Invalid,
}

/// Where the client preface and its first frame end in `seen`.
fn preface_end(seen: &[u8]) -> Preface {
    let magic = seen.len().min(PREFACE.len());
    if seen[..magic] != PREFACE[..magic] {
        return Preface::Invalid;
    }
    let header_end = PREFACE.len() + FRAME_HEADER_LEN;
    if seen.len() < header_end {
        return Preface::Incomplete;
    }
    let at = PREFACE.len();
    let len = u32::from_be_bytes([0, seen[at], seen[at + 1], seen[at + 2]]) as usize;
    if seen.len() < header_end + len {
        Preface::Incomplete
    } else {
        Preface::Complete(header_end + len)
    }
}

enum SpliceState {
    Collecting { seen: BytesMut, stream_one: Bytes },
    Replaying(Bytes),
    Passthrough,
}

/// Upgraded IO that inserts stream 1 after the client's first frame.
struct Splice<IO> {
    inner: IO,
    state: SpliceState,
}

impl<IO> Splice<IO> {
    fn new(inner: IO, stream_one: Bytes) -> Self {
        Self {
            inner,
            state: SpliceState::Collecting {
                seen: BytesMut::new(),
                stream_one,
            },
        }
    }
}

impl<IO: AsyncRead + Unpin> AsyncRead for Splice<IO> {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            match &mut this.state {
                SpliceState::Passthrough => return Pin::new(&mut this.inner).poll_read(cx, buf),
                SpliceState::Replaying(pending) => {
                    let n = pending.len().min(buf.remaining());
                    buf.put_slice(&pending.split_to(n));
                    if pending.is_empty() {
                        this.state = SpliceState::Passthrough;
                    }
                    return Poll::Ready(Ok(()));
                }
                SpliceState::Collecting { seen, stream_one } => {
                    match preface_end(seen) {
                        Preface::Complete(end) => {
                            let mut replay = BytesMut::with_capacity(seen.len() + stream_one.len());
                            replay.put_slice(&seen[..end]);
                            replay.put_slice(stream_one);
                            replay.put_slice(&seen[end..]);
                            this.state = SpliceState::Replaying(replay.freeze());
                            continue;
                        }
                        Preface::Invalid => {
                            let replay = seen.split().freeze();
                            this.state = SpliceState::Replaying(replay);
                            continue;
                        }
                        Preface::Incomplete => {}
                    }

                    let mut chunk = [0u8; 1024];
                    let mut read = ReadBuf::new(&mut chunk);
                    ready!(Pin::new(&mut this.inner).poll_read(cx, &mut read))?;
                    if read.filled().is_empty() {
                        // EOF before the first frame: hand back what arrived.
                        let replay = seen.split().freeze();
                        if replay.is_empty() {
                            this.state = SpliceState::Passthrough;
                            return Poll::Ready(Ok(()));
                        }
                        this.state = SpliceState::Replaying(replay);
                        continue;
                    }
                    seen.extend_from_slice(read.filled());
                }
            }
        }
    }
}

impl<IO: AsyncWrite + Unpin> AsyncWrite for Splice<IO> {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
