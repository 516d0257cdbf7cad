//! Buffered request pipeline
//!
//! One exchange moves through these stages:
//!
//! ```text
//! Created -> ContextBuilt -> HandlerRan -> SessionPersisted -> Applied -> Logged
//! ```
//!
//! The handler runs against a [`ResponseRecorder`], so the session cookie can
//! be added after it returns and the response reaches the connection in one
//! piece. Failures before `Applied` replace the recorder with an error page;
//! they are never retried. Bookkeeping is handed to the traffic worker once
//! the response is built.

use crate::access_log::AccessLogEntry;
use crate::context::RequestContext;
use crate::error::{error_message, HandlerError, PipelineError};
use crate::recorder::{LiveResponse, ResponseRecorder};
use crate::render::Renderer;
use crate::router::Router;
use crate::session::SessionCodec;
use crate::store::DocumentStore;
use crate::traffic::{TrafficHandle, TrafficRecord};
use bytes::Bytes;
use chrono::Local;
use futures::FutureExt;
use hearth_common::{HearthConfig, SiteConfig};
use http_body_util::{combinators::BoxBody, BodyExt, LengthLimitError, Limited};
use hyper::body::Incoming;
use hyper::header::{HeaderValue, CONTENT_TYPE, REFERER, SET_COOKIE, USER_AGENT};
use hyper::{Request, Response, StatusCode};
use serde_json::json;
use std::any::Any;
use std::convert::Infallible;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, error, trace, warn};

/// Header marking a PJAX (partial page) request
pub const PJAX_HEADER: &str = "x-pjax";

/// Header a local reverse proxy uses to pass on the client address
pub const REAL_IP_HEADER: &str = "x-real-ip";

/// Largest request body read into memory unless configured otherwise
pub const DEFAULT_BODY_LIMIT: usize = 10 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Created,
    ContextBuilt,
    HandlerRan,
    SessionPersisted,
    Applied,
    Logged,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Created => "created",
            Stage::ContextBuilt => "context-built",
            Stage::HandlerRan => "handler-ran",
            Stage::SessionPersisted => "session-persisted",
            Stage::Applied => "applied",
            Stage::Logged => "logged",
        };
        f.write_str(name)
    }
}

/// Wraps the routed handlers with session handling, buffering and
/// bookkeeping. Shared by every connection.
pub struct Pipeline {
    router: Router,
    codec: SessionCodec,
    store: Arc<dyn DocumentStore>,
    renderer: Arc<dyn Renderer>,
    config: Arc<RwLock<HearthConfig>>,
    traffic: TrafficHandle,
    body_limit: usize,
}

impl Pipeline {
    pub fn new(
        router: Router,
        codec: SessionCodec,
        store: Arc<dyn DocumentStore>,
        renderer: Arc<dyn Renderer>,
        config: Arc<RwLock<HearthConfig>>,
        traffic: TrafficHandle,
    ) -> Self {
        Self {
            router,
            codec,
            store,
            renderer,
            config,
            traffic,
            body_limit: DEFAULT_BODY_LIMIT,
        }
    }

    /// Refuse request bodies longer than `limit` bytes with 413.
    pub fn with_body_limit(mut self, limit: usize) -> Self {
        self.body_limit = limit;
        self
    }

    /// Serve a request straight off the connection.
    pub async fn serve(
        &self,
        req: Request<Incoming>,
        remote_addr: SocketAddr,
    ) -> Response<BoxBody<Bytes, Infallible>> {
        let (parts, body) = req.into_parts();
        match Limited::new(body, self.body_limit).collect().await {
            Ok(collected) => {
                self.dispatch(Request::from_parts(parts, collected.to_bytes()), remote_addr)
                    .await
            }
            Err(e) => {
                let req = Request::from_parts(parts, Bytes::new());
                let err = if e.is::<LengthLimitError>() {
                    PipelineError::TooLarge(self.body_limit)
                } else {
                    PipelineError::Body(e)
                };
                warn!("{} {}: {}", req.method(), req.uri().path(), err);
                let site = self.site().await;
                let recorder = self.error_page(
                    err.status(),
                    &RequestContext::fallback(site),
                    is_partial(&req),
                );
                self.finish(&req, remote_addr, recorder)
            }
        }
    }

    /// Run one buffered request through every stage.
    pub async fn dispatch(
        &self,
        req: Request<Bytes>,
        remote_addr: SocketAddr,
    ) -> Response<BoxBody<Bytes, Infallible>> {
        let site = self.site().await;
        let partial = is_partial(&req);
        let mut stage = Stage::Created;

        let recorder = match self.run(&req, site.clone(), partial, &mut stage).await {
            Ok(recorder) => recorder,
            Err(err) => {
                error!(
                    "{} {} failed after stage {}: {}",
                    req.method(),
                    req.uri().path(),
                    stage,
                    err
                );
                self.error_page(err.status(), &RequestContext::fallback(site), partial)
            }
        };

        self.finish(&req, remote_addr, recorder)
    }

    async fn site(&self) -> SiteConfig {
        self.config.read().await.site.clone()
    }

    /// Context, handler and session; everything up to the apply.
    async fn run(
        &self,
        req: &Request<Bytes>,
        site: SiteConfig,
        partial: bool,
        stage: &mut Stage,
    ) -> Result<ResponseRecorder, PipelineError> {
        let mut ctx =
            RequestContext::build(req.headers(), &self.codec, self.store.as_ref(), site).await?;
        *stage = Stage::ContextBuilt;

        let handler = self.router.lookup(req.method(), req.uri().path());
        let mut recorder = ResponseRecorder::new();
        let outcome = AssertUnwindSafe(handler.handle(&mut recorder, req, &mut ctx, partial))
            .catch_unwind()
            .await;

        let mut recorder = match outcome {
            Ok(Ok(())) => recorder,
            // Expected refusals still get the visitor's session back
            Ok(Err(HandlerError::Status(status))) => {
                debug!("{} {} -> {}", req.method(), req.uri().path(), status);
                self.error_page(status, &ctx, partial)
            }
            Ok(Err(e)) => return Err(e.into()),
            Err(panic) => return Err(PipelineError::Panic(panic_message(panic))),
        };
        *stage = Stage::HandlerRan;

        let cookie = self.codec.encode(&ctx.session)?;
        recorder.headers().append(SET_COOKIE, cookie);
        *stage = Stage::SessionPersisted;

        Ok(recorder)
    }

    /// Apply the recorder and queue the bookkeeping.
    fn finish(
        &self,
        req: &Request<Bytes>,
        remote_addr: SocketAddr,
        recorder: ResponseRecorder,
    ) -> Response<BoxBody<Bytes, Infallible>> {
        let mut live = LiveResponse::new();
        let (status, written) = recorder.apply(&mut live);
        let bytes = match written {
            Ok(n) => n as u64,
            Err(e) => {
                error!("Failed to write response for {}: {}", req.uri().path(), e);
                0
            }
        };
        trace!("{} {} {}", req.uri().path(), Stage::Applied, status);

        self.traffic
            .record(traffic_record(req, remote_addr, status, bytes));
        trace!("{} {}", req.uri().path(), Stage::Logged);

        live.into_response()
    }

    /// The standard error page for `status`, falling back to plain text when
    /// the template cannot be rendered.
    fn error_page(
        &self,
        status: StatusCode,
        ctx: &RequestContext,
        partial: bool,
    ) -> ResponseRecorder {
        let mut recorder = ResponseRecorder::new();
        recorder.set_status(status);
        let message = error_message(status);

        let data = json!({
            "ctx": ctx.to_value(),
            "code": status.as_u16(),
            "message": message,
            "partial": partial,
        });
        match self.renderer.render("_error.html", &data) {
            Ok(page) => {
                recorder.headers().insert(
                    CONTENT_TYPE,
                    HeaderValue::from_static("text/html; charset=utf-8"),
                );
                recorder.write(&page);
            }
            Err(e) => {
                warn!("Failed to render error page: {}", e);
                recorder.headers().insert(
                    CONTENT_TYPE,
                    HeaderValue::from_static("text/plain; charset=utf-8"),
                );
                recorder.write(format!("{} {}", status.as_u16(), message).as_bytes());
            }
        }
        recorder
    }
}

fn is_partial<B>(req: &Request<B>) -> bool {
    req.headers().contains_key(PJAX_HEADER)
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// The peer address, or `X-Real-IP` when a local proxy forwarded the request
fn client_ip<B>(req: &Request<B>, remote_addr: SocketAddr) -> IpAddr {
    let peer = remote_addr.ip();
    if !peer.is_loopback() {
        return peer;
    }
    req.headers()
        .get(REAL_IP_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(peer)
}

fn header_str<B>(req: &Request<B>, name: impl hyper::header::AsHeaderName) -> String {
    req.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string()
}

fn traffic_record<B>(
    req: &Request<B>,
    remote_addr: SocketAddr,
    status: StatusCode,
    bytes: u64,
) -> TrafficRecord {
    let query = req.uri().query().unwrap_or("");
    let ref_param = url::form_urlencoded::parse(query.as_bytes())
        .find(|(key, _)| key == "ref")
        .map(|(_, value)| value.into_owned())
        .unwrap_or_default();

    TrafficRecord {
        entry: AccessLogEntry {
            client: client_ip(req, remote_addr),
            timestamp: Local::now(),
            method: req.method().to_string(),
            path: req.uri().path().to_string(),
            query: query.to_string(),
            protocol: format!("{:?}", req.version()),
            status: status.as_u16(),
            bytes,
            referrer: header_str(req, REFERER),
            user_agent: header_str(req, USER_AGENT),
        },
        ref_param,
    }
}
