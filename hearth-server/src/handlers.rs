//! Page handlers

use crate::context::{RequestContext, USER_KEY};
use crate::error::HandlerError;
use crate::recorder::ResponseRecorder;
use crate::render::Renderer;
use crate::router::Handler;
use crate::stats::StatsStore;
use async_trait::async_trait;
use bytes::Bytes;
use hyper::header::{HeaderValue, CONTENT_TYPE, LOCATION};
use hyper::{Request, StatusCode};
use serde_json::{json, Value};
use std::sync::Arc;

/// Rows shown per table on the statistics page
const STATS_ROWS: usize = 50;

fn render_html(
    renderer: &dyn Renderer,
    w: &mut ResponseRecorder,
    name: &str,
    data: &Value,
) -> Result<(), HandlerError> {
    let page = renderer.render(name, data)?;
    w.headers().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/html; charset=utf-8"),
    );
    w.write(&page);
    Ok(())
}

/// Home page
pub struct IndexPage {
    pub renderer: Arc<dyn Renderer>,
}

#[async_trait]
impl Handler for IndexPage {
    async fn handle(
        &self,
        w: &mut ResponseRecorder,
        _req: &Request<Bytes>,
        ctx: &mut RequestContext,
        partial: bool,
    ) -> Result<(), HandlerError> {
        let flashes = ctx.session.take_flashes();
        render_html(
            self.renderer.as_ref(),
            w,
            "pages/index.html",
            &json!({
                "ctx": ctx.to_value(),
                "flashes": flashes,
                "partial": partial,
            }),
        )
    }
}

/// Traffic statistics page
pub struct StatsPage {
    pub renderer: Arc<dyn Renderer>,
    pub stats: Arc<StatsStore>,
}

#[async_trait]
impl Handler for StatsPage {
    async fn handle(
        &self,
        w: &mut ResponseRecorder,
        _req: &Request<Bytes>,
        ctx: &mut RequestContext,
        partial: bool,
    ) -> Result<(), HandlerError> {
        let report = self.stats.report(STATS_ROWS);

        render_html(
            self.renderer.as_ref(),
            w,
            "pages/stats.html",
            &json!({
                "ctx": ctx.to_value(),
                "partial": partial,
                "requests": report.total_requests,
                "bytes": report.total_bytes,
                "session_requests": report.session_requests,
                "session_bytes": report.session_bytes,
                "uptime_secs": self.stats.uptime().as_secs(),
                "paths": report.paths,
                "referrers": report.referrers,
            }),
        )
    }
}

/// Drops the signed-in user from the session and goes home
pub struct Logout;

#[async_trait]
impl Handler for Logout {
    async fn handle(
        &self,
        w: &mut ResponseRecorder,
        _req: &Request<Bytes>,
        ctx: &mut RequestContext,
        _partial: bool,
    ) -> Result<(), HandlerError> {
        ctx.session.remove(USER_KEY);
        ctx.user = None;
        w.headers().insert(LOCATION, HeaderValue::from_static("/"));
        w.set_status(StatusCode::FOUND);
        Ok(())
    }
}

/// Fallback for unmatched routes
pub struct NotFound;

#[async_trait]
impl Handler for NotFound {
    async fn handle(
        &self,
        _w: &mut ResponseRecorder,
        _req: &Request<Bytes>,
        _ctx: &mut RequestContext,
        _partial: bool,
    ) -> Result<(), HandlerError> {
        Err(HandlerError::not_found())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::TeraRenderer;
    use crate::stats::{ExclusionPolicy, Visit};
    use hearth_common::SiteConfig;

    fn request() -> Request<Bytes> {
        Request::builder().uri("/").body(Bytes::new()).unwrap()
    }

    fn renderer() -> Arc<dyn Renderer> {
        Arc::new(TeraRenderer::new(None).unwrap())
    }

    #[tokio::test]
    async fn test_index_consumes_flashes() {
        let handler = IndexPage {
            renderer: renderer(),
        };
        let mut ctx = RequestContext::fallback(SiteConfig::default());
        ctx.session.add_flash("Welcome!");
        let mut w = ResponseRecorder::new();

        handler.handle(&mut w, &request(), &mut ctx, false).await.unwrap();
        let body = String::from_utf8(w.body().to_vec()).unwrap();
        assert!(body.contains("Welcome!"));
        assert!(ctx.session.take_flashes().is_empty());
        assert_eq!(w.headers()[CONTENT_TYPE], "text/html; charset=utf-8");
    }

    #[tokio::test]
    async fn test_stats_page_lists_trimmed_referrers() {
        let path = std::env::temp_dir().join(format!(
            "hearth-handlers-{}-stats.dat",
            std::process::id()
        ));
        let _ = std::fs::remove_file(&path);
        let stats = Arc::new(StatsStore::open(&path, ExclusionPolicy::none()).unwrap());
        let long = format!("https://example.com/{}", "a".repeat(200));
        stats.record_request(&Visit {
            path: "/blog".into(),
            referrer: long.clone(),
            ref_param: String::new(),
            bytes: 10,
        });

        let handler = StatsPage {
            renderer: renderer(),
            stats,
        };
        let mut ctx = RequestContext::fallback(SiteConfig::default());
        let mut w = ResponseRecorder::new();
        handler.handle(&mut w, &request(), &mut ctx, false).await.unwrap();

        let body = String::from_utf8(w.body().to_vec()).unwrap();
        assert!(body.contains("&#x2F;blog"));
        assert!(!body.contains(&long));
        assert!(body.contains(&long[..64].replace('/', "&#x2F;")));
    }

    #[tokio::test]
    async fn test_logout_clears_user_and_redirects() {
        let mut ctx = RequestContext::fallback(SiteConfig::default());
        ctx.session.insert(USER_KEY, "42");
        ctx.session.insert("name", "kept");
        ctx.session.add_flash("signed out");
        let mut w = ResponseRecorder::new();

        Logout.handle(&mut w, &request(), &mut ctx, false).await.unwrap();
        assert_eq!(w.status(), Some(StatusCode::FOUND));
        assert_eq!(w.headers()[LOCATION], "/");
        assert!(ctx.session.get(USER_KEY).is_none());
        assert!(ctx.user.is_none());

        // only the user key goes
        assert_eq!(ctx.session.get_str("name"), Some("kept"));
        assert_eq!(ctx.session.take_flashes(), vec!["signed out".to_string()]);
    }

    #[tokio::test]
    async fn test_not_found() {
        let mut ctx = RequestContext::fallback(SiteConfig::default());
        let mut w = ResponseRecorder::new();
        let err = NotFound
            .handle(&mut w, &request(), &mut ctx, false)
            .await
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
    }
}
