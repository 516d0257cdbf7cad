//! Handler trait and route table

use crate::context::RequestContext;
use crate::error::HandlerError;
use crate::recorder::ResponseRecorder;
use async_trait::async_trait;
use bytes::Bytes;
use hyper::{Method, Request};
use std::sync::Arc;

/// Business logic for one route.
///
/// Handlers write only to the recorder and the context's session; the
/// pipeline decides when and whether anything reaches the client.
/// `partial` is set for PJAX requests that want the page body without the
/// surrounding layout.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn handle(
        &self,
        w: &mut ResponseRecorder,
        req: &Request<Bytes>,
        ctx: &mut RequestContext,
        partial: bool,
    ) -> Result<(), HandlerError>;
}

pub type BoxedHandler = Arc<dyn Handler>;

struct Route {
    method: Method,
    pattern: String,
    handler: BoxedHandler,
}

/// Method + path table. Patterns are exact paths or end in `*` for a prefix.
pub struct Router {
    routes: Vec<Route>,
    not_found: BoxedHandler,
}

impl Router {
    pub fn new(not_found: impl Handler) -> Self {
        Self {
            routes: Vec::new(),
            not_found: Arc::new(not_found),
        }
    }

    pub fn route(mut self, method: Method, pattern: &str, handler: impl Handler) -> Self {
        self.routes.push(Route {
            method,
            pattern: pattern.to_string(),
            handler: Arc::new(handler),
        });
        self
    }

    /// First route registered for `method` whose pattern matches `path`
    pub fn lookup(&self, method: &Method, path: &str) -> BoxedHandler {
        self.routes
            .iter()
            .find(|r| r.method == *method && matches_route(path, &r.pattern))
            .map(|r| r.handler.clone())
            .unwrap_or_else(|| self.not_found.clone())
    }
}

/// Check if path matches route pattern
fn matches_route(path: &str, pattern: &str) -> bool {
    if pattern.ends_with("/*") {
        let prefix = pattern.trim_end_matches("/*");
        path.starts_with(prefix)
    } else if pattern.ends_with('*') {
        let prefix = pattern.trim_end_matches('*');
        path.starts_with(prefix)
    } else {
        path == pattern || (path.len() > 1 && path.trim_end_matches('/') == pattern)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Tag(&'static str);

    #[async_trait]
    impl Handler for Tag {
        async fn handle(
            &self,
            w: &mut ResponseRecorder,
            _req: &Request<Bytes>,
            _ctx: &mut RequestContext,
            _partial: bool,
        ) -> Result<(), HandlerError> {
            w.write(self.0.as_bytes());
            Ok(())
        }
    }

    async fn run(router: &Router, method: Method, path: &str) -> String {
        let handler = router.lookup(&method, path);
        let req = Request::builder().uri(path).body(Bytes::new()).unwrap();
        let mut ctx = RequestContext::fallback(Default::default());
        let mut w = ResponseRecorder::new();
        handler.handle(&mut w, &req, &mut ctx, false).await.unwrap();
        String::from_utf8(w.body().to_vec()).unwrap()
    }

    #[test]
    fn test_matches_route() {
        assert!(matches_route("/blog", "/blog"));
        assert!(matches_route("/blog/", "/blog"));
        assert!(!matches_route("/blogs", "/blog"));
        assert!(matches_route("/assets/site.css", "/assets/*"));
        assert!(matches_route("/blog/read/hello", "/blog/read/*"));
        assert!(!matches_route("/", "/blog/*"));
    }

    #[tokio::test]
    async fn test_lookup_by_method_and_path() {
        let router = Router::new(Tag("missing"))
            .route(Method::GET, "/login", Tag("form"))
            .route(Method::POST, "/login", Tag("submit"))
            .route(Method::GET, "/blog/read/*", Tag("post"));

        assert_eq!(run(&router, Method::GET, "/login").await, "form");
        assert_eq!(run(&router, Method::POST, "/login").await, "submit");
        assert_eq!(run(&router, Method::GET, "/blog/read/first").await, "post");
        assert_eq!(run(&router, Method::DELETE, "/login").await, "missing");
        assert_eq!(run(&router, Method::GET, "/nope").await, "missing");
    }
}
