//! In-memory response buffering
//!
//! Handlers write into a [`ResponseRecorder`] instead of the connection. The
//! pipeline can still add headers after the handler returns, and the whole
//! response is copied onto the real writer in a single [`ResponseRecorder::apply`].

use bytes::{Bytes, BytesMut};
use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::header::{HeaderMap, HeaderName};
use hyper::{Response, StatusCode};
use std::convert::Infallible;
use std::io;

/// The sink a buffered response is applied to.
pub trait ResponseWriter {
    fn headers_mut(&mut self) -> &mut HeaderMap;

    fn write_status(&mut self, status: StatusCode);

    fn write_body(&mut self, buf: &[u8]) -> io::Result<usize>;
}

/// Buffers status, headers and body for one request.
#[derive(Debug, Default)]
pub struct ResponseRecorder {
    status: Option<StatusCode>,
    headers: Option<HeaderMap>,
    body: BytesMut,
}

impl ResponseRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_status(&mut self, status: StatusCode) {
        self.status = Some(status);
    }

    /// Status set by the handler, if any.
    pub fn status(&self) -> Option<StatusCode> {
        self.status
    }

    /// The header map, created on first access and reused afterwards.
    pub fn headers(&mut self) -> &mut HeaderMap {
        self.headers.get_or_insert_with(HeaderMap::new)
    }

    /// Append to the body. Never fails.
    pub fn write(&mut self, buf: &[u8]) -> usize {
        self.body.extend_from_slice(buf);
        buf.len()
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Copy the buffered response onto `writer`: headers first, then the
    /// status (200 when none was set), then the body.
    ///
    /// Consumes the recorder, so a response can only be applied once.
    /// Returns the number of body bytes the writer accepted and the status
    /// that was emitted.
    pub fn apply<W: ResponseWriter>(self, writer: &mut W) -> (StatusCode, io::Result<usize>) {
        if let Some(headers) = self.headers {
            let target = writer.headers_mut();
            let mut current: Option<HeaderName> = None;
            // `HeaderMap::into_iter` yields the name only for the first value
            // of each key; later values of the same key come with `None`.
            for (name, value) in headers {
                if let Some(name) = name {
                    target.remove(&name);
                    current = Some(name);
                }
                if let Some(name) = &current {
                    target.append(name.clone(), value);
                }
            }
        }

        let status = self.status.unwrap_or(StatusCode::OK);
        writer.write_status(status);
        (status, writer.write_body(&self.body))
    }
}

impl io::Write for ResponseRecorder {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Ok(ResponseRecorder::write(self, buf))
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// The network-facing writer: collects what is applied to it and becomes the
/// `hyper::Response` handed back to the connection.
#[derive(Debug, Default)]
pub struct LiveResponse {
    status: Option<StatusCode>,
    headers: HeaderMap,
    body: Vec<u8>,
}

impl LiveResponse {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn into_response(self) -> Response<BoxBody<Bytes, Infallible>> {
        let mut response = Response::new(full_body(self.body));
        *response.status_mut() = self.status.unwrap_or(StatusCode::OK);
        *response.headers_mut() = self.headers;
        response
    }
}

impl ResponseWriter for LiveResponse {
    fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    fn write_status(&mut self, status: StatusCode) {
        self.status = Some(status);
    }

    fn write_body(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.body.extend_from_slice(buf);
        Ok(buf.len())
    }
}

/// Create a full body response
pub fn full_body(data: impl Into<Bytes>) -> BoxBody<Bytes, Infallible> {
    Full::new(data.into()).boxed()
}
