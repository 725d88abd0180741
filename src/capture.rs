//! Response body handling for forwarded requests
//!
//! Most replies are streamed straight through. JSON replies to app creation
//! are buffered instead so backend addresses inside them can be rewritten to
//! the gateway's own origin.

use crate::dispatch::{at_origin_boundary, RouteKind};
use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::{Body, Bytes};
use hyper::header::{HeaderMap, HeaderValue, ACCEPT, CONTENT_LENGTH, TRANSFER_ENCODING};
use hyper::Response;
use tracing::debug;

/// How a backend response body reaches the client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodySink {
    /// Pass the body through as it arrives
    Stream,
    /// Buffer the body and rewrite backend origins in it
    Capture,
}

impl BodySink {
    /// Decide the sink before forwarding, from the route and request headers
    pub fn for_request(kind: RouteKind, headers: &HeaderMap) -> Self {
        let wants_json = headers
            .get_all(ACCEPT)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .any(|v| v.contains("application/json"));

        if kind == RouteKind::CreateApp && wants_json {
            BodySink::Capture
        } else {
            BodySink::Stream
        }
    }

    pub async fn finish<B>(
        self,
        response: Response<B>,
        backend_origin: &str,
        client_origin: &str,
    ) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error>
    where
        B: Body<Data = Bytes, Error = hyper::Error> + Send + Sync + 'static,
    {
        let (mut parts, body) = response.into_parts();
        match self {
            BodySink::Stream => Ok(Response::from_parts(parts, body.boxed())),
            BodySink::Capture => {
                let raw = body.collect().await?.to_bytes();
                let rewritten = replace_origin(raw, backend_origin, client_origin);
                debug!(bytes = rewritten.len(), "Captured creation reply");

                parts.headers.remove(TRANSFER_ENCODING);
                parts
                    .headers
                    .insert(CONTENT_LENGTH, HeaderValue::from(rewritten.len()));
                let body = Full::new(rewritten).map_err(|never| match never {}).boxed();
                Ok(Response::from_parts(parts, body))
            }
        }
    }
}

/// Replace occurrences of the origin `from` in a UTF-8 body. An occurrence
/// followed by more host or port text belongs to some other origin and is
/// kept. Non-UTF-8 bodies are returned untouched.
fn replace_origin(raw: Bytes, from: &str, to: &str) -> Bytes {
    let text = match std::str::from_utf8(&raw) {
        Ok(text) if !from.is_empty() && text.contains(from) => text,
        _ => return raw,
    };

    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(at) = rest.find(from) {
        out.push_str(&rest[..at]);
        let after = &rest[at + from.len()..];
        out.push_str(if at_origin_boundary(after) { to } else { from });
        rest = after;
    }
    out.push_str(rest);
    Bytes::from(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::StatusCode;

    fn headers(accept: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_str(accept).unwrap());
        headers
    }

    fn backend_reply(body: &'static str) -> Response<BoxBody<Bytes, hyper::Error>> {
        Response::builder()
            .status(StatusCode::CREATED)
            .header(CONTENT_LENGTH, body.len())
            .body(Full::new(Bytes::from(body)).map_err(|never| match never {}).boxed())
            .unwrap()
    }

    #[test]
    fn test_only_json_creation_is_captured() {
        let json = headers("application/json");
        assert_eq!(BodySink::for_request(RouteKind::CreateApp, &json), BodySink::Capture);
        assert_eq!(BodySink::for_request(RouteKind::AppApi, &json), BodySink::Stream);
        assert_eq!(
            BodySink::for_request(RouteKind::CreateApp, &headers("text/plain")),
            BodySink::Stream
        );
        assert_eq!(
            BodySink::for_request(RouteKind::CreateApp, &HeaderMap::new()),
            BodySink::Stream
        );
    }

    #[tokio::test]
    async fn test_capture_rewrites_backend_origin() {
        let reply = backend_reply(r#"{"name":"myapp","url":"http://10.0.0.1:8080/myapp"}"#);

        let response = BodySink::Capture
            .finish(reply, "http://10.0.0.1:8080", "http://gw.example.com")
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::CREATED);
        let expected = r#"{"name":"myapp","url":"http://gw.example.com/myapp"}"#;
        assert_eq!(
            response.headers().get(CONTENT_LENGTH).unwrap(),
            &HeaderValue::from(expected.len())
        );
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(body, Bytes::from(expected));
    }

    #[tokio::test]
    async fn test_stream_leaves_body_alone() {
        let reply = backend_reply("building http://10.0.0.1:8080/myapp");

        let response = BodySink::Stream
            .finish(reply, "http://10.0.0.1:8080", "http://gw")
            .await
            .unwrap();

        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(body, Bytes::from("building http://10.0.0.1:8080/myapp"));
    }

    #[tokio::test]
    async fn test_capture_keeps_origins_that_merely_share_a_prefix() {
        let reply = backend_reply(r#"{"url":"http://10.0.0.1/myapp","peer":"http://10.0.0.12:8080/other"}"#);

        let response = BodySink::Capture
            .finish(reply, "http://10.0.0.1", "http://gw")
            .await
            .unwrap();

        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(
            body,
            Bytes::from(r#"{"url":"http://gw/myapp","peer":"http://10.0.0.12:8080/other"}"#)
        );
    }

    #[test]
    fn test_bare_origin_in_body_is_replaced() {
        let raw = Bytes::from(r#"{"runner":"http://10.0.0.1:8080","log":"see http://10.0.0.1:8080 now"}"#);
        assert_eq!(
            replace_origin(raw, "http://10.0.0.1:8080", "http://gw"),
            Bytes::from(r#"{"runner":"http://gw","log":"see http://gw now"}"#)
        );
    }

    #[test]
    fn test_binary_body_is_untouched() {
        let raw = Bytes::from_static(&[0xff, 0xfe, b'h', b't']);
        assert_eq!(replace_origin(raw.clone(), "ht", "xx"), raw);
    }
}
