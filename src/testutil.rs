//! Shared HTTP mocking helper for tests that exercise network paths.

use std::sync::Arc;

use wiremock::matchers::method;
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

type Responder = dyn Fn(&str) -> Option<(u16, &'static str, Vec<u8>)> + Send + Sync;

/// Serves canned responses keyed by request path. The responder maps a
/// path to (status, content type, body); `None` means a plain 404.
pub struct TestServer {
    server: MockServer,
}

struct PathResponder(Arc<Responder>);

impl Respond for PathResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        match (self.0)(request.url.path()) {
            Some((status, content_type, body)) => {
                ResponseTemplate::new(status).set_body_raw(body, content_type)
            }
            None => ResponseTemplate::new(404).set_body_raw(b"not found".to_vec(), "text/plain"),
        }
    }
}

impl TestServer {
    pub async fn start<F>(responder: F) -> Self
    where
        F: Fn(&str) -> Option<(u16, &'static str, Vec<u8>)> + Send + Sync + 'static,
    {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(PathResponder(Arc::new(responder)))
            .mount(&server)
            .await;
        Self { server }
    }

    pub fn url(&self) -> String {
        self.server.uri()
    }
}
