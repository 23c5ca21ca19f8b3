//! In-process HTTP responder standing in for web servers, aria2, Drive and the Bot API.

use std::{
    convert::Infallible,
    sync::{Arc, Mutex},
};

use axum::{
    Router,
    body::{Body, Bytes},
    extract::State,
    http::{HeaderMap, Method, Uri},
    response::Response,
};
use tokio::net::TcpListener;

/// A request as seen by the fake server.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: String,
    /// Path including the query string.
    pub path: String,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl Request {
    /// Header named `name`.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Body parsed as JSON.
    pub fn json(&self) -> serde_json::Value {
        serde_json::from_slice(&self.body).unwrap()
    }
}

/// A canned response.
#[derive(Debug, Clone)]
pub struct Reply {
    status: u16,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
    with_length: bool,
}

impl Reply {
    pub fn ok(body: Vec<u8>) -> Self {
        Self {
            status: 200,
            headers: Vec::new(),
            body,
            with_length: true,
        }
    }

    pub fn status(status: u16) -> Self {
        Self {
            status,
            ..Self::ok(Vec::new())
        }
    }

    pub fn json(value: &serde_json::Value) -> Self {
        Self::ok(value.to_string().into_bytes()).header("Content-Type", "application/json")
    }

    #[must_use]
    pub fn with_status(mut self, status: u16) -> Self {
        self.status = status;
        self
    }

    #[must_use]
    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    /// Stream the body without `Content-Length`.
    #[must_use]
    pub const fn without_length(mut self) -> Self {
        self.with_length = false;
        self
    }

    fn into_response(self) -> Response {
        let body = if self.with_length {
            Body::from(self.body)
        } else {
            let chunk = Bytes::from(self.body);
            Body::from_stream(futures::stream::once(async move {
                Ok::<_, Infallible>(chunk)
            }))
        };

        let mut response = Response::builder().status(self.status);
        for (name, value) in &self.headers {
            response = response.header(name, value);
        }
        response.body(body).unwrap()
    }
}

type Handler = dyn Fn(&Request) -> Reply + Send + Sync;

/// State shared by every connection.
struct Shared {
    handler: Box<Handler>,
    requests: Mutex<Vec<Request>>,
}

/// A running fake server.
pub struct Server {
    /// `http://127.0.0.1:<port>`.
    pub url: String,
    shared: Arc<Shared>,
}

impl Server {
    /// Every request received so far.
    pub fn requests(&self) -> Vec<Request> {
        self.shared.requests.lock().unwrap().clone()
    }
}

/// Record the request and answer it with the test's handler.
async fn respond(
    State(shared): State<Arc<Shared>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let request = Request {
        method: method.to_string(),
        path: uri
            .path_and_query()
            .map_or_else(|| uri.path().to_string(), ToString::to_string),
        headers,
        body: body.to_vec(),
    };
    shared.requests.lock().unwrap().push(request.clone());
    (shared.handler)(&request).into_response()
}

/// Start a server answering every request with `handler`.
pub async fn serve<F>(handler: F) -> Server
where
    F: Fn(&Request) -> Reply + Send + Sync + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}", listener.local_addr().unwrap());
    let shared = Arc::new(Shared {
        handler: Box::new(handler),
        requests: Mutex::new(Vec::new()),
    });

    let app = Router::new()
        .fallback(respond)
        .with_state(Arc::clone(&shared));
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    Server { url, shared }
}

/// A bot talking to `server` instead of Telegram.
pub fn bot(server: &Server) -> teloxide::Bot {
    teloxide::Bot::new("1234:TEST").set_api_url(server.url.parse().unwrap())
}

/// Bot API `Message` object sent by the bot into a private chat.
pub fn bot_message(chat_id: i64, message_id: i32, text: &str) -> serde_json::Value {
    serde_json::json!({
        "message_id": message_id,
        "date": 1_700_000_000,
        "chat": {"id": chat_id, "type": "private", "first_name": "Ada"},
        "from": {"id": 1234, "is_bot": true, "first_name": "Relay"},
        "text": text
    })
}

/// Status slot remembering every edit.
#[derive(Default)]
pub struct RecordingSlot {
    edits: Mutex<Vec<String>>,
}

impl RecordingSlot {
    pub fn edits(&self) -> Vec<String> {
        self.edits.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl crate::status::StatusSlot for RecordingSlot {
    async fn edit(&self, text: String) -> Result<(), crate::error::TransportError> {
        self.edits.lock().unwrap().push(text);
        Ok(())
    }
}
