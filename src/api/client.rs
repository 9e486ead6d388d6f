use std::time::Duration;

use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::header::{ACCEPT, AUTHORIZATION};
use reqwest::StatusCode;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::error::{ConsultaError, Result};
use crate::session::{KeyValueStore, SessionStore};
use crate::settings::Settings;

/// Blocking JSON client for the consultation backend. Cheap to clone, so
/// dashboard workers each take their own copy.
#[derive(Clone)]
pub struct ApiClient {
    http: Client,
    base_url: String,
    token: Option<String>,
}

impl std::fmt::Debug for ApiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiClient")
            .field("base_url", &self.base_url)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl ApiClient {
    pub fn new(settings: &Settings, token: Option<String>) -> Result<Self> {
        let mut builder = Client::builder();
        if let Some(secs) = settings.request_timeout_secs {
            builder = builder.timeout(Duration::from_secs(secs));
        }
        Ok(Self {
            http: builder.build()?,
            base_url: settings.api_base_url.trim_end_matches('/').to_string(),
            token,
        })
    }

    /// Client for the public auth endpoints.
    pub fn anonymous(settings: &Settings) -> Result<Self> {
        Self::new(settings, None)
    }

    /// Client carrying the stored bearer token.
    pub fn from_session<S: KeyValueStore>(
        settings: &Settings,
        store: &SessionStore<S>,
    ) -> Result<Self> {
        let token = store.token().ok_or(ConsultaError::NotAuthenticated)?;
        Self::new(settings, Some(token))
    }

    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorized(&self, req: RequestBuilder) -> RequestBuilder {
        let req = req.header(ACCEPT, "application/json");
        match &self.token {
            Some(token) => req.header(AUTHORIZATION, format!("Bearer {token}")),
            None => req,
        }
    }

    pub(crate) fn get_json(&self, path: &str, fallback: &str) -> Result<Value> {
        debug!(method = "GET", path, "request");
        let resp = self.send(self.http.get(self.url(path)), fallback)?;
        read_json(resp)
    }

    pub(crate) fn post_json<B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
        fallback: &str,
    ) -> Result<Value> {
        debug!(method = "POST", path, "request");
        let resp = self.send(self.http.post(self.url(path)).json(body), fallback)?;
        read_json(resp)
    }

    pub(crate) fn put_json<B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
        fallback: &str,
    ) -> Result<Value> {
        debug!(method = "PUT", path, "request");
        let resp = self.send(self.http.put(self.url(path)).json(body), fallback)?;
        read_json(resp)
    }

    /// POST JSON and return the raw response body.
    pub(crate) fn post_bytes<B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
        fallback: &str,
    ) -> Result<Vec<u8>> {
        debug!(method = "POST", path, "request");
        let resp = self.send(self.http.post(self.url(path)).json(body), fallback)?;
        Ok(resp.bytes()?.to_vec())
    }

    fn send(&self, req: RequestBuilder, fallback: &str) -> Result<Response> {
        let resp = self.authorized(req).send()?;
        let status = resp.status();
        debug!(status = status.as_u16(), "response");
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().unwrap_or_default();
        Err(error_for_status(status, &body, fallback, self.token.is_some()))
    }
}

/// Map a non-success response to an error. With a token attached, 401/403
/// always means the session is no longer valid; without one (login, password
/// recovery) the backend's own message is kept.
pub fn error_for_status(
    status: StatusCode,
    body: &str,
    fallback: &str,
    authenticated: bool,
) -> ConsultaError {
    if authenticated && matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
        return ConsultaError::SessionExpired;
    }
    let message = match serde_json::from_str::<Value>(body) {
        Ok(json) => message_of(&json).unwrap_or_else(|| fallback.to_string()),
        Err(_) => status
            .canonical_reason()
            .map(str::to_string)
            .unwrap_or_else(|| fallback.to_string()),
    };
    ConsultaError::Api {
        status: status.as_u16(),
        message,
    }
}

fn message_of(json: &Value) -> Option<String> {
    let map = json.as_object()?;
    map.iter()
        .find(|(k, _)| k.eq_ignore_ascii_case("message"))
        .and_then(|(_, v)| v.as_str())
        .filter(|m| !m.trim().is_empty())
        .map(str::to_string)
}

fn read_json(resp: Response) -> Result<Value> {
    let text = resp.text()?;
    if text.trim().is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_str(&text).map_err(|e| {
        ConsultaError::Other(format!("the server sent a response that is not JSON: {e}"))
    })
}

#[cfg(test)]
pub(crate) mod testing {
    use std::io::{BufRead, BufReader, Read, Write};
    use std::net::TcpListener;
    use std::thread::JoinHandle;

    use crate::settings::Settings;

    /// A request as the one-shot server saw it.
    #[derive(Debug)]
    pub struct Captured {
        pub request_line: String,
        pub headers: Vec<(String, String)>,
        pub body: String,
    }

    impl Captured {
        pub fn header(&self, name: &str) -> Option<&str> {
            self.headers
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(name))
                .map(|(_, v)| v.as_str())
        }

        pub fn json(&self) -> serde_json::Value {
            serde_json::from_str(&self.body).unwrap()
        }
    }

    /// Serve exactly one canned response on a random local port.
    pub fn serve_once(
        status: &str,
        content_type: &str,
        body: impl Into<Vec<u8>>,
    ) -> (Settings, JoinHandle<Captured>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let status = status.to_string();
        let content_type = content_type.to_string();
        let body = body.into();
        let handle = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream.try_clone().unwrap());
            let mut request_line = String::new();
            reader.read_line(&mut request_line).unwrap();
            let mut headers = Vec::new();
            loop {
                let mut line = String::new();
                reader.read_line(&mut line).unwrap();
                let line = line.trim_end();
                if line.is_empty() {
                    break;
                }
                if let Some((k, v)) = line.split_once(':') {
                    headers.push((k.trim().to_string(), v.trim().to_string()));
                }
            }
            let len = headers
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case("content-length"))
                .and_then(|(_, v)| v.parse::<usize>().ok())
                .unwrap_or(0);
            let mut buf = vec![0u8; len];
            reader.read_exact(&mut buf).unwrap();

            let head = format!(
                "HTTP/1.1 {status}\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                body.len()
            );
            stream.write_all(head.as_bytes()).unwrap();
            stream.write_all(&body).unwrap();
            stream.flush().unwrap();
            Captured {
                request_line: request_line.trim_end().to_string(),
                headers,
                body: String::from_utf8_lossy(&buf).into_owned(),
            }
        });
        let settings = Settings {
            api_base_url: format!("http://{addr}"),
            ..Settings::default()
        };
        (settings, handle)
    }

    pub fn serve_json(status: &str, body: &str) -> (Settings, JoinHandle<Captured>) {
        serve_once(status, "application/json", body.as_bytes().to_vec())
    }
}
