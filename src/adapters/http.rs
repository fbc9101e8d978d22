//! HTTP(S) client adapter.
//!
//! Implements [`HttpPort`] for both the LAN bridge (plain HTTP) and the
//! cloud thermostat API (TLS via the ESP-IDF certificate bundle).  Every
//! request runs on a fresh `EspHttpConnection` with a bounded timeout, and
//! response bodies are capped at [`MAX_RESPONSE_BYTES`].
//!
//! The simulation backend answers from a table of canned responses matched
//! by method and URL substring, and records every request for inspection.

use core::time::Duration;

use log::{debug, warn};

use crate::app::ports::{HttpMethod, HttpPort, HttpRequest, HttpResponse};
use crate::error::HttpError;

/// Largest response body accepted.
pub const MAX_RESPONSE_BYTES: usize = 32 * 1024;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

pub struct HttpAdapter {
    timeout: Duration,
    #[cfg(not(target_os = "espidf"))]
    sim: SimServer,
}

/// Request captured by the simulation backend.
#[cfg(not(target_os = "espidf"))]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedRequest {
    pub method: HttpMethod,
    pub url: String,
    pub body: Vec<u8>,
    pub bearer: Option<String>,
}

#[cfg(not(target_os = "espidf"))]
#[derive(Default)]
struct SimServer {
    routes: Vec<SimRoute>,
    requests: Vec<RecordedRequest>,
}

#[cfg(not(target_os = "espidf"))]
struct SimRoute {
    method: HttpMethod,
    url_part: String,
    answer: Result<HttpResponse, HttpError>,
}

impl HttpAdapter {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            #[cfg(not(target_os = "espidf"))]
            sim: SimServer::default(),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Simulation: answer requests whose URL contains `url_part`.  Later
    /// routes take precedence over earlier ones.
    #[cfg(not(target_os = "espidf"))]
    pub fn respond(&mut self, method: HttpMethod, url_part: &str, status: u16, body: &str) {
        self.sim.routes.push(SimRoute {
            method,
            url_part: url_part.to_owned(),
            answer: Ok(HttpResponse {
                status,
                body: body.as_bytes().to_vec(),
            }),
        });
    }

    /// Simulation: fail requests whose URL contains `url_part`.
    #[cfg(not(target_os = "espidf"))]
    pub fn fail(&mut self, method: HttpMethod, url_part: &str, error: HttpError) {
        self.sim.routes.push(SimRoute {
            method,
            url_part: url_part.to_owned(),
            answer: Err(error),
        });
    }

    #[cfg(not(target_os = "espidf"))]
    pub fn requests(&self) -> &[RecordedRequest] {
        &self.sim.requests
    }

    #[cfg(target_os = "espidf")]
    fn platform_send(&mut self, request: &HttpRequest<'_>) -> Result<HttpResponse, HttpError> {
        use embedded_svc::http::Method;
        use embedded_svc::http::client::Client;
        use embedded_svc::io::{Read, Write};
        use esp_idf_svc::http::client::{Configuration, EspHttpConnection};

        let conf = Configuration {
            timeout: Some(self.timeout),
            crt_bundle_attach: Some(esp_idf_svc::sys::esp_crt_bundle_attach),
            ..Default::default()
        };
        let conn = EspHttpConnection::new(&conf).map_err(|e| map_esp_error(e.code()))?;
        let mut client = Client::wrap(conn);

        let method = match request.method {
            HttpMethod::Get => Method::Get,
            HttpMethod::Post => Method::Post,
            HttpMethod::Put => Method::Put,
        };
        let body = request.body.unwrap_or(&[]);
        let length = body.len().to_string();
        let auth = request.bearer.map(|t| format!("Bearer {}", t));

        let mut headers: heapless::Vec<(&str, &str), 4> = heapless::Vec::new();
        let _ = headers.push(("accept", "application/json"));
        if let Some(ct) = request.content_type {
            let _ = headers.push(("content-type", ct));
        }
        if let Some(auth) = auth.as_deref() {
            let _ = headers.push(("authorization", auth));
        }
        if request.body.is_some() {
            let _ = headers.push(("content-length", length.as_str()));
        }

        let mut req = client
            .request(method, request.url, &headers)
            .map_err(|e| map_esp_error(e.0.code()))?;
        if !body.is_empty() {
            req.write_all(body).map_err(|e| map_esp_error(e.0.code()))?;
            req.flush().map_err(|e| map_esp_error(e.0.code()))?;
        }
        let mut resp = req.submit().map_err(|e| map_esp_error(e.0.code()))?;
        let status = resp.status();

        let mut out = Vec::new();
        let mut chunk = [0u8; 512];
        loop {
            let n = resp.read(&mut chunk).map_err(|e| map_esp_error(e.0.code()))?;
            if n == 0 {
                break;
            }
            if out.len() + n > MAX_RESPONSE_BYTES {
                return Err(HttpError::BodyTooLarge);
            }
            out.extend_from_slice(&chunk[..n]);
        }
        Ok(HttpResponse { status, body: out })
    }

    #[cfg(not(target_os = "espidf"))]
    fn platform_send(&mut self, request: &HttpRequest<'_>) -> Result<HttpResponse, HttpError> {
        self.sim.requests.push(RecordedRequest {
            method: request.method,
            url: request.url.to_owned(),
            body: request.body.map(<[u8]>::to_vec).unwrap_or_default(),
            bearer: request.bearer.map(str::to_owned),
        });
        let route = self
            .sim
            .routes
            .iter()
            .rev()
            .find(|r| r.method == request.method && request.url.contains(r.url_part.as_str()))
            .ok_or(HttpError::Connect)?;
        let resp = route.answer.clone()?;
        if resp.body.len() > MAX_RESPONSE_BYTES {
            return Err(HttpError::BodyTooLarge);
        }
        Ok(resp)
    }
}

/// Collapse esp-http-client error codes onto the port's error kinds.
#[cfg(target_os = "espidf")]
fn map_esp_error(code: esp_idf_svc::sys::esp_err_t) -> HttpError {
    use esp_idf_svc::sys::{
        ESP_ERR_HTTP_CONNECT, ESP_ERR_HTTP_CONNECTING, ESP_ERR_HTTP_EAGAIN, ESP_ERR_TIMEOUT,
    };
    match code as u32 {
        ESP_ERR_HTTP_CONNECT | ESP_ERR_HTTP_CONNECTING => HttpError::Connect,
        ESP_ERR_HTTP_EAGAIN | ESP_ERR_TIMEOUT => HttpError::Timeout,
        _ => HttpError::Io,
    }
}

impl HttpPort for HttpAdapter {
    fn send(&mut self, request: &HttpRequest<'_>) -> Result<HttpResponse, HttpError> {
        let result = self.platform_send(request);
        match &result {
            Ok(resp) => debug!(
                "HTTP: {:?} {} -> {} ({} bytes)",
                request.method,
                redact_query(request.url),
                resp.status,
                resp.body.len()
            ),
            Err(e) => warn!(
                "HTTP: {:?} {} failed: {}",
                request.method,
                redact_query(request.url),
                e
            ),
        }
        result
    }
}

/// Drop the query string and any bridge username path segment from a URL
/// before it reaches the log.
fn redact_query(url: &str) -> &str {
    let end = url.find('?').unwrap_or(url.len());
    let url = &url[..end];
    match url.find("/api/") {
        Some(i) => &url[..i + 4],
        None => url,
    }
}
