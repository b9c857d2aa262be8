//! Blocking HTTP exchange with a proxy server.

use std::error::Error as _;
use std::io::{BufReader, Write};
use std::time::Duration;

use reqwest::blocking::{Body, Client, Response};
use reqwest::header::CONTENT_TYPE;
use tracing::{debug, instrument};

use crate::core::frame::MAX_FRAME_LEN;
use crate::core::types::ErrorBody;
use crate::error::ProxyError;
use crate::marshal::WireRequest;
use crate::unmarshal::{Outcome, Unmarshaler};

/// Environment variable holding the server URL.
pub const URL_ENV: &str = "LAB_DEVICE_PROXY_URL";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct ProxyClient {
    url: String,
    http: Client,
}

impl ProxyClient {
    /// `url` may omit the scheme (`mylab:8084`); `http://` is assumed.
    pub fn new(url: &str) -> Result<Self, ProxyError> {
        let url = normalize_url(url)?;
        // Commands such as `adb logcat` run until interrupted, so only
        // connecting is bounded.
        let http = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(None::<Duration>)
            .build()
            .map_err(|err| ProxyError::Transport(describe(&err)))?;
        Ok(Self { url, http })
    }

    /// Send the request and apply the response to the given streams and the
    /// request's output paths.
    #[instrument(skip_all, fields(command = request.command(), url = %self.url))]
    pub fn run<O: Write, E: Write>(
        &self,
        request: WireRequest,
        stdout: O,
        stderr: E,
    ) -> Result<Outcome, ProxyError> {
        let outputs = request.outputs();
        let response = self.send(request)?;
        let reader = BufReader::with_capacity(MAX_FRAME_LEN, response);
        let outcome = Unmarshaler::new(outputs, stdout, stderr).consume(reader)?;
        debug!(exit_code = outcome.exit_code, "remote command finished");
        Ok(outcome)
    }

    /// Stream the request body and return the response once the server has
    /// accepted it.
    pub fn send(&self, request: WireRequest) -> Result<Response, ProxyError> {
        let response = self
            .http
            .post(&self.url)
            .header(CONTENT_TYPE, "application/octet-stream")
            .body(Body::new(request.into_body()))
            .send()
            .map_err(|err| ProxyError::Transport(describe(&err)))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let text = response.text().unwrap_or_default();
        let body = serde_json::from_str::<ErrorBody>(&text).ok();
        debug!(status = status.as_u16(), body = %text, "request rejected");
        Err(ProxyError::from_body(status.as_u16(), body))
    }

    /// Check that the server is up.
    pub fn health(&self) -> Result<(), ProxyError> {
        let url = format!("{}/healthz", self.url.trim_end_matches('/'));
        let response = self
            .http
            .get(&url)
            .send()
            .map_err(|err| ProxyError::Transport(describe(&err)))?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(ProxyError::Server(format!(
                "health check returned HTTP {}",
                response.status()
            )))
        }
    }
}

fn normalize_url(url: &str) -> Result<String, ProxyError> {
    let url = url.trim();
    if url.is_empty() {
        return Err(ProxyError::Usage("proxy server URL is empty".to_string()));
    }
    if url.starts_with("http://") || url.starts_with("https://") {
        Ok(url.to_string())
    } else if url.contains("://") {
        Err(ProxyError::Usage(format!(
            "unsupported proxy URL {url:?}: only http and https are supported"
        )))
    } else {
        Ok(format!("http://{url}"))
    }
}

/// reqwest hides the interesting part (connection refused, DNS failure) in
/// the source chain.
fn describe(err: &reqwest::Error) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_host_port_gets_http_scheme() {
        assert_eq!(
            normalize_url("mylab:8084").expect("url"),
            "http://mylab:8084"
        );
        assert_eq!(
            normalize_url(" https://lab.example/proxy ").expect("url"),
            "https://lab.example/proxy"
        );
    }

    #[test]
    fn rejects_other_schemes() {
        assert!(matches!(
            normalize_url("ftp://lab"),
            Err(ProxyError::Usage(_))
        ));
        assert!(matches!(normalize_url(""), Err(ProxyError::Usage(_))));
    }

    #[test]
    fn unreachable_server_is_transport_error() {
        let client = ProxyClient::new("127.0.0.1:1").expect("client");
        let request = crate::marshal::marshal(&["idevice_id", "-l"]).expect("marshal");
        let err = client
            .run(request, Vec::new(), Vec::new())
            .expect_err("nothing listens on port 1");
        assert!(matches!(err, ProxyError::Transport(_)), "{err}");
        assert_eq!(err.exit_code(), crate::exit_codes::TRANSPORT);
    }
}
