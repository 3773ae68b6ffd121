//! HTTP relay: executes a coordinator-supplied request from a given local address

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use gridrelay_proto::{HttpRelayRequest, HttpRelayResponse};
use hyper_legacy::ext::ReasonPhrase;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::redirect::Policy;
use reqwest::{Method, Url};
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error};

use crate::cookie_store::SessionCookieStore;

/// Maximum redirects followed per relayed request
const MAX_REDIRECTS: usize = 10;

/// Errors caused by a malformed relay request
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("invalid URL '{0}'")]
    InvalidUrl(String),

    #[error("invalid method '{0}'")]
    InvalidMethod(String),

    #[error("invalid header '{0}'")]
    InvalidHeader(String),

    #[error("invalid base64 body: {0}")]
    InvalidBody(#[from] base64::DecodeError),

    #[error("failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),
}

/// Title-case every `-`-separated segment: `x-forwarded-for` → `X-Forwarded-For`
pub fn prettify_header_name(name: &str) -> String {
    name.split('-')
        .map(|segment| {
            let mut chars = segment.chars();
            match chars.next() {
                Some(first) => first
                    .to_uppercase()
                    .chain(chars.flat_map(char::to_lowercase))
                    .collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<String>>()
        .join("-")
}

/// Executes relayed HTTP requests, keeping cookie continuity per session
#[derive(Debug, Clone)]
pub struct HttpRelay {
    cookies: SessionCookieStore,
    timeout: Duration,
}

impl HttpRelay {
    pub fn new(cookies: SessionCookieStore, timeout: Duration) -> Self {
        Self { cookies, timeout }
    }

    pub fn cookies(&self) -> &SessionCookieStore {
        &self.cookies
    }

    /// Execute `request` with `local_addr` as the source address.
    ///
    /// Network, TLS and timeout failures are logged and yield `Ok(None)`.
    pub async fn execute(
        &self,
        request: HttpRelayRequest,
        local_addr: IpAddr,
    ) -> Result<Option<HttpRelayResponse>, RelayError> {
        let url =
            Url::parse(&request.url).map_err(|_| RelayError::InvalidUrl(request.url.clone()))?;
        let method = Method::from_bytes(request.method.to_ascii_uppercase().as_bytes())
            .map_err(|_| RelayError::InvalidMethod(request.method.clone()))?;
        let headers = build_headers(&request.headers)?;
        let body = match request.body.as_deref() {
            Some(encoded) if !encoded.is_empty() => Some(BASE64.decode(encoded)?),
            _ => None,
        };

        let mut builder = reqwest::Client::builder()
            .local_address(local_addr)
            .http1_title_case_headers()
            .redirect(Policy::limited(MAX_REDIRECTS))
            .timeout(self.timeout);

        // Every request opens the session; cookies only flow when authenticated
        let jar = self.cookies.get_or_create(&request.session_id);
        if request.authenticated {
            builder = builder.cookie_provider(jar);
        }

        let client = builder.build().map_err(RelayError::Client)?;

        let mut outbound = client.request(method.clone(), url.clone()).headers(headers);
        if let Some(body) = body {
            outbound = outbound.body(body);
        }

        debug!("[FETCH] {} {} {}", local_addr, method, url);

        let response = match outbound.send().await {
            Ok(response) => response,
            Err(e) => {
                error!("[FETCH ERROR] {} {} {}: {}", local_addr, method, url, e);
                return Ok(None);
            }
        };

        let final_url = response.url().to_string();
        let status = response.status();
        let status_text = reason_phrase(&response);
        let headers = flatten_headers(response.headers());

        let body = match response.bytes().await {
            Ok(bytes) => bytes,
            Err(e) => {
                error!(
                    "[FETCH ERROR] {} {} {}: reading body failed: {}",
                    local_addr, method, url, e
                );
                return Ok(None);
            }
        };

        Ok(Some(HttpRelayResponse {
            url: final_url,
            status: status.as_u16(),
            status_text,
            headers,
            body: BASE64.encode(&body),
        }))
    }
}

/// Reason phrase as sent by the server, falling back to the canonical one
fn reason_phrase(response: &reqwest::Response) -> String {
    match response.extensions().get::<ReasonPhrase>() {
        Some(reason) => String::from_utf8_lossy(reason.as_bytes()).into_owned(),
        None => response
            .status()
            .canonical_reason()
            .unwrap_or_default()
            .to_string(),
    }
}

/// Header names are stored lowercase; the client writes them in the
/// [`prettify_header_name`] form on the wire.
fn build_headers(headers: &BTreeMap<String, String>) -> Result<HeaderMap, RelayError> {
    let mut map = HeaderMap::with_capacity(headers.len());

    for (name, value) in headers {
        let header_name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| RelayError::InvalidHeader(name.clone()))?;
        let header_value =
            HeaderValue::from_str(value).map_err(|_| RelayError::InvalidHeader(name.clone()))?;
        map.append(header_name, header_value);
    }

    Ok(map)
}

/// Collapse a header map into name → value, joining repeats with ", " and
/// dropping pseudo-headers
fn flatten_headers(headers: &HeaderMap) -> BTreeMap<String, String> {
    let mut flat: BTreeMap<String, String> = BTreeMap::new();

    for (name, value) in headers {
        let name = name.as_str();
        if name.starts_with(':') {
            continue;
        }
        let value = String::from_utf8_lossy(value.as_bytes()).into_owned();
        flat.entry(name.to_string())
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(&value);
            })
            .or_insert(value);
    }

    flat
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prettify_header_name() {
        assert_eq!(prettify_header_name("content-type"), "Content-Type");
        assert_eq!(prettify_header_name("X-FORWARDED-FOR"), "X-Forwarded-For");
        assert_eq!(prettify_header_name("accept"), "Accept");
        assert_eq!(prettify_header_name("sec-ch-ua"), "Sec-Ch-Ua");
        assert_eq!(prettify_header_name("a--b"), "A--B");
    }

    #[test]
    fn test_build_headers_merges_case_variants() {
        let mut headers = BTreeMap::new();
        headers.insert("accept-language".to_string(), "en".to_string());
        headers.insert("ACCEPT-LANGUAGE".to_string(), "fr".to_string());

        let map = build_headers(&headers).unwrap();
        let values: Vec<_> = map.get_all("accept-language").iter().collect();
        assert_eq!(values.len(), 2);
    }

    #[test]
    fn test_build_headers_rejects_invalid_name() {
        let mut headers = BTreeMap::new();
        headers.insert("bad header".to_string(), "x".to_string());
        assert!(matches!(
            build_headers(&headers),
            Err(RelayError::InvalidHeader(_))
        ));
    }

    #[test]
    fn test_flatten_headers_joins_repeats() {
        let mut map = HeaderMap::new();
        map.append("set-cookie", HeaderValue::from_static("a=1"));
        map.append("set-cookie", HeaderValue::from_static("b=2"));
        map.insert("content-type", HeaderValue::from_static("text/plain"));

        let flat = flatten_headers(&map);
        assert_eq!(flat["set-cookie"], "a=1, b=2");
        assert_eq!(flat["content-type"], "text/plain");
    }

    #[tokio::test]
    async fn test_unsupported_url_is_an_error() {
        let relay = HttpRelay::new(
            SessionCookieStore::new(Duration::from_secs(60)),
            Duration::from_secs(5),
        );
        let request = HttpRelayRequest {
            url: "not a url".to_string(),
            method: "GET".to_string(),
            headers: BTreeMap::new(),
            body: None,
            session_id: "s1".to_string(),
            authenticated: false,
            device_ip: None,
        };

        let result = relay.execute(request, "127.0.0.1".parse().unwrap()).await;
        assert!(matches!(result, Err(RelayError::InvalidUrl(_))));
        assert!(relay.cookies().is_empty());
    }
}
