use std::net::SocketAddr;

use axum::extract::rejection::JsonRejection;
use axum::extract::{ConnectInfo, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::Json;
use tracing::info;

use streambridge_protocol::{RegisterRequest, RegisterResponse, TcpEndpoint};

use crate::app_state::AppState;
use crate::config::Config;
use crate::registry::RegisterError;
use crate::responses;
use crate::session::rfc3339;

/// `POST /register`: declare a file and receive the capability token plus
/// the TCP endpoint for the stream connection.
pub async fn register(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    payload: Result<Json<RegisterRequest>, JsonRejection>,
) -> Response {
    let Json(req) = match payload {
        Ok(json) => json,
        Err(_) => return responses::bad_request("invalid JSON body"),
    };

    let (token, expires_at) =
        match state
            .registry()
            .register(&req.filename, req.size, peer.to_string())
        {
            Ok(minted) => minted,
            Err(RegisterError::EmptyFilename) => {
                return responses::bad_request("filename is required")
            }
            Err(err @ RegisterError::Oversize { .. }) => {
                return responses::payload_too_large(&err.to_string())
            }
            Err(RegisterError::TokenMint(detail)) => {
                return responses::service_unavailable(&detail)
            }
        };

    let config = state.config();
    let host = public_host(config, &headers);
    let download_url = download_url(config, &headers, &token, &req.filename);

    info!(target: "sb::http", token = %token, filename = %req.filename, "file registered");
    Json(RegisterResponse {
        auth_token: token,
        tcp_endpoint: TcpEndpoint {
            host,
            port: config.tcp_port,
        },
        download_url,
        expires_at: rfc3339(expires_at),
        original_filename: req.filename,
    })
    .into_response()
}

/// Host the provider and consumer should reach this bridge on: the public
/// base URL when configured, else the request's `Host` minus any port.
fn public_host(config: &Config, headers: &HeaderMap) -> String {
    if let Some(base) = &config.public_base_url {
        if let Some(host) = host_of_base_url(base) {
            return host;
        }
    }
    request_host(headers)
}

/// Download URL handed back to the provider. With a configured base URL the
/// request headers are ignored entirely; otherwise scheme and host come
/// from the reverse-proxy headers, and the HTTP port is appended only on
/// the plain-HTTP path (a fronting proxy owns the HTTPS port mapping).
fn download_url(config: &Config, headers: &HeaderMap, token: &str, filename: &str) -> String {
    let escaped = urlencoding::encode(filename);
    if let Some(base) = &config.public_base_url {
        return format!("{base}/download/{token}/{escaped}");
    }
    let scheme = forwarded_scheme(headers).unwrap_or("http");
    let host = request_host(headers);
    let port = if scheme == "https" {
        String::new()
    } else {
        format!(":{}", config.http_port)
    };
    format!("{scheme}://{host}{port}/download/{token}/{escaped}")
}

fn forwarded_scheme(headers: &HeaderMap) -> Option<&str> {
    for name in ["x-forwarded-proto", "x-forwarded-scheme"] {
        if let Some(value) = headers.get(name).and_then(|v| v.to_str().ok()) {
            if !value.is_empty() {
                return Some(value);
            }
        }
    }
    None
}

fn request_host(headers: &HeaderMap) -> String {
    let host = headers
        .get(axum::http::header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("localhost");
    strip_port(host).to_string()
}

/// `example.org:8000` -> `example.org`, `[::1]:8000` -> `[::1]`.
fn strip_port(host: &str) -> &str {
    if let Some(end) = host.rfind(']') {
        // Bracketed IPv6 literal; anything after the bracket is a port.
        return &host[..=end];
    }
    match host.rsplit_once(':') {
        Some((name, port)) if port.chars().all(|c| c.is_ascii_digit()) => name,
        _ => host,
    }
}

fn host_of_base_url(base: &str) -> Option<String> {
    let rest = base.split_once("://").map(|(_, rest)| rest).unwrap_or(base);
    let authority = rest.split('/').next()?;
    if authority.is_empty() {
        return None;
    }
    Some(strip_port(authority).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(
                axum::http::HeaderName::from_bytes(name.as_bytes()).unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        map
    }

    fn config() -> Config {
        Config::default()
    }

    #[test]
    fn plain_http_urls_carry_the_configured_port() {
        let url = download_url(
            &config(),
            &headers(&[("host", "bridge.local:9999")]),
            "tok123",
            "a.txt",
        );
        assert_eq!(url, "http://bridge.local:8000/download/tok123/a.txt");
    }

    #[test]
    fn forwarded_https_omits_the_port() {
        let url = download_url(
            &config(),
            &headers(&[("host", "files.example.org"), ("x-forwarded-proto", "https")]),
            "tok123",
            "a.txt",
        );
        assert_eq!(url, "https://files.example.org/download/tok123/a.txt");
    }

    #[test]
    fn x_forwarded_scheme_is_honored_too() {
        let url = download_url(
            &config(),
            &headers(&[("host", "files.example.org"), ("x-forwarded-scheme", "https")]),
            "tok123",
            "a.txt",
        );
        assert!(url.starts_with("https://"));
    }

    #[test]
    fn filenames_are_path_escaped() {
        let url = download_url(
            &config(),
            &headers(&[("host", "bridge.local")]),
            "tok123",
            "my report.pdf",
        );
        assert!(url.ends_with("/download/tok123/my%20report.pdf"));
    }

    #[test]
    fn public_base_url_overrides_request_headers() {
        let cfg = Config {
            public_base_url: Some("https://ffb.example".into()),
            ..Config::default()
        };
        let url = download_url(
            &cfg,
            &headers(&[("host", "internal:8000")]),
            "tok123",
            "a.txt",
        );
        assert_eq!(url, "https://ffb.example/download/tok123/a.txt");
        assert_eq!(public_host(&cfg, &headers(&[("host", "internal:8000")])), "ffb.example");
    }

    #[test]
    fn strip_port_handles_ipv6_literals() {
        assert_eq!(strip_port("example.org:8000"), "example.org");
        assert_eq!(strip_port("example.org"), "example.org");
        assert_eq!(strip_port("[::1]:8000"), "[::1]");
        assert_eq!(strip_port("[::1]"), "[::1]");
    }
}
