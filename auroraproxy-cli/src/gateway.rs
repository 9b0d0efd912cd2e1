use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use http::header::{CONTENT_TYPE, HeaderValue};
use http::{Request, Response, StatusCode};
use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use reqwest_hickory_resolver::HickoryResolver;
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::config::{ProfileConfig, ScriptRewrite};

const MAX_FETCH_ATTEMPTS: u32 = 5;
const RETRY_DELAY: Duration = Duration::from_millis(500);
const DEFAULT_CONTENT_TYPE: &str = "text/html; charset=utf-8";

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Invalid origin path {path:?}: {source}")]
    Url { path: String, source: url::ParseError },

    #[error("Failed to fetch {url} after {attempts} attempts: {source}")]
    Fetch {
        url: Url,
        attempts: u32,
        source: reqwest::Error,
    },
}

// ============================================================================
// Rewriting
// ============================================================================

/// Maps local request paths onto the origin and patches the pages it
/// returns so their scripts open the WebSocket through the local relay.
#[derive(Debug, Clone)]
pub struct Rewriter {
    path_prefix: String,
    rewrite_pages: Vec<String>,
    endpoint_reference: String,
    endpoint_replacement: String,
    script_rewrites: Vec<ScriptRewrite>,
}

impl Rewriter {
    pub fn new(profile: &ProfileConfig) -> Self {
        Self {
            path_prefix: profile.path_prefix.clone(),
            rewrite_pages: profile.rewrite_pages.clone(),
            endpoint_reference: profile.endpoint_reference.clone(),
            endpoint_replacement: format!("+\"{}\"", profile.relay_listen),
            script_rewrites: profile.script_rewrites.clone(),
        }
    }

    /// Path and query to request from the origin.
    pub fn origin_path(&self, path_and_query: &str) -> String {
        let marker = self.path_prefix.trim_matches('/');
        if marker.is_empty() || path_and_query.contains(marker) {
            path_and_query.to_string()
        } else {
            format!("{}{}", self.path_prefix.trim_end_matches('/'), path_and_query)
        }
    }

    pub fn rewrite(&self, local_path: &str, origin_path: &str, mut body: String) -> String {
        if self.rewrite_pages.iter().any(|page| page == local_path) {
            if !self.endpoint_reference.is_empty() {
                body = body.replace(&self.endpoint_reference, &self.endpoint_replacement);
            }
            body = body.replace("wss:", "ws:");
        }

        for rule in &self.script_rewrites {
            if !rule.find.is_empty() && origin_path.contains(&rule.marker) {
                body = body.replace(&rule.find, &rule.replace);
            }
        }

        body
    }
}

// ============================================================================
// Gateway
// ============================================================================

#[derive(Debug)]
enum Body {
    /// Decoded from the origin charset; served as UTF-8.
    Text(String),
    /// Passed through byte for byte.
    Raw(Bytes),
}

#[derive(Debug)]
struct Page {
    status: StatusCode,
    content_type: Option<HeaderValue>,
    body: Body,
}

fn parse_mime(content_type: Option<&HeaderValue>) -> Option<mime::Mime> {
    content_type?.to_str().ok()?.parse().ok()
}

/// Text and script bodies are rewritten. A missing content type counts as
/// HTML.
fn is_rewritable(content_type: Option<&HeaderValue>) -> bool {
    if content_type.is_none() {
        return true;
    }
    parse_mime(content_type).is_some_and(|parsed| {
        parsed.type_() == mime::TEXT
            || parsed.subtype() == mime::JAVASCRIPT
            || parsed.subtype().as_str().ends_with("ecmascript")
    })
}

/// `content_type` relabelled for a body re-encoded as UTF-8.
fn utf8_content_type(content_type: Option<&HeaderValue>) -> HeaderValue {
    parse_mime(content_type)
        .and_then(|parsed| HeaderValue::from_str(&format!("{}; charset=utf-8", parsed.essence_str())).ok())
        .unwrap_or_else(|| HeaderValue::from_static(DEFAULT_CONTENT_TYPE))
}

pub struct Gateway {
    client: reqwest::Client,
    origin: Url,
    rewriter: Rewriter,
    retry_delay: Duration,
}

impl Gateway {
    pub fn new(profile: &ProfileConfig) -> Result<Self> {
        let origin = Url::parse(&format!("https://{}", profile.origin_host))
            .with_context(|| format!("Invalid origin host {:?}", profile.origin_host))?;
        Self::with_origin(profile, origin)
    }

    pub fn with_origin(profile: &ProfileConfig, origin: Url) -> Result<Self> {
        let client = reqwest::Client::builder()
            .dns_resolver(Arc::new(HickoryResolver::default()))
            .user_agent(profile.user_agent.as_str())
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            origin,
            rewriter: Rewriter::new(profile),
            retry_delay: RETRY_DELAY,
        })
    }

    #[cfg(test)]
    fn set_retry_delay(&mut self, delay: Duration) {
        self.retry_delay = delay;
    }

    pub async fn handle<B>(&self, req: Request<B>) -> Result<Response<Full<Bytes>>, Infallible> {
        let local_path = req.uri().path();
        let path_and_query = req.uri().path_and_query().map_or("/", |p| p.as_str());
        let origin_path = self.rewriter.origin_path(path_and_query);
        debug!("{} {} -> {}", req.method(), path_and_query, origin_path);

        let response = match self.fetch(&origin_path).await {
            Ok(Page {
                status,
                content_type,
                body: Body::Text(text),
            }) => {
                let body = self.rewriter.rewrite(local_path, &origin_path, text);
                let content_type = utf8_content_type(content_type.as_ref());
                respond(status, Some(content_type), Bytes::from(body))
            }
            Ok(Page {
                status,
                content_type,
                body: Body::Raw(bytes),
            }) => respond(status, content_type, bytes),
            Err(e) => {
                error!("{}", e);
                respond(
                    StatusCode::BAD_GATEWAY,
                    Some(HeaderValue::from_static("text/plain; charset=utf-8")),
                    Bytes::from(e.to_string()),
                )
            }
        };
        Ok(response)
    }

    async fn fetch(&self, origin_path: &str) -> Result<Page, GatewayError> {
        let url = self.origin.join(origin_path).map_err(|source| GatewayError::Url {
            path: origin_path.to_string(),
            source,
        })?;

        let mut attempt = 1;
        loop {
            match self.fetch_once(&url).await {
                Ok(page) => return Ok(page),
                Err(e) if attempt < MAX_FETCH_ATTEMPTS => {
                    warn!(
                        "Failed to fetch {} (attempt {}/{}): {}",
                        url, attempt, MAX_FETCH_ATTEMPTS, e
                    );
                    attempt += 1;
                    tokio::time::sleep(self.retry_delay).await;
                }
                Err(source) => {
                    return Err(GatewayError::Fetch {
                        url,
                        attempts: attempt,
                        source,
                    });
                }
            }
        }
    }

    async fn fetch_once(&self, url: &Url) -> Result<Page, reqwest::Error> {
        let response = self.client.get(url.clone()).send().await?;
        let status = response.status();
        let content_type = response.headers().get(CONTENT_TYPE).cloned();
        let body = if is_rewritable(content_type.as_ref()) {
            Body::Text(response.text().await?)
        } else {
            Body::Raw(response.bytes().await?)
        };
        Ok(Page {
            status,
            content_type,
            body,
        })
    }

    /// Serves HTTP/1.1 on `listener` until the task is dropped.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        info!("Page gateway listening on http://{}", listener.local_addr()?);

        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                    continue;
                }
            };

            let gateway = self.clone();
            tokio::spawn(async move {
                let service = service_fn(move |req| {
                    let gateway = gateway.clone();
                    async move { gateway.handle(req).await }
                });
                if let Err(e) = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await
                {
                    debug!("Connection from {} closed: {}", peer, e);
                }
            });
        }
    }

    pub async fn bind(self, addr: SocketAddr) -> Result<()> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind gateway on {addr}"))?;
        Arc::new(self).serve(listener).await
    }
}

fn respond(status: StatusCode, content_type: Option<HeaderValue>, body: Bytes) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body));
    *response.status_mut() = status;
    if let Some(content_type) = content_type {
        response.headers_mut().insert(CONTENT_TYPE, content_type);
    }
    response
}
