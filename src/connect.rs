use crate::auth::Authenticator;
use crate::config::AuthenticationConfig;
use crate::server::{text_response, ProxyServer};
use crate::stats::UpstreamCounters;
use crate::upstream::{tag_suffix, Upstream};
use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::ext::ReasonPhrase;
use hyper::header::{HeaderValue, PROXY_AUTHENTICATE};
use hyper::upgrade::OnUpgrade;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use log::{debug, error, info, warn};
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

const TUNNEL_BUF_SIZE: usize = 32 * 1024;
const TUNNEL_READ_TIMEOUT: Duration = Duration::from_secs(30);

impl ProxyServer {
    /// End-to-end handling of one CONNECT request: account, authenticate,
    /// select an upstream, dial it, forward the CONNECT handshake, then hand
    /// the detached client stream to a spawned tunnel task.
    ///
    /// "Success" here means the tunnel was established; errors during the
    /// splice close the tunnel but do not demote the counted outcome.
    pub(crate) async fn handle_connect(
        self: Arc<Self>,
        req: Request<Incoming>,
        auth: &AuthenticationConfig,
    ) -> Response<Full<Bytes>> {
        let started = Instant::now();
        self.stats.begin_request();

        if !Authenticator::check_connect(auth, req.headers()) {
            self.stats.record_failure();
            self.stats.end_request();
            let mut response = text_response(
                StatusCode::PROXY_AUTHENTICATION_REQUIRED,
                "Proxy Authentication Required",
            );
            response.headers_mut().insert(
                PROXY_AUTHENTICATE,
                HeaderValue::from_static("Basic realm=\"Proxy\""),
            );
            return response;
        }

        let target = match req.uri().authority() {
            Some(authority) => authority.to_string(),
            None => {
                self.stats.record_failure();
                self.stats.end_request();
                return text_response(StatusCode::BAD_REQUEST, "Invalid CONNECT target");
            }
        };

        let upstream = match self.next_upstream() {
            Some(upstream) => upstream,
            None => {
                self.stats.record_failure();
                self.stats.end_request();
                return text_response(StatusCode::BAD_GATEWAY, "No upstream proxies available");
            }
        };

        let counters = self.stats.upstream_counters(&upstream.url);
        counters.begin_request();

        let endpoint = match &upstream.endpoint {
            Some(endpoint) => endpoint.clone(),
            None => {
                error!(
                    "Failed to parse upstream URL {}{}",
                    upstream.url,
                    tag_suffix(&upstream.tag)
                );
                self.fail_upstream_request(&upstream, &counters, started, false);
                return text_response(
                    StatusCode::BAD_GATEWAY,
                    "Invalid upstream proxy configuration",
                );
            }
        };

        let dial_timeout = {
            let config = self.config.read().unwrap();
            Duration::from_secs(config.upstream_timeout_secs())
        };

        let mut upstream_stream =
            match timeout(dial_timeout, TcpStream::connect(&endpoint.host)).await {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => {
                    warn!(
                        "Failed to connect to upstream {}{}: {}",
                        upstream.url,
                        tag_suffix(&upstream.tag),
                        e
                    );
                    self.fail_upstream_request(&upstream, &counters, started, true);
                    return text_response(
                        StatusCode::BAD_GATEWAY,
                        "Failed to connect to upstream proxy",
                    );
                }
                Err(_) => {
                    warn!(
                        "Connection to upstream {}{} timed out after {:?}",
                        upstream.url,
                        tag_suffix(&upstream.tag),
                        dial_timeout
                    );
                    self.fail_upstream_request(&upstream, &counters, started, true);
                    return text_response(
                        StatusCode::BAD_GATEWAY,
                        "Failed to connect to upstream proxy",
                    );
                }
            };

        let connect_req = match &endpoint.auth_header {
            Some(auth_header) => format!(
                "CONNECT {target} HTTP/1.1\r\nHost: {target}\r\nProxy-Authorization: {auth_header}\r\n\r\n"
            ),
            None => format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n\r\n"),
        };

        if let Err(e) = upstream_stream.write_all(connect_req.as_bytes()).await {
            warn!(
                "Failed to send CONNECT to upstream {}{}: {}",
                upstream.url,
                tag_suffix(&upstream.tag),
                e
            );
            self.fail_upstream_request(&upstream, &counters, started, true);
            return text_response(StatusCode::BAD_GATEWAY, "Failed to connect");
        }

        let mut response_buf = [0u8; 1024];
        let n = match upstream_stream.read(&mut response_buf).await {
            Ok(n) => n,
            Err(e) => {
                warn!(
                    "Failed to read response from upstream {}{}: {}",
                    upstream.url,
                    tag_suffix(&upstream.tag),
                    e
                );
                self.fail_upstream_request(&upstream, &counters, started, true);
                return text_response(StatusCode::BAD_GATEWAY, "Failed to connect");
            }
        };

        let upstream_response = String::from_utf8_lossy(&response_buf[..n]);
        let status_line = upstream_response.lines().next().unwrap_or("");
        if !status_line.contains("200") {
            warn!(
                "Upstream proxy {}{} rejected connection: {}",
                upstream.url,
                tag_suffix(&upstream.tag),
                status_line.trim()
            );
            self.fail_upstream_request(&upstream, &counters, started, true);
            return text_response(StatusCode::BAD_GATEWAY, "Upstream proxy rejected connection");
        }

        // The raw client stream must be detachable from the HTTP layer.
        if req.extensions().get::<OnUpgrade>().is_none() {
            error!("Client connection does not support upgrade");
            self.fail_upstream_request(&upstream, &counters, started, false);
            return text_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error");
        }

        // Tunnel established: account the success now; the splice outcome
        // does not change it.
        let elapsed_ms = started.elapsed().as_millis() as u64;
        info!(
            "Established tunnel between client and {} via {}{}",
            target,
            upstream.url,
            tag_suffix(&upstream.tag)
        );
        self.stats.record_success();
        counters.record_success(elapsed_ms);
        self.health.record_success(&upstream.url);
        self.stats.record_recent(&upstream.url, elapsed_ms, true);

        let server = Arc::clone(&self);
        let upstream_url = upstream.url.clone();
        tokio::spawn(async move {
            match hyper::upgrade::on(req).await {
                Ok(upgraded) => {
                    let client = TokioIo::new(upgraded);
                    match tunnel(client, upstream_stream).await {
                        Ok(()) => debug!("Tunnel closed for {} via {}", target, upstream_url),
                        Err(e) => {
                            debug!("Tunnel error for {} via {}: {}", target, upstream_url, e)
                        }
                    }
                }
                Err(e) => {
                    error!(
                        "Failed to take over client connection for {}: {}",
                        target, e
                    );
                }
            }
            server
                .stats
                .upstream_counters(&upstream_url)
                .release_connection();
            server.stats.end_request();
        });

        Response::builder()
            .status(StatusCode::OK)
            .extension(ReasonPhrase::from_static(b"Connection Established"))
            .body(Full::new(Bytes::new()))
            .unwrap()
    }

    /// Shared bookkeeping for every post-selection failure exit.
    fn fail_upstream_request(
        &self,
        upstream: &Upstream,
        counters: &UpstreamCounters,
        started: Instant,
        report_health: bool,
    ) {
        self.stats.record_failure();
        counters.record_failure();
        if report_health {
            self.health.record_failure(&upstream.url);
        }
        self.stats
            .record_recent(&upstream.url, started.elapsed().as_millis() as u64, false);
        counters.release_connection();
        self.stats.end_request();
    }
}

/// Bidirectional splice between the detached client stream and the upstream
/// socket. Terminates when either direction closes, errors, or stalls past
/// the read timeout; both streams drop (and close) on return.
async fn tunnel<C>(client: C, upstream: TcpStream) -> io::Result<()>
where
    C: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut upstream_read, mut upstream_write) = upstream.into_split();

    tokio::select! {
        result = relay(&mut client_read, &mut upstream_write) => result.map(|_| ()),
        result = relay(&mut upstream_read, &mut client_write) => result.map(|_| ()),
    }
}

async fn relay<R, W>(from: &mut R, to: &mut W) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; TUNNEL_BUF_SIZE];
    let mut total = 0u64;
    loop {
        let n = match timeout(TUNNEL_READ_TIMEOUT, from.read(&mut buf)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "tunnel read timed out",
                ))
            }
        };
        if n == 0 {
            return Ok(total);
        }
        to.write_all(&buf[..n]).await?;
        total += n as u64;
    }
}
