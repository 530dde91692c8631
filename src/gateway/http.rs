//! HTTP gateway onto the rig's network adapters.
//!
//! - Pulser and multiplexer hang off serial-to-REST forwarders that take
//!   `GET {base}/{verb}/{payload}`.
//! - The oscilloscope service takes `POST {base}/get_wave` with the
//!   acquisition parameters form-encoded and answers with JSON.

use super::{GatewayError, GatewayResult, InstrumentGateway};
use crate::config::GatewayConfig;
use crate::instrument::picoscope::parse_waveform;
use crate::instrument::PulseParameters;
use crate::storage::Waveform;
use async_trait::async_trait;
use bytes::Bytes;
use hyper::client::HttpConnector;
use hyper::{header, Body, Client, Method, Request, Uri};
use std::time::Duration;
use tracing::debug;

/// Forwarder verb that writes one CR/LF-terminated line.
const WRITE_VERB: &str = "writecf";

/// Client for one serial forwarder.
#[derive(Clone, Debug)]
pub struct NodeForwarder {
    base_url: String,
    client: Client<HttpConnector>,
    timeout: Duration,
}

impl NodeForwarder {
    /// Forwarder at `base_url`; a trailing `/` is ignored.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: Client::new(),
            timeout,
        }
    }

    /// URL that writes `payload` to the serial line.
    pub fn write_url(&self, payload: &str) -> String {
        format!("{}/{}/{}", self.base_url, WRITE_VERB, payload)
    }

    /// Write one command and return the forwarder's reply body.
    pub async fn write(&self, payload: &str) -> GatewayResult<String> {
        let url = self.write_url(payload);
        debug!(url = %url, "Forwarder request");
        let request = Request::builder()
            .method(Method::GET)
            .uri(parse_uri(&url)?)
            .body(Body::empty())
            .map_err(|e| GatewayError::Request(e.to_string()))?;
        let body = send(&self.client, request, &url, self.timeout).await?;
        Ok(String::from_utf8_lossy(&body).into_owned())
    }
}

/// Gateway used on the deployed rig.
#[derive(Clone, Debug)]
pub struct HttpGateway {
    acquire_url: String,
    client: Client<HttpConnector>,
    timeout: Duration,
    pulser: NodeForwarder,
    mux: NodeForwarder,
}

impl HttpGateway {
    /// Gateway onto the endpoints named in `config`, sharing its timeout.
    pub fn new(config: &GatewayConfig) -> Self {
        let timeout = config.timeout();
        Self {
            acquire_url: format!("{}/get_wave", config.picoscope_url.trim_end_matches('/')),
            client: Client::new(),
            timeout,
            pulser: NodeForwarder::new(&config.pulser_url, timeout),
            mux: NodeForwarder::new(&config.mux_url, timeout),
        }
    }
}

#[async_trait]
impl InstrumentGateway for HttpGateway {
    async fn acquire(&self, params: &PulseParameters) -> GatewayResult<Waveform> {
        let request = Request::builder()
            .method(Method::POST)
            .uri(parse_uri(&self.acquire_url)?)
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(Body::from(params.to_form()))
            .map_err(|e| GatewayError::Request(e.to_string()))?;

        let body = send(&self.client, request, &self.acquire_url, self.timeout).await?;
        let waveform = parse_waveform(&body)?;
        debug!(channels = waveform.len(), "Waveform acquired");
        Ok(waveform)
    }

    async fn pulser(&self, command: &str) -> GatewayResult<String> {
        self.pulser.write(command).await
    }

    async fn mux(&self, command: &str) -> GatewayResult<String> {
        self.mux.write(command).await
    }
}

fn parse_uri(url: &str) -> GatewayResult<Uri> {
    url.parse::<Uri>()
        .map_err(|e| GatewayError::Request(format!("invalid URL '{}': {}", url, e)))
}

async fn send(
    client: &Client<HttpConnector>,
    request: Request<Body>,
    endpoint: &str,
    timeout: Duration,
) -> GatewayResult<Bytes> {
    let round_trip = async {
        let response = client.request(request).await?;
        let status = response.status();
        let body = hyper::body::to_bytes(response.into_body()).await?;
        if !status.is_success() {
            return Err(GatewayError::Status {
                endpoint: endpoint.to_string(),
                status: status.as_u16(),
            });
        }
        Ok(body)
    };

    tokio::time::timeout(timeout, round_trip)
        .await
        .map_err(|_| GatewayError::Timeout {
            endpoint: endpoint.to_string(),
            timeout_ms: timeout.as_millis() as u64,
        })?
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Response, Server, StatusCode};
    use parking_lot::Mutex;
    use std::convert::Infallible;
    use std::net::SocketAddr;
    use std::sync::Arc;

    /// Serve a fake rig on an ephemeral port, recording request lines.
    async fn fake_rig(seen: Arc<Mutex<Vec<String>>>) -> SocketAddr {
        let make_svc = make_service_fn(move |_conn| {
            let seen = seen.clone();
            async move {
                Ok::<_, Infallible>(service_fn(move |req: Request<Body>| {
                    let seen = seen.clone();
                    async move {
                        let line = format!("{} {}", req.method(), req.uri().path());
                        let body = hyper::body::to_bytes(req.into_body()).await.unwrap_or_default();
                        seen.lock().push(format!("{} {}", line, String::from_utf8_lossy(&body)));

                        let response = if line == "POST /get_wave" {
                            Response::new(Body::from(r#"{"amps": [[0.5, 0.25]]}"#))
                        } else if line.starts_with("GET /writecf/") {
                            Response::new(Body::from("ok"))
                        } else {
                            let mut r = Response::new(Body::empty());
                            *r.status_mut() = StatusCode::NOT_FOUND;
                            r
                        };
                        Ok::<_, Infallible>(response)
                    }
                }))
            }
        });

        let server = Server::bind(&SocketAddr::from(([127, 0, 0, 1], 0))).serve(make_svc);
        let addr = server.local_addr();
        tokio::spawn(server);
        addr
    }

    fn config_for(addr: SocketAddr) -> GatewayConfig {
        let base = format!("http://{}", addr);
        GatewayConfig {
            picoscope_url: base.clone(),
            pulser_url: base.clone(),
            mux_url: base,
            timeout_ms: 2_000,
            pulse_repetition: "P500".to_string(),
        }
    }

    #[test]
    fn test_forwarder_urls() {
        let forwarder = NodeForwarder::new("http://10.0.0.2:9002/", Duration::from_secs(1));
        assert_eq!(forwarder.write_url("P500"), "http://10.0.0.2:9002/writecf/P500");
        assert_eq!(forwarder.write_url("X1,7"), "http://10.0.0.2:9002/writecf/X1,7");
    }

    #[tokio::test]
    async fn test_gateway_against_fake_rig() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let addr = fake_rig(seen.clone()).await;
        let gateway = HttpGateway::new(&config_for(addr));

        assert_eq!(gateway.pulser("P500").await.unwrap(), "ok");
        gateway.mux("X0,3").await.unwrap();
        let waveform = gateway.acquire(&PulseParameters::default()).await.unwrap();
        assert_eq!(waveform.get("amps/0"), Some(&vec![0.5, 0.25]));

        let seen = seen.lock().clone();
        assert_eq!(seen[0], "GET /writecf/P500 ");
        assert_eq!(seen[1], "GET /writecf/X0,3 ");
        assert!(seen[2].starts_with("POST /get_wave delay=26"), "{}", seen[2]);
    }

    #[tokio::test]
    async fn test_non_success_status_is_an_error() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let addr = fake_rig(seen).await;
        // Only the root of the fake rig forwards writes
        let forwarder = NodeForwarder::new(format!("http://{}/offline", addr), Duration::from_secs(2));

        let result = forwarder.write("P0").await;
        assert!(matches!(result, Err(GatewayError::Status { status: 404, .. })));
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_fails() {
        // Port 9 (discard) on localhost is almost never listening
        let forwarder = NodeForwarder::new("http://127.0.0.1:9", Duration::from_millis(500));
        assert!(forwarder.write("P0").await.is_err());
    }
}
