//! Physical connection: dialing the router and exposing the socket as a
//! frame sink plus a frame stream.

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::{Sink, SinkExt, StreamExt, future};
use rustls::ClientConfig;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderMap, HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{Connector, connect_async_tls_with_config};
use tracing::debug;

use crate::error::{DialError, SetupError, TransportError};
use crate::protocol::InstanceId;

/// Outbound half: accepts complete, serialized frames.
pub type FrameSink = Pin<Box<dyn Sink<String, Error = TransportError> + Send>>;

/// Inbound half: one item per received data frame. `Err` or end of stream
/// means the connection is gone.
pub type FrameStream = BoxStream<'static, Result<Vec<u8>, TransportError>>;

/// A freshly dialed connection.
pub struct Link {
    pub sink: FrameSink,
    pub stream: FrameStream,
}

/// Produces physical connections to the router.
#[async_trait]
pub trait Dialer: Send + Sync + 'static {
    /// Where this dialer connects, for logs.
    fn target(&self) -> &str;

    async fn dial(&self) -> Result<Link, DialError>;
}

#[derive(Clone, Debug)]
pub struct DialerConfig {
    /// Accept any server certificate.
    pub insecure: bool,
    /// Upper bound on TCP connect + TLS + WebSocket handshake.
    pub timeout: Duration,
}

impl Default for DialerConfig {
    fn default() -> Self {
        Self {
            insecure: false,
            timeout: Duration::from_secs(10),
        }
    }
}

/// Handshake headers identifying this instance to the router, after any
/// custom headers. Fails only if the hostname cannot be resolved.
pub fn handshake_headers(
    identity: &InstanceId,
    custom: &[(String, String)],
) -> Result<Vec<(String, String)>, SetupError> {
    let mut headers = custom.to_vec();
    headers.push(("X-Hostname".into(), local_hostname()?));
    headers.push(("X-Runtime".into(), std::env::consts::OS.into()));
    headers.push(("X-Arch".into(), router_arch_name(std::env::consts::ARCH).into()));
    headers.push(("X-Identifier".into(), identity.to_string()));
    Ok(headers)
}

#[cfg(unix)]
fn local_hostname() -> Result<String, SetupError> {
    let name = nix::unistd::gethostname().map_err(|e| SetupError::Hostname(e.into()))?;
    name.into_string().map_err(|raw| {
        SetupError::Hostname(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("hostname is not valid UTF-8: {raw:?}"),
        ))
    })
}

#[cfg(not(unix))]
fn local_hostname() -> Result<String, SetupError> {
    std::env::var("COMPUTERNAME").map_err(|e| SetupError::Hostname(std::io::Error::other(e)))
}

/// The router and dashboards use Go's architecture names.
fn router_arch_name(arch: &str) -> &str {
    match arch {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        "x86" => "386",
        "powerpc64" => "ppc64",
        other => other,
    }
}

/// Dials the router over WebSocket (ws:// or wss://).
pub struct WsDialer {
    url: String,
    headers: HeaderMap,
    connector: Option<Connector>,
    timeout: Duration,
}

impl WsDialer {
    pub fn new(
        url: &str,
        headers: &[(String, String)],
        config: &DialerConfig,
    ) -> Result<Self, SetupError> {
        url.into_client_request()
            .map_err(|e| SetupError::InvalidUrl {
                url: url.to_string(),
                reason: e.to_string(),
            })?;

        let mut header_map = HeaderMap::new();
        for (name, value) in headers {
            let header_name =
                HeaderName::from_bytes(name.as_bytes()).map_err(|e| SetupError::InvalidHeader {
                    name: name.clone(),
                    reason: e.to_string(),
                })?;
            let header_value =
                HeaderValue::from_str(value).map_err(|e| SetupError::InvalidHeader {
                    name: name.clone(),
                    reason: e.to_string(),
                })?;
            header_map.insert(header_name, header_value);
        }

        let connector = if config.insecure {
            Some(Connector::Rustls(Arc::new(insecure_tls_config()?)))
        } else {
            None
        };

        Ok(Self {
            url: url.to_string(),
            headers: header_map,
            connector,
            timeout: config.timeout,
        })
    }
}

#[async_trait]
impl Dialer for WsDialer {
    fn target(&self) -> &str {
        &self.url
    }

    async fn dial(&self) -> Result<Link, DialError> {
        let handshake_failed = |e: tungstenite::Error| DialError::Handshake {
            target: self.url.clone(),
            source: Box::new(e),
        };

        let mut request = self.url.as_str().into_client_request().map_err(handshake_failed)?;
        request.headers_mut().extend(self.headers.clone());

        let connecting =
            connect_async_tls_with_config(request, None, false, self.connector.clone());
        let (ws_stream, response) = tokio::time::timeout(self.timeout, connecting)
            .await
            .map_err(|_| DialError::Timeout {
                target: self.url.clone(),
                timeout: self.timeout,
            })?
            .map_err(handshake_failed)?;
        debug!(url = %self.url, status = %response.status(), "websocket handshake complete");

        let (ws_write, ws_read) = ws_stream.split();

        let sink = ws_write
            .sink_map_err(TransportError::from)
            .with(|text: String| future::ready(Ok::<_, TransportError>(Message::Text(text.into()))));

        let stream = ws_read.filter_map(|msg| {
            future::ready(match msg {
                Ok(Message::Text(text)) => Some(Ok(text.as_bytes().to_vec())),
                Ok(Message::Binary(bytes)) => Some(Ok(bytes.to_vec())),
                Ok(Message::Close(frame)) => {
                    debug!(?frame, "peer sent close frame");
                    Some(Err(TransportError::Closed))
                }
                // Pings are answered by tungstenite itself
                Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => None,
                Err(e) => Some(Err(TransportError::from(e))),
            })
        });

        Ok(Link {
            sink: Box::pin(sink),
            stream: stream.boxed(),
        })
    }
}

fn insecure_tls_config() -> Result<ClientConfig, SetupError> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyCertificate { provider }))
        .with_no_client_auth();
    Ok(config)
}

/// Skips certificate validation (`--insecure`). Handshake signatures are
/// still checked so the session keys are bound to the presented certificate.
#[derive(Debug)]
struct AcceptAnyCertificate {
    provider: Arc<rustls::crypto::CryptoProvider>,
}

impl ServerCertVerifier for AcceptAnyCertificate {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
        headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    #[test]
    fn handshake_headers_identify_the_instance() {
        let identity = InstanceId::new("instance-1");
        let custom = vec![("Authorization".to_string(), "Bearer t".to_string())];
        let headers = handshake_headers(&identity, &custom).unwrap();

        assert_eq!(header(&headers, "Authorization"), Some("Bearer t"));
        assert_eq!(header(&headers, "X-Identifier"), Some("instance-1"));
        assert_eq!(header(&headers, "X-Runtime"), Some(std::env::consts::OS));
        assert!(header(&headers, "X-Arch").is_some());
        assert!(!header(&headers, "X-Hostname").unwrap_or_default().is_empty());
    }

    #[test]
    fn arch_names_follow_router_convention() {
        assert_eq!(router_arch_name("x86_64"), "amd64");
        assert_eq!(router_arch_name("aarch64"), "arm64");
        assert_eq!(router_arch_name("riscv64"), "riscv64");
    }

    #[test]
    fn dialer_rejects_bad_url_and_headers() {
        let config = DialerConfig::default();
        assert!(matches!(
            WsDialer::new("not a url", &[], &config),
            Err(SetupError::InvalidUrl { .. })
        ));
        assert!(matches!(
            WsDialer::new(
                "ws://127.0.0.1:1/route",
                &[("bad header".into(), "v".into())],
                &config
            ),
            Err(SetupError::InvalidHeader { .. })
        ));
    }

    #[test]
    fn insecure_dialer_builds() {
        let config = DialerConfig {
            insecure: true,
            ..Default::default()
        };
        let dialer = WsDialer::new("wss://localhost:8080/route", &[], &config).unwrap();
        assert!(dialer.connector.is_some());
        assert_eq!(dialer.target(), "wss://localhost:8080/route");
    }

    #[tokio::test]
    async fn dial_failure_is_a_dial_error() {
        // Port 1 on loopback refuses connections
        let config = DialerConfig {
            insecure: false,
            timeout: Duration::from_secs(5),
        };
        let dialer = WsDialer::new("ws://127.0.0.1:1/route", &[], &config).unwrap();
        assert!(dialer.dial().await.is_err());
    }
}
