use std::sync::Once;
use std::time::Duration;

use async_trait::async_trait;
use rustls::crypto::CryptoProvider;
use tracing::{debug, trace};
use url::Url;

use super::{ApiRequest, ApiResponse, Transport, TransportError, decode_body};
use crate::config::SessionConfig;
use crate::error::{Result, SessionError};

const USER_AGENT: &str = concat!("session-core/", env!("CARGO_PKG_VERSION"));

/// The client is built without a bundled TLS crypto backend, so one has to be
/// registered process-wide before the first client exists.
fn ensure_crypto_provider() {
    static REGISTERED: Once = Once::new();
    REGISTERED.call_once(|| {
        if CryptoProvider::get_default().is_some() {
            return;
        }
        // Losing a race with another registration leaves a usable provider either way.
        if rustls::crypto::aws_lc_rs::default_provider()
            .install_default()
            .is_err()
        {
            trace!("TLS crypto provider registered concurrently");
        }
    });
}

/// [`Transport`] backed by a shared `reqwest::Client`.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: Url,
    default_timeout: Duration,
}

impl HttpTransport {
    pub fn new(base_url: Url, default_timeout: Duration) -> Result<Self> {
        ensure_crypto_provider();

        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| SessionError::config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self::with_client(client, base_url, default_timeout))
    }

    /// Use an existing client (shared pools, custom proxies).
    pub fn with_client(client: reqwest::Client, base_url: Url, default_timeout: Duration) -> Self {
        Self {
            client,
            base_url: normalize_base(base_url),
            default_timeout,
        }
    }

    pub fn from_config(config: &SessionConfig) -> Result<Self> {
        Self::new(config.base_url()?, config.request_timeout)
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn resolve(&self, path: &str) -> std::result::Result<Url, TransportError> {
        self.base_url
            .join(path.trim_start_matches('/'))
            .map_err(|e| TransportError::Connect(format!("Invalid request path '{}': {}", path, e)))
    }
}

/// `Url::join` replaces the last segment unless the base ends with a slash.
fn normalize_base(mut url: Url) -> Url {
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    url
}

fn map_reqwest_error(error: reqwest::Error) -> TransportError {
    if error.is_timeout() {
        TransportError::Timeout(error.to_string())
    } else {
        TransportError::Connect(error.to_string())
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: &ApiRequest) -> std::result::Result<ApiResponse, TransportError> {
        let url = self.resolve(&request.path)?;
        let timeout = request.timeout.unwrap_or(self.default_timeout);

        let mut builder = self
            .client
            .request(request.method.clone(), url)
            .timeout(timeout);
        for (name, value) in request.headers() {
            builder = builder.header(name, value);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        trace!(method = %request.method, path = %request.path, "Sending request");

        let response = builder.send().await.map_err(map_reqwest_error)?;
        let status = response.status();
        let bytes = response.bytes().await.map_err(map_reqwest_error)?;
        let body = decode_body(&bytes);

        debug!(
            method = %request.method,
            path = %request.path,
            status = status.as_u16(),
            "Received response"
        );

        if status.is_success() {
            Ok(ApiResponse::new(status.as_u16(), body))
        } else {
            Err(TransportError::Status {
                status: status.as_u16(),
                body,
            })
        }
    }
}
