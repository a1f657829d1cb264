//! HTTP transport seam.
//!
//! The queue never blocks: [`HttpTransport::post`] hands back a oneshot
//! receiver which the queue polls from `update`. Implementations run the
//! request wherever they like and send exactly one result.

use std::time::Duration;

use thiserror::Error;
use tokio::sync::oneshot;

use crate::command::PacketRequest;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,
    #[error("connection failed: {0}")]
    Connection(String),
    /// The transport dropped the request without answering.
    #[error("request cancelled")]
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }
}

pub type PendingResponse = oneshot::Receiver<Result<HttpResponse, TransportError>>;

pub trait HttpTransport {
    /// Start a POST of `request`. `timeout` is advisory; the queue enforces
    /// its own deadline as well.
    fn post(&mut self, request: &PacketRequest, timeout: Duration) -> PendingResponse;
}

#[cfg(feature = "reqwest-transport")]
pub use self::reqwest_transport::ReqwestTransport;

#[cfg(feature = "reqwest-transport")]
mod reqwest_transport {
    use super::*;
    use tokio::runtime::Handle;
    use tracing::trace;

    /// Posts packets as JSON with `reqwest`, on a tokio runtime.
    pub struct ReqwestTransport {
        client: reqwest::Client,
        url: String,
        runtime: Handle,
    }

    impl ReqwestTransport {
        pub fn new(url: impl Into<String>, runtime: Handle) -> Self {
            Self::with_client(reqwest::Client::new(), url, runtime)
        }

        pub fn with_client(client: reqwest::Client, url: impl Into<String>, runtime: Handle) -> Self {
            Self {
                client,
                url: url.into(),
                runtime,
            }
        }

        pub fn url(&self) -> &str {
            &self.url
        }
    }

    impl From<reqwest::Error> for TransportError {
        fn from(err: reqwest::Error) -> Self {
            if err.is_timeout() {
                TransportError::Timeout
            } else {
                TransportError::Connection(err.to_string())
            }
        }
    }

    impl HttpTransport for ReqwestTransport {
        fn post(&mut self, request: &PacketRequest, timeout: Duration) -> PendingResponse {
            let (tx, rx) = oneshot::channel();
            let builder = self
                .client
                .post(&self.url)
                .query(&[("session_id", request.session_id.as_str())])
                .timeout(timeout)
                .json(request);
            let packet_id = request.packet_id;
            self.runtime.spawn(async move {
                let result = match builder.send().await {
                    Ok(response) => {
                        let status = response.status().as_u16();
                        response
                            .bytes()
                            .await
                            .map(|body| HttpResponse::new(status, body.to_vec()))
                            .map_err(TransportError::from)
                    }
                    Err(err) => Err(TransportError::from(err)),
                };
                trace!(packet_id, ok = result.is_ok(), "packet request finished");
                // The queue may have been disposed meanwhile.
                let _ = tx.send(result);
            });
            rx
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn test_unreachable_endpoint_reports_error() {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            let mut transport =
                ReqwestTransport::new("http://127.0.0.1:9/commands", runtime.handle().clone());
            let request = PacketRequest {
                session_id: "s1".to_string(),
                watermark: 1,
                packet_id: 1,
                timestamp: 0,
                commands: Vec::new(),
                acks: Vec::new(),
            };
            let rx = transport.post(&request, Duration::from_secs(2));
            let result = runtime.block_on(rx).unwrap();
            assert!(result.is_err());
        }
    }
}
