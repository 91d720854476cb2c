//! JSON-over-HTTP transport for the Unix-socket RPC services.

use firesnap_common::{Error, Result};
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper_util::client::legacy::Client;
use hyperlocal::UnixConnector;
use serde::de::DeserializeOwned;
use serde::Serialize;

pub(crate) struct UdsClient {
    client: Client<UnixConnector, Full<Bytes>>,
    socket_path: String,
    service: &'static str,
}

impl UdsClient {
    pub(crate) fn new(socket_path: impl Into<String>, service: &'static str) -> Self {
        let client = Client::builder(hyper_util::rt::TokioExecutor::new()).build(UnixConnector);
        Self {
            client,
            socket_path: socket_path.into(),
            service,
        }
    }

    /// POST `body` to `endpoint` and decode the JSON response. Non-2xx
    /// responses surface as external errors carrying the response body.
    pub(crate) async fn call<B: Serialize, R: DeserializeOwned>(
        &self,
        endpoint: &str,
        body: &B,
    ) -> Result<R> {
        let uri: hyper::Uri = hyperlocal::Uri::new(&self.socket_path, endpoint).into();
        let json = serde_json::to_vec(body)
            .map_err(|e| Error::external(self.service, format!("{endpoint}: encoding request: {e}")))?;

        let request = hyper::Request::builder()
            .method(hyper::Method::POST)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Full::new(Bytes::from(json)))
            .map_err(|e| Error::external(self.service, format!("{endpoint}: {e}")))?;

        let response = self
            .client
            .request(request)
            .await
            .map_err(|e| Error::external(self.service, format!("{endpoint}: {e}")))?;
        let status = response.status();
        let bytes = response
            .into_body()
            .collect()
            .await
            .map_err(|e| Error::external(self.service, format!("{endpoint}: reading response: {e}")))?
            .to_bytes();

        if !status.is_success() {
            let message = String::from_utf8_lossy(&bytes);
            return Err(Error::external(
                self.service,
                format!("{endpoint}: {status}: {}", message.trim()),
            ));
        }

        // Operations without a payload answer with an empty body.
        let bytes = if bytes.is_empty() {
            Bytes::from_static(b"null")
        } else {
            bytes
        };
        serde_json::from_slice(&bytes)
            .map_err(|e| Error::external(self.service, format!("{endpoint}: decoding response: {e}")))
    }
}
