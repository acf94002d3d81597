use reqwest::{Client, StatusCode};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::{debug, warn};

use crate::errors::{AppError, AppResult};
use crate::utils::url::UrlUtils;

/// JSON client that turns every failure into "no data".
///
/// Stats endpoints go away and come back all the time; a refused
/// connection, a 502 from the proxy in front of them or a body that does not
/// parse are all logged and reported as `None` so the caller just skips the tick.
#[derive(Clone)]
pub struct TolerantHttpClient {
    client: Client,
}

impl TolerantHttpClient {
    pub fn new(timeout: Duration) -> AppResult<Self> {
        let client = Client::builder()
            .connect_timeout(timeout)
            .timeout(timeout)
            .build()?;
        Ok(Self { client })
    }

    pub async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Option<T> {
        let safe_url = UrlUtils::obfuscate_credentials(url);
        debug!("GET {}", safe_url);

        let response = match self.client.get(url).send().await {
            Ok(response) => response,
            Err(e) if e.is_connect() => {
                warn!("http_client_connection_refused url={} error={}", safe_url, e);
                return None;
            }
            Err(e) if e.is_timeout() => {
                warn!("http_client_timeout url={} error={}", safe_url, e);
                return None;
            }
            Err(e) => {
                warn!("http_client_error url={} error={}", safe_url, e);
                return None;
            }
        };

        let status = response.status();
        if status == StatusCode::BAD_GATEWAY {
            warn!("http_client_status_502 url={}", safe_url);
            return None;
        }
        if !status.is_success() {
            warn!("http_client_status url={} status={}", safe_url, status);
            return None;
        }

        match response.json::<T>().await {
            Ok(body) => Some(body),
            Err(e) => {
                warn!("http_client_malformed_body url={} error={}", safe_url, e);
                None
            }
        }
    }

    /// POSTs a JSON body with a bearer token. Non-2xx responses are errors.
    pub async fn post_json<B: Serialize + ?Sized>(
        &self,
        url: &str,
        body: &B,
        bearer: &str,
    ) -> AppResult<()> {
        let response = self
            .client
            .post(url)
            .bearer_auth(bearer)
            .json(body)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(AppError::external_service(
                UrlUtils::obfuscate_credentials(url),
                format!("unexpected status {status}"),
            ))
        }
    }
}
