use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;
use surf::http::Method;
use surf::{Client, RequestBuilder};
use sync_client::{Error, RawResponse, Request, RequestFn, NOT_MODIFIED};
use url::Url;
use utils::surf_logging::SurfLogging;
use utils::url_builder::build_url;

/// JSON-over-HTTP request function backed by `surf`, with a per-request deadline.
pub struct HttpRequestFn {
    http: Client,
    base_url: Url,
    timeout: Duration,
}

impl HttpRequestFn {
    pub fn new(base_url: Url, timeout: Duration) -> Self {
        Self {
            http: Client::new().with(SurfLogging),
            base_url,
            timeout,
        }
    }
}

#[async_trait]
impl RequestFn<Value> for HttpRequestFn {
    async fn request(&self, request: Request) -> Result<RawResponse<Value>, Error> {
        let endpoint = request.endpoint().clone();
        let url = build_url(&self.base_url, &endpoint, request.params())
            .map_err(|e| Error::fetch(endpoint.clone(), e))?;
        let method = Method::from_str(request.method()).map_err(|e| Error::fetch(endpoint.clone(), e))?;

        let builder = request
            .headers()
            .iter()
            .fold(RequestBuilder::new(method, url), |builder, (name, value)| {
                builder.header(name.as_str(), value.as_str())
            });

        let mut response = tokio::time::timeout(self.timeout, self.http.send(builder.build()))
            .await
            .map_err(|_| Error::fetch(endpoint.clone(), format!("no response within {:?}", self.timeout)))?
            .map_err(|e| Error::fetch(endpoint.clone(), e))?;

        let status = u16::from(response.status());
        let headers: BTreeMap<String, String> = response
            .iter()
            .map(|(name, values)| (name.as_str().to_string(), values.last().as_str().to_string()))
            .collect();

        let body = if status == NOT_MODIFIED || !(200..300).contains(&status) {
            None
        } else {
            Some(
                response
                    .body_json::<Value>()
                    .await
                    .map_err(|e| Error::fetch(endpoint.clone(), e))?,
            )
        };

        Ok(RawResponse {
            status,
            headers,
            body,
        })
    }
}
