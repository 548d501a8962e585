use crate::Error;
use async_trait::async_trait;
use futures::Future;
use getset::Getters;
use std::collections::BTreeMap;

/// Header carrying the stored entity tag on a revalidation request.
pub const IF_NONE_MATCH: &str = "If-None-Match";

/// HTTP status signalling that the stored representation is still current.
pub const NOT_MODIFIED: u16 = 304;

/// A logical request against a dashboard endpoint.
#[derive(Clone, Debug, PartialEq, Eq, Getters)]
#[get = "pub"]
pub struct Request {
    method: String,
    endpoint: String,
    params: BTreeMap<String, String>,
    headers: BTreeMap<String, String>,
}

impl Request {
    pub fn new(method: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            method: method.into().to_uppercase(),
            endpoint: endpoint.into(),
            params: BTreeMap::new(),
            headers: BTreeMap::new(),
        }
    }

    pub fn get(endpoint: impl Into<String>) -> Self {
        Self::new("GET", endpoint)
    }

    pub fn param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Header value lookup, ignoring ASCII case.
    pub fn header_value(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }
}

/// Response returned by a [`RequestFn`].
///
/// `body` is `None` for bodiless responses such as "not modified".
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawResponse<V> {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: Option<V>,
}

impl<V> RawResponse<V> {
    pub fn ok(body: V) -> Self {
        Self {
            status: 200,
            headers: BTreeMap::new(),
            body: Some(body),
        }
    }

    pub fn not_modified() -> Self {
        Self {
            status: NOT_MODIFIED,
            headers: BTreeMap::new(),
            body: None,
        }
    }

    pub fn with_etag(mut self, etag: impl Into<String>) -> Self {
        self.headers.insert("ETag".to_string(), etag.into());
        self
    }

    pub fn etag(&self) -> Option<&str> {
        find_header(&self.headers, "etag")
    }

    pub fn is_not_modified(&self) -> bool {
        self.status == NOT_MODIFIED
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

fn find_header<'a>(headers: &'a BTreeMap<String, String>, name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.as_str())
}

/// The single I/O dependency of the synchronization layer.
///
/// Deadlines are the implementor's business: wrap the call in a timeout before handing it over.
#[async_trait]
pub trait RequestFn<V>: Send + Sync {
    async fn request(&self, request: Request) -> Result<RawResponse<V>, Error>;
}

#[async_trait]
impl<V, F, Fut> RequestFn<V> for F
where
    V: Send + 'static,
    F: Fn(Request) -> Fut + Send + Sync,
    Fut: Future<Output = Result<RawResponse<V>, Error>> + Send,
{
    async fn request(&self, request: Request) -> Result<RawResponse<V>, Error> {
        (self)(request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_lookup_ignores_case() {
        let response = RawResponse::ok(1).with_etag("\"v1\"");
        assert_eq!(response.etag(), Some("\"v1\""));

        let request = Request::get("/api/agents").header("if-none-match", "abc");
        assert_eq!(request.header_value(IF_NONE_MATCH), Some("abc"));
        assert_eq!(request.method(), "GET");
    }

    #[test]
    fn test_status_helpers() {
        assert!(RawResponse::<()>::not_modified().is_not_modified());
        assert!(RawResponse::ok(()).is_success());
        assert!(!RawResponse::<()>::not_modified().is_success());
    }
}
