use async_trait::async_trait;
use std::time::Instant;
use surf::middleware::{Middleware, Next};
use surf::{Client, Request, Response};

/// Logs every request sent through a `surf` client together with its status and latency.
#[derive(Debug, Default, Clone, Copy)]
pub struct SurfLogging;

#[async_trait]
impl Middleware for SurfLogging {
    async fn handle(&self, req: Request, client: Client, next: Next<'_>) -> surf::Result<Response> {
        let method = req.method();
        let url = req.url().to_string();
        let start = Instant::now();
        log::debug!("Sending {} {}", method, url);

        match next.run(req, client).await {
            Ok(response) => {
                log::debug!(
                    "{} {} -> {} in {:?}",
                    method,
                    url,
                    response.status(),
                    start.elapsed()
                );
                Ok(response)
            }
            Err(e) => {
                log::warn!("{} {} failed after {:?}: {}", method, url, start.elapsed(), e);
                Err(e)
            }
        }
    }
}
