//! Async HTTP client wrapping reqwest.
//!
//! Not a browser — just HTTP requests. Handles redirects, timeouts,
//! retry on 5xx/Cloudflare challenge codes, and exponential backoff on
//! 429.

use crate::error::ExtractError;
use std::time::Duration;

/// Cloudflare's "origin unreachable" family. Treated the same as a 5xx:
/// worth a retry, not a reason to give up on the site entirely.
const CLOUDFLARE_RETRYABLE: [u16; 5] = [520, 521, 522, 523, 524];

/// Response from an HTTP GET request.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    /// Original requested URL.
    pub url: String,
    /// Final URL after redirects.
    pub final_url: String,
    /// HTTP status code.
    pub status: u16,
    /// Response headers (selected subset).
    pub headers: Vec<(String, String)>,
    /// Response body as text.
    pub body: String,
}

/// Response from an HTTP HEAD request, used for URL health checks.
#[derive(Debug, Clone)]
pub struct HeadResponse {
    pub url: String,
    pub status: u16,
    pub final_url: String,
    pub content_type: Option<String>,
}

fn is_retryable_status(status: u16) -> bool {
    (500..600).contains(&status) || CLOUDFLARE_RETRYABLE.contains(&status)
}

/// Exponential backoff with +/-20% jitter, so a burst of requests that
/// all hit the same transient error don't retry in lockstep.
fn backoff_with_jitter(retries: u32) -> Duration {
    use rand::Rng;
    let base = 500 * 2u64.pow(retries - 1);
    let jitter_pct = rand::thread_rng().gen_range(-20i64..=20);
    let jittered = (base as i64 + base as i64 * jitter_pct / 100).max(0) as u64;
    Duration::from_millis(jittered)
}

/// HTTP client for the acquisition engine.
#[derive(Clone)]
pub struct HttpClient {
    client: reqwest::Client,
    /// HTTP/1.1-only fallback client for sites that reject HTTP/2.
    h1_client: reqwest::Client,
}

impl HttpClient {
    /// Create a new HTTP client with a standard desktop-browser user agent.
    /// Most manufacturer storefronts serve different markup to known bot
    /// user agents, so this matters for extraction success, not just
    /// politeness.
    pub fn new(timeout_ms: u64) -> Self {
        let ua = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) \
                  AppleWebKit/537.36 (KHTML, like Gecko) \
                  Chrome/131.0.0.0 Safari/537.36";

        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(timeout_ms))
            .redirect(reqwest::redirect::Policy::limited(5))
            .user_agent(ua)
            .build()
            .unwrap_or_default();

        let h1_client = reqwest::Client::builder()
            .timeout(Duration::from_millis(timeout_ms))
            .redirect(reqwest::redirect::Policy::limited(5))
            .user_agent(ua)
            .http1_only()
            .build()
            .unwrap_or_default();

        Self { client, h1_client }
    }

    /// Perform a single GET, retrying 5xx/Cloudflare-52x with exponential
    /// backoff and 429 with `Retry-After`-aware backoff. Falls back to
    /// HTTP/1.1 on protocol errors (some CDNs reject HTTP/2).
    ///
    /// Returns `ExtractError::FetchPermanent` for 4xx (other than 429)
    /// and `ExtractError::FetchTransient` for anything exhausted after
    /// retry, per the fetch taxonomy.
    pub async fn get(&self, url: &str, timeout_ms: u64) -> Result<HttpResponse, ExtractError> {
        match self.get_inner(&self.client, url, timeout_ms).await {
            Ok(resp) => Ok(resp),
            Err(e) => {
                let err_str = format!("{e}");
                if err_str.contains("http2")
                    || err_str.contains("protocol")
                    || err_str.contains("connection closed")
                {
                    self.get_inner(&self.h1_client, url, timeout_ms).await
                } else {
                    Err(e)
                }
            }
        }
    }

    async fn get_inner(
        &self,
        client: &reqwest::Client,
        url: &str,
        timeout_ms: u64,
    ) -> Result<HttpResponse, ExtractError> {
        let mut retries = 0u32;
        let max_retries = 3;

        loop {
            let resp = client
                .get(url)
                .timeout(Duration::from_millis(timeout_ms))
                .send()
                .await;

            match resp {
                Ok(r) => {
                    let status = r.status().as_u16();
                    let final_url = r.url().to_string();

                    if is_retryable_status(status) && retries < max_retries {
                        retries += 1;
                        tokio::time::sleep(backoff_with_jitter(retries)).await;
                        continue;
                    }

                    if status == 429 && retries < max_retries {
                        retries += 1;
                        let retry_after = r
                            .headers()
                            .get("retry-after")
                            .and_then(|v| v.to_str().ok())
                            .and_then(|s| s.parse::<u64>().ok())
                            .unwrap_or(2);
                        let delay = Duration::from_secs(retry_after.min(10));
                        tokio::time::sleep(delay).await;
                        continue;
                    }

                    if status >= 400 && status != 429 {
                        return Err(ExtractError::FetchPermanent {
                            url: url.to_string(),
                            reason: format!("HTTP {status}"),
                        });
                    }

                    if status >= 500 || status == 429 {
                        return Err(ExtractError::FetchTransient {
                            url: url.to_string(),
                            reason: format!("HTTP {status} after {retries} retries"),
                        });
                    }

                    let headers: Vec<(String, String)> = r
                        .headers()
                        .iter()
                        .filter(|(k, _)| {
                            matches!(
                                k.as_str(),
                                "content-type" | "content-language" | "last-modified" | "cache-control"
                            )
                        })
                        .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or("").to_string()))
                        .collect();

                    let body = r.text().await.unwrap_or_default();

                    return Ok(HttpResponse {
                        url: url.to_string(),
                        final_url,
                        status,
                        headers,
                        body,
                    });
                }
                Err(e) => {
                    if retries < max_retries {
                        retries += 1;
                        tokio::time::sleep(backoff_with_jitter(retries)).await;
                        continue;
                    }
                    return Err(ExtractError::FetchTransient {
                        url: url.to_string(),
                        reason: e.to_string(),
                    });
                }
            }
        }
    }

    /// Parallel GETs with bounded concurrency, preserving input order.
    pub async fn get_many(
        &self,
        urls: &[String],
        concurrency: usize,
        timeout_ms: u64,
    ) -> Vec<Result<HttpResponse, ExtractError>> {
        use futures::stream::{self, StreamExt};

        stream::iter(urls.iter())
            .map(|url| {
                let client = self.clone();
                let u = url.clone();
                async move { client.get(&u, timeout_ms).await }
            })
            .buffered(concurrency)
            .collect()
            .await
    }

    /// HEAD a URL for the URL-health diagnostic (domain changed, now a
    /// redirect chain, 404, etc.).
    pub async fn head(&self, url: &str, timeout_ms: u64) -> Result<HeadResponse, ExtractError> {
        let resp = self
            .client
            .head(url)
            .timeout(Duration::from_millis(timeout_ms))
            .send()
            .await
            .map_err(|e| ExtractError::FetchTransient {
                url: url.to_string(),
                reason: e.to_string(),
            })?;

        let status = resp.status().as_u16();
        let final_url = resp.url().to_string();
        let content_type = resp
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());

        Ok(HeadResponse {
            url: url.to_string(),
            status,
            final_url,
            content_type,
        })
    }

    /// Parallel HEAD requests with bounded concurrency.
    pub async fn head_many(
        &self,
        urls: &[String],
        concurrency: usize,
        timeout_ms: u64,
    ) -> Vec<Result<HeadResponse, ExtractError>> {
        use futures::stream::{self, StreamExt};

        stream::iter(urls.iter())
            .map(|url| {
                let client = self.clone();
                let u = url.clone();
                async move { client.head(&u, timeout_ms).await }
            })
            .buffered(concurrency)
            .collect()
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_construction_does_not_panic() {
        let client = HttpClient::new(10_000);
        let _ = client;
    }

    #[test]
    fn retryable_status_covers_5xx_and_cloudflare_52x() {
        assert!(is_retryable_status(500));
        assert!(is_retryable_status(503));
        assert!(is_retryable_status(520));
        assert!(is_retryable_status(523));
        assert!(is_retryable_status(524));
        assert!(!is_retryable_status(404));
        assert!(!is_retryable_status(429));
    }
}
