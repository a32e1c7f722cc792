//! URL health checks (Ambient Supplement, SPEC_FULL.md §9): a cheap
//! HEAD-based classification of whether a machine's `product_url` is
//! still reachable, surfaced through `GET /machines/:id/health` without
//! running a full extraction.

use crate::acquisition::http_client::HttpClient;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Ok,
    Redirected,
    ClientError,
    ServerError,
    Unreachable,
}

#[derive(Debug, Clone, Serialize)]
pub struct UrlHealth {
    pub status: HealthStatus,
    pub http_status: Option<u16>,
    pub final_url: Option<String>,
}

/// Classify a URL's current reachability. Never returns an error — an
/// unreachable URL is a health result, not a failure of the check
/// itself.
pub async fn check_url_health(http: &HttpClient, url: &str, timeout_ms: u64) -> UrlHealth {
    match http.head(url, timeout_ms).await {
        Ok(resp) => {
            let status = if resp.status >= 500 {
                HealthStatus::ServerError
            } else if resp.status >= 400 {
                HealthStatus::ClientError
            } else if resp.final_url != resp.url {
                HealthStatus::Redirected
            } else {
                HealthStatus::Ok
            };
            UrlHealth {
                status,
                http_status: Some(resp.status),
                final_url: Some(resp.final_url),
            }
        }
        Err(_) => UrlHealth {
            status: HealthStatus::Unreachable,
            http_status: None,
            final_url: None,
        },
    }
}
