use crate::config::EngineConfig;
use anyhow::{Context, Result};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT_ENCODING, CACHE_CONTROL, CONNECTION, PRAGMA};
use reqwest::Url;
use std::time::Duration;
use tokio::time::Instant;

/// HTTP access to the measurement server.
///
/// Carries two independent `reqwest::Client`s: `load` for the saturating
/// transfers and `probe` for latency pings. The probe client never shares a
/// connection pool with the load, so queued upload bodies cannot starve it.
#[derive(Clone)]
pub struct ServerClient {
    pub base_url: Url,
    pub load: reqwest::Client,
    probe: reqwest::Client,
}

fn load_headers() -> HeaderMap {
    let mut h = HeaderMap::new();
    h.insert(PRAGMA, HeaderValue::from_static("no-cache"));
    h.insert(CACHE_CONTROL, HeaderValue::from_static("no-store"));
    h.insert(ACCEPT_ENCODING, HeaderValue::from_static("identity"));
    h.insert(CONNECTION, HeaderValue::from_static("keep-alive"));
    h.insert("Keep-Alive", HeaderValue::from_static("timeout=30, max=100"));
    h.insert("X-Priority", HeaderValue::from_static("low"));
    h
}

impl ServerClient {
    pub fn new(cfg: &EngineConfig) -> Result<Self> {
        let base_url = Url::parse(&cfg.base_url).context("invalid base_url")?;

        let load = reqwest::Client::builder()
            .user_agent(cfg.user_agent.clone())
            .default_headers(load_headers())
            .tcp_keepalive(Duration::from_secs(15))
            .pool_idle_timeout(Duration::from_secs(30))
            .build()
            .context("failed to build load http client")?;

        // Separate pool with a small footprint; probe requests are tiny and
        // serial, one warm connection is enough.
        let probe = reqwest::Client::builder()
            .user_agent(cfg.user_agent.clone())
            .tcp_keepalive(Duration::from_secs(15))
            .pool_max_idle_per_host(1)
            .build()
            .context("failed to build probe http client")?;

        Ok(Self {
            base_url,
            load,
            probe,
        })
    }

    pub fn download_url(&self) -> Url {
        self.base_url.join("/download").expect("join /download")
    }

    /// Download URL capped at `size` bytes; used by warmup probing.
    pub fn download_url_sized(&self, size: u64) -> Url {
        let mut url = self.download_url();
        url.query_pairs_mut().append_pair("size", &size.to_string());
        url
    }

    pub fn upload_url(&self) -> Url {
        self.base_url.join("/upload").expect("join /upload")
    }

    pub fn ping_url(&self) -> Url {
        self.base_url.join("/ping").expect("join /ping")
    }

    /// One timed round trip on the probe pool. `during` tags the request
    /// with the phase generating load so the server can bucket it.
    pub async fn probe_latency_ms(
        &self,
        during: Option<&str>,
        timeout: Duration,
    ) -> Result<f64> {
        let mut url = self.ping_url();
        if let Some(d) = during {
            url.query_pairs_mut().append_pair("during", d);
        }

        let start = Instant::now();
        let resp = self.probe.get(url).timeout(timeout).send().await?;
        // Drain the (tiny) body so the RTT covers the full exchange.
        let _ = resp.bytes().await;
        Ok(start.elapsed().as_secs_f64() * 1000.0)
    }
}

/// Optional server discovery. Absence or garbage is not an error worth
/// surfacing; callers treat `None` as "no discovery support".
pub async fn fetch_server_info(client: &ServerClient) -> Option<serde_json::Value> {
    let url = client.base_url.join("/server-info").ok()?;
    let resp = client
        .probe
        .get(url)
        .timeout(Duration::from_secs(2))
        .send()
        .await
        .ok()?;
    if !resp.status().is_success() {
        return None;
    }
    resp.json().await.ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;

    fn client() -> ServerClient {
        let cfg = EngineConfig {
            base_url: "http://127.0.0.1:9000".into(),
            ..Default::default()
        };
        ServerClient::new(&cfg).unwrap()
    }

    #[tokio::test]
    async fn endpoint_urls() {
        let c = client();
        assert_eq!(c.download_url().path(), "/download");
        assert_eq!(c.upload_url().path(), "/upload");
        assert_eq!(c.ping_url().path(), "/ping");
    }

    #[tokio::test]
    async fn sized_download_url_carries_query() {
        let c = client();
        let url = c.download_url_sized(1_048_576);
        assert_eq!(url.query(), Some("size=1048576"));
    }

    #[test]
    fn bad_base_url_is_rejected() {
        let cfg = EngineConfig {
            base_url: "::not-a-url::".into(),
            ..Default::default()
        };
        assert!(ServerClient::new(&cfg).is_err());
    }
}
