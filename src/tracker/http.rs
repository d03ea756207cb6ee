//! HTTP tracker transport
//!
//! Announce and scrape over HTTP(S) with compact peer lists.

use std::time::Duration;

use anyhow::Result;
use tracing::{debug, trace};
use url::Url;

use crate::error::TorrentError;
use crate::tracker::response::{
    parse_announce_response, parse_scrape_response, AnnounceRequest, AnnounceResponse, ScrapeStats,
};

/// HTTP(S) tracker transport
#[derive(Debug, Clone)]
pub struct HttpAnnouncer {
    client: reqwest::Client,
}

impl HttpAnnouncer {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("swarmcore/", env!("CARGO_PKG_VERSION")))
            .redirect(reqwest::redirect::Policy::limited(3))
            .build()
            .map_err(|e| TorrentError::network_error(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self { client })
    }

    pub async fn announce(&self, url: &str, request: &AnnounceRequest) -> Result<AnnounceResponse> {
        let full = build_announce_url(url, request);
        trace!("HTTP announce {}", full);
        let body = self.get(url, &full).await?;
        parse_announce_response(&body).map_err(|e| {
            TorrentError::from_anyhow(e, |m| TorrentError::tracker_unreachable(m))
                .with_context(url.to_string())
                .into()
        })
    }

    pub async fn scrape(&self, url: &str, info_hash: &[u8; 20]) -> Result<ScrapeStats> {
        let scrape = scrape_url(url)
            .ok_or_else(|| TorrentError::tracker_unreachable_with_url("Tracker does not support scrape", url))?;
        let full = format!(
            "{}{}info_hash={}",
            scrape,
            if scrape.contains('?') { '&' } else { '?' },
            urlencoding::encode_binary(info_hash)
        );
        let body = self.get(url, &full).await?;
        parse_scrape_response(&body, info_hash)
    }

    async fn get(&self, url: &str, full: &str) -> Result<Vec<u8>> {
        let response = self.client.get(full).send().await.map_err(|e| {
            let what = if e.is_timeout() { "Tracker timed out" } else { "Tracker request failed" };
            TorrentError::tracker_unreachable_with_url(format!("{}: {}", what, e), url)
        })?;
        let status = response.status();
        if !status.is_success() {
            return Err(TorrentError::tracker_unreachable_with_url(format!("HTTP status {}", status), url).into());
        }
        let body = response
            .bytes()
            .await
            .map_err(|e| TorrentError::tracker_unreachable_with_url(format!("Failed to read body: {}", e), url))?;
        debug!("Tracker {} answered with {} bytes", url, body.len());
        Ok(body.to_vec())
    }
}

/// Build the announce URL; binary fields are percent-encoded byte by byte
pub fn build_announce_url(url: &str, request: &AnnounceRequest) -> String {
    let mut query = format!(
        "info_hash={}&peer_id={}&port={}&uploaded={}&downloaded={}&left={}&compact=1&numwant={}&key={:08x}",
        urlencoding::encode_binary(&request.info_hash),
        urlencoding::encode_binary(&request.peer_id),
        request.port,
        request.uploaded,
        request.downloaded,
        request.left,
        request.numwant,
        request.key,
    );
    if let Some(event) = request.event.as_query() {
        query.push_str("&event=");
        query.push_str(event);
    }
    if let Some(ip) = &request.ip {
        query.push_str("&ip=");
        query.push_str(&urlencoding::encode(ip));
    }
    let sep = if url.contains('?') { '&' } else { '?' };
    format!("{}{}{}", url, sep, query)
}

/// Scrape URL derived by replacing a final `announce` path segment
pub fn scrape_url(announce: &str) -> Option<String> {
    let mut parsed = Url::parse(announce).ok()?;
    let path = parsed.path().to_string();
    let (dir, last) = path.rsplit_once('/')?;
    let rest = last.strip_prefix("announce")?;
    parsed.set_path(&format!("{}/scrape{}", dir, rest));
    Some(parsed.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::response::AnnounceEvent;

    fn request() -> AnnounceRequest {
        AnnounceRequest {
            info_hash: [0xab; 20],
            peer_id: *b"-SC0100-abcdefghijkl",
            port: 6881,
            uploaded: 1,
            downloaded: 2,
            left: 3,
            event: AnnounceEvent::Started,
            numwant: 50,
            ip: None,
            key: 0x1234,
        }
    }

    #[test]
    fn test_announce_url() {
        let url = build_announce_url("http://t.example/announce", &request());
        assert!(url.starts_with("http://t.example/announce?info_hash=%AB%AB"));
        assert!(url.contains("peer_id=-SC0100-abcdefghijkl"));
        assert!(url.contains("&compact=1"));
        assert!(url.contains("&numwant=50"));
        assert!(url.ends_with("&event=started"));

        let mut req = request();
        req.event = AnnounceEvent::None;
        let url = build_announce_url("http://t.example/announce?passkey=x", &req);
        assert!(url.contains("?passkey=x&info_hash="));
        assert!(!url.contains("event="));
    }

    #[test]
    fn test_scrape_url() {
        assert_eq!(
            scrape_url("http://t.example/announce").as_deref(),
            Some("http://t.example/scrape")
        );
        assert_eq!(
            scrape_url("http://t.example/x/announce.php?k=1").as_deref(),
            Some("http://t.example/x/scrape.php?k=1")
        );
        assert_eq!(scrape_url("http://t.example/a"), None);
    }
}
