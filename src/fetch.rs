use clap::crate_version;
use reqwest::{header, StatusCode};
use std::{fmt, future::Future, time::Duration};
use thiserror::Error;
use tracing::trace;

use crate::tile::TileCoord;
use crate::url::UrlFormat;

const ZERO_DURATION: Duration = Duration::from_secs(0);

/// Why a single tile request failed.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FailureReason {
    Unknown,
    /// The provider throttled the credential used for the request.
    RateLimited,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::Unknown => f.write_str("unknown"),
            FailureReason::RateLimited => f.write_str("rate limited"),
        }
    }
}

#[derive(Debug, Error)]
#[error("failed fetching tile {coord} ({reason}): {detail}")]
pub struct FetchError {
    pub coord: TileCoord,
    pub reason: FailureReason,
    pub detail: String,
}

impl FetchError {
    pub fn unknown(coord: TileCoord, detail: impl fmt::Display) -> Self {
        Self {
            coord,
            reason: FailureReason::Unknown,
            detail: detail.to_string(),
        }
    }

    pub fn rate_limited(coord: TileCoord, detail: impl fmt::Display) -> Self {
        Self {
            coord,
            reason: FailureReason::RateLimited,
            detail: detail.to_string(),
        }
    }

    pub fn is_rate_limited(&self) -> bool {
        self.reason == FailureReason::RateLimited
    }
}

/// Something tiles can be fetched from.
///
/// Implementations issue exactly one request per call; retrying is up to the
/// caller.
pub trait TileSource: Send + Sync {
    fn fetch(
        &self,
        coord: TileCoord,
        credential: &str,
    ) -> impl Future<Output = Result<Vec<u8>, FetchError>> + Send;
}

/// Fetches tiles over HTTP from a templated URL.
#[derive(Clone, Debug)]
pub struct FetchClient {
    client: reqwest::Client,
    url: UrlFormat,
}

impl FetchClient {
    /// Creates a client with the given per-request timeout.
    ///
    /// Pass the zero duration to disable the timeout.
    pub fn new(url: UrlFormat, timeout: Duration) -> reqwest::Result<Self> {
        let mut builder = reqwest::Client::builder();
        if timeout > ZERO_DURATION {
            builder = builder.timeout(timeout);
        }

        let mut headers = header::HeaderMap::new();
        headers.insert(
            header::ACCEPT,
            header::HeaderValue::from_static("image/avif,image/webp,image/apng,image/*,*/*;q=0.8"),
        );

        let client = builder
            .user_agent(format!("tile-harvester_rs_{}", crate_version!()))
            .default_headers(headers)
            .build()?;

        Ok(Self { client, url })
    }

    pub fn url(&self) -> &UrlFormat {
        &self.url
    }

    async fn fetch_tile(&self, coord: TileCoord, credential: &str) -> Result<Vec<u8>, FetchError> {
        let url = self
            .url
            .tile_url(&coord, credential)
            .map_err(|e| FetchError::unknown(coord, format!("failed formatting URL: {}", e)))?;

        trace!(%coord, "requesting tile");

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| FetchError::unknown(coord, e))?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(FetchError::rate_limited(coord, format!("HTTP {}", status)));
        }
        if !status.is_success() {
            return Err(FetchError::unknown(coord, format!("HTTP {}", status)));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| FetchError::unknown(coord, format!("failed reading body: {}", e)))?;
        if body.is_empty() {
            return Err(FetchError::unknown(coord, "empty response body"));
        }

        Ok(body.to_vec())
    }
}

impl TileSource for FetchClient {
    fn fetch(
        &self,
        coord: TileCoord,
        credential: &str,
    ) -> impl Future<Output = Result<Vec<u8>, FetchError>> + Send {
        self.fetch_tile(coord, credential)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_mentions_tile_and_reason() {
        let err = FetchError::rate_limited(TileCoord::new(4, 3, 2), "HTTP 429 Too Many Requests");
        assert!(err.is_rate_limited());
        assert_eq!(
            err.to_string(),
            "failed fetching tile 4/3/2 (rate limited): HTTP 429 Too Many Requests"
        );
    }

    #[test]
    fn client_builds_without_timeout() {
        let client = FetchClient::new(UrlFormat::from_str("http://localhost/{z}/{x}/{y}"), ZERO_DURATION);
        assert!(client.is_ok());
    }
}
