/*!
This library wraps a plain HTTP client with transparent download resumption.
The first request is sent as-is; when the connection drops or the body ends
short of the advertised `Content-Length`, a new request is issued with a
`Range: bytes=<offset>-` header after an exponential backoff, and the byte
stream continues where it left off. The consumer sees one uninterrupted
sequence of chunks.

A `Content-Length` that still can't be reached once the attempts are
exhausted surfaces as a fatal error.

The `reader` module bridges the async chunk stream to a blocking
`std::io::Read`, which is what the artifact parser consumes from inside a
blocking task.
*/

pub mod reader;

use bytes::Bytes;
use log::{info, warn};
use snafu::{ensure, ResultExt, Snafu};
use std::time::Duration;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("Failed to request '{}': {}", url, source))]
    Request { url: String, source: reqwest::Error },

    #[snafu(display("Unexpected response status {} from '{}'", status, url))]
    BadResponse {
        status: reqwest::StatusCode,
        url: String,
    },

    #[snafu(display(
        "Download of '{}' failed after {} attempts: got {} of {} bytes",
        url,
        attempts,
        offset,
        length
    ))]
    AttemptsExhausted {
        url: String,
        attempts: u32,
        offset: u64,
        length: u64,
    },

    #[snafu(display("Failed to read response body from '{}': {}", url, source))]
    BodyRead { url: String, source: reqwest::Error },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Doubling backoff between resume attempts, bounded by a maximum interval.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    smallest_interval: Duration,
    max_interval: Duration,
    attempt: u32,
}

impl ExponentialBackoff {
    pub fn new(smallest_interval: Duration, max_interval: Duration) -> Self {
        Self {
            smallest_interval,
            max_interval,
            attempt: 0,
        }
    }

    /// Returns the wait before the next attempt and advances the schedule.
    pub fn next_interval(&mut self) -> Duration {
        let interval = self
            .smallest_interval
            .checked_mul(1u32 << self.attempt.min(16))
            .unwrap_or(self.max_interval)
            .min(self.max_interval);
        self.attempt += 1;
        interval
    }

    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

/// Retry policy for one download.
#[derive(Debug, Clone)]
pub struct RetrySettings {
    pub smallest_interval: Duration,
    pub max_interval: Duration,
    pub max_attempts: u32,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            smallest_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(10 * 60),
            max_attempts: 10,
        }
    }
}

/// One resumable download in progress. Create with [`Download::start`],
/// then call [`Download::chunk`] until it returns `Ok(None)`.
pub struct Download {
    client: reqwest::Client,
    url: String,
    settings: RetrySettings,
    backoff: ExponentialBackoff,
    response: Option<reqwest::Response>,
    offset: u64,
    length: Option<u64>,
}

impl Download {
    pub async fn start(
        client: reqwest::Client,
        url: impl Into<String>,
        settings: RetrySettings,
    ) -> Result<Self> {
        let url = url.into();
        let backoff = ExponentialBackoff::new(settings.smallest_interval, settings.max_interval);
        let response = client
            .get(&url)
            .send()
            .await
            .context(RequestSnafu { url: &url })?;
        ensure!(
            response.status().is_success(),
            BadResponseSnafu {
                status: response.status(),
                url: &url,
            }
        );
        let length = response.content_length();
        Ok(Self {
            client,
            url,
            settings,
            backoff,
            response: Some(response),
            offset: 0,
            length,
        })
    }

    /// Returns the `Content-Length` advertised by the first response, if any.
    pub fn length(&self) -> Option<u64> {
        self.length
    }

    /// Yields the next chunk of the body, transparently resuming on short
    /// reads and connection drops. `Ok(None)` means the download completed.
    pub async fn chunk(&mut self) -> Result<Option<Bytes>> {
        loop {
            let response = match self.response.as_mut() {
                Some(response) => response,
                None => {
                    self.resume().await?;
                    continue;
                }
            };

            match response.chunk().await {
                Ok(Some(data)) => {
                    self.offset += data.len() as u64;
                    return Ok(Some(data));
                }
                Ok(None) => {
                    let complete = match self.length {
                        Some(length) => self.offset >= length,
                        // Without a content length we have to trust EOF.
                        None => true,
                    };
                    if complete {
                        return Ok(None);
                    }
                    warn!(
                        "Short read from '{}' ({} of {} bytes), resuming",
                        self.url,
                        self.offset,
                        self.length.unwrap_or(0)
                    );
                    self.response = None;
                }
                Err(e) => {
                    warn!("Error reading body from '{}': {}, resuming", self.url, e);
                    self.response = None;
                }
            }
        }
    }

    /// Issues a ranged request for the remainder of the body, waiting out
    /// the backoff first.
    async fn resume(&mut self) -> Result<()> {
        ensure!(
            self.backoff.attempts() < self.settings.max_attempts,
            AttemptsExhaustedSnafu {
                url: &self.url,
                attempts: self.backoff.attempts(),
                offset: self.offset,
                length: self.length.unwrap_or(0),
            }
        );
        let wait = self.backoff.next_interval();
        info!(
            "Resuming download of '{}' from offset {} in {:?}",
            self.url, self.offset, wait
        );
        tokio::time::sleep(wait).await;

        let response = self
            .client
            .get(&self.url)
            .header(reqwest::header::RANGE, format!("bytes={}-", self.offset))
            .send()
            .await
            .context(RequestSnafu { url: &self.url })?;
        ensure!(
            response.status().is_success(),
            BadResponseSnafu {
                status: response.status(),
                url: &self.url,
            }
        );
        self.response = Some(response);
        Ok(())
    }
}
