/*!
The update daemon never holds the device key; authentication lives in the
auth daemon, which exposes a small RPC surface over a local Unix socket:

- `GetJwtToken` returns the cached `(token, server URL)` pair, possibly
  empty when the device hasn't authorized yet.
- `FetchJwtToken` asks for a refresh; the outcome arrives asynchronously.
- `JwtTokenStateChange` is the refresh signal, exposed here as a long-poll:
  the server answers the request once a new token pair is available.

Frames are single JSON lines in both directions. The server URL returned
with the token points at the auth daemon's forward proxy, which injects
the bearer token into upstream requests; callers talk to that URL and
attach the token themselves when bypassing the proxy.
*/

use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("Failed to connect to auth daemon at '{}': {}", path.display(), source))]
    Connect { path: PathBuf, source: io::Error },

    #[snafu(display("Failed to send request to auth daemon: {}", source))]
    Send { source: io::Error },

    #[snafu(display("Failed to read response from auth daemon: {}", source))]
    Receive { source: io::Error },

    #[snafu(display("Auth daemon closed the connection without answering"))]
    ConnectionClosed,

    #[snafu(display("Unexpected response from auth daemon: {}", source))]
    Protocol { source: serde_json::Error },

    #[snafu(display("Timed out waiting for a token state change"))]
    WaitTimeout,
}

pub type Result<T> = std::result::Result<T, Error>;

/// The cached authentication pair. Both fields are empty until the device
/// has authorized with the backend.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct AuthToken {
    pub token: String,
    pub server_url: String,
}

impl AuthToken {
    pub fn is_empty(&self) -> bool {
        self.token.is_empty() || self.server_url.is_empty()
    }
}

#[derive(Debug, Serialize)]
struct Request<'a> {
    method: &'a str,
}

#[derive(Debug, Deserialize)]
struct FetchResponse {
    success: bool,
}

#[derive(Debug, Clone)]
pub struct AuthClient {
    socket_path: PathBuf,
}

impl AuthClient {
    pub fn new<P: AsRef<Path>>(socket_path: P) -> Self {
        Self {
            socket_path: socket_path.as_ref().to_path_buf(),
        }
    }

    /// Returns the cached token pair; empty fields mean "not authorized
    /// yet".
    pub async fn get_jwt_token(&self) -> Result<AuthToken> {
        let line = self.round_trip("GetJwtToken").await?;
        serde_json::from_str(&line).context(ProtocolSnafu)
    }

    /// Requests a token refresh. `true` means the auth daemon accepted the
    /// request; the new token is announced via the state-change signal.
    pub async fn fetch_jwt_token(&self) -> Result<bool> {
        let line = self.round_trip("FetchJwtToken").await?;
        let response: FetchResponse = serde_json::from_str(&line).context(ProtocolSnafu)?;
        Ok(response.success)
    }

    /// Long-polls the `JwtTokenStateChange` signal: resolves with the new
    /// pair once the auth daemon refreshes it, or fails after `timeout`.
    pub async fn wait_for_token_change(&self, timeout: Duration) -> Result<AuthToken> {
        let line = tokio::time::timeout(timeout, self.round_trip("JwtTokenStateChange"))
            .await
            .map_err(|_| Error::WaitTimeout)??;
        serde_json::from_str(&line).context(ProtocolSnafu)
    }

    async fn round_trip(&self, method: &str) -> Result<String> {
        let stream = UnixStream::connect(&self.socket_path)
            .await
            .context(ConnectSnafu {
                path: &self.socket_path,
            })?;
        let (read_half, mut write_half) = stream.into_split();

        let mut request = serde_json::to_string(&Request { method }).expect("static shape");
        request.push('\n');
        write_half
            .write_all(request.as_bytes())
            .await
            .context(SendSnafu)?;

        let mut line = String::new();
        let n = BufReader::new(read_half)
            .read_line(&mut line)
            .await
            .context(ReceiveSnafu)?;
        if n == 0 {
            return Err(Error::ConnectionClosed);
        }
        Ok(line)
    }
}
