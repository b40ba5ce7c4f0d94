//! The device-facing deployments API: discovering new deployments (v2 POST
//! with v1 GET fallback), pushing status, and uploading the deployment log.
//! All calls go through an authenticated client that injects the JWT from
//! the auth daemon and refreshes it once on a 401.

use crate::config::MenderConfig;
use crate::db::{ArtifactSource, StateData, UpdateInfo};
use crate::error::{self, Error, Result};
use authclient::{AuthClient, AuthToken};
use log::{error, info};
use serde::Serialize;
use snafu::ResultExt;
use std::collections::HashMap;
use std::fmt;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;
use std::time::Duration;

/// How long to wait for the auth daemon to produce a fresh token after a
/// refresh request.
const TOKEN_WAIT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeploymentStatus {
    Installing,
    PauseBeforeInstalling,
    Downloading,
    PauseBeforeRebooting,
    Rebooting,
    PauseBeforeCommitting,
    Success,
    Failure,
    AlreadyInstalled,
}

impl fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DeploymentStatus::Installing => "installing",
            DeploymentStatus::PauseBeforeInstalling => "pause-before-installing",
            DeploymentStatus::Downloading => "downloading",
            DeploymentStatus::PauseBeforeRebooting => "pause-before-rebooting",
            DeploymentStatus::Rebooting => "rebooting",
            DeploymentStatus::PauseBeforeCommitting => "pause-before-committing",
            DeploymentStatus::Success => "success",
            DeploymentStatus::Failure => "failure",
            DeploymentStatus::AlreadyInstalled => "already-installed",
        })
    }
}

pub struct ApiClient {
    http: reqwest::Client,
    auth: AuthClient,
    fallback_server_url: Option<String>,
}

impl ApiClient {
    pub fn new(config: &MenderConfig) -> Result<Self> {
        let mut builder = reqwest::Client::builder();
        if config.skip_verify {
            builder = builder.danger_accept_invalid_certs(true);
        }
        let http = builder
            .build()
            .map_err(|e| Error::Request {
                method: "client".to_string(),
                url: String::new(),
                source: e,
            })?;
        Ok(Self {
            http,
            auth: AuthClient::new(&config.auth_socket_path),
            fallback_server_url: config.server_url().map(str::to_string),
        })
    }

    /// A plain client for absolute (pre-signed) URLs like the artifact
    /// download URI.
    pub fn plain_http(&self) -> reqwest::Client {
        self.http.clone()
    }

    async fn token(&self) -> Result<AuthToken> {
        let mut token = self.auth.get_jwt_token().await?;
        if token.is_empty() {
            info!("No cached authorization token, requesting one");
            self.auth.fetch_jwt_token().await?;
            token = self.auth.wait_for_token_change(TOKEN_WAIT).await?;
        }
        if token.is_empty() {
            return error::NotAuthorizedSnafu.fail();
        }
        if token.server_url.is_empty() {
            token.server_url = self
                .fallback_server_url
                .clone()
                .unwrap_or_default();
        }
        Ok(token)
    }

    /// Sends one API request, refreshing the token and retrying once on a
    /// 401.
    pub async fn send(
        &self,
        method: reqwest::Method,
        path_and_query: &str,
        body: Option<&serde_json::Value>,
    ) -> Result<(reqwest::StatusCode, String)> {
        let mut token = self.token().await?;
        let mut refreshed = false;
        loop {
            let url = join_url(&token.server_url, path_and_query);
            let mut request = self
                .http
                .request(method.clone(), &url)
                .bearer_auth(&token.token)
                .header(reqwest::header::ACCEPT, "application/json");
            if let Some(body) = body {
                request = request.json(body);
            }
            let response = request.send().await.context(error::RequestSnafu {
                method: method.to_string(),
                url: url.clone(),
            })?;
            let status = response.status();
            let text = response.text().await.unwrap_or_default();

            if status == reqwest::StatusCode::UNAUTHORIZED && !refreshed {
                info!("Got 401 from the server, refreshing the authorization token");
                self.auth.fetch_jwt_token().await?;
                token = self.auth.wait_for_token_change(TOKEN_WAIT).await?;
                refreshed = true;
                continue;
            }
            return Ok((status, text));
        }
    }
}

fn join_url(base: &str, path: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), path)
}

/// Checks the server for a new deployment. Tries the v2 POST carrying the
/// full provides set; a 404 from an older server falls back to the v1 GET.
/// `Ok(None)` means no deployment is pending.
pub async fn check_new_deployments(
    client: &ApiClient,
    device_type: &str,
    provides: &HashMap<String, String>,
) -> Result<Option<serde_json::Value>> {
    let artifact_name = provides.get("artifact_name").ok_or_else(|| {
        Error::InvalidDeploymentResponse {
            reason: "Missing artifact name data".to_string(),
        }
    })?;

    let mut device_provides = serde_json::Map::new();
    device_provides.insert(
        "device_type".to_string(),
        serde_json::Value::String(device_type.to_string()),
    );
    for (key, value) in provides {
        device_provides.insert(key.clone(), serde_json::Value::String(value.clone()));
    }
    let v2_body = serde_json::json!({
        "update_control_map": false,
        "device_provides": device_provides,
    });

    let (status, body) = client
        .send(
            reqwest::Method::POST,
            constants::DEPLOYMENTS_NEXT_URI_V2,
            Some(&v2_body),
        )
        .await?;

    match status.as_u16() {
        200 => parse_deployment_body(&body).map(Some),
        204 => Ok(None),
        404 => {
            info!(
                "POST request to v2 version of the deployments API failed, \
                 falling back to v1 version and GET"
            );
            let query = format!(
                "{}?artifact_name={}&device_type={}",
                constants::DEPLOYMENTS_NEXT_URI_V1,
                urlencode(artifact_name),
                urlencode(device_type)
            );
            let (status, body) = client.send(reqwest::Method::GET, &query, None).await?;
            match status.as_u16() {
                200 => parse_deployment_body(&body).map(Some),
                204 => Ok(None),
                code => error::BadResponseSnafu { status: code, body }.fail(),
            }
        }
        code => error::BadResponseSnafu { status: code, body }.fail(),
    }
}

fn parse_deployment_body(body: &str) -> Result<serde_json::Value> {
    serde_json::from_str(body).map_err(|e| Error::InvalidDeploymentResponse {
        reason: e.to_string(),
    })
}

fn urlencode(value: &str) -> String {
    url::form_urlencoded::byte_serialize(value.as_bytes()).collect()
}

/// Decodes the deployment response into the initial `StateData`. Only the
/// id and artifact source are taken from the response; everything else
/// comes from the (signed) artifact itself once downloaded.
pub fn state_data_from_response(response: &serde_json::Value) -> Result<StateData> {
    let id = response["id"]
        .as_str()
        .ok_or_else(|| Error::InvalidDeploymentResponse {
            reason: "Could not get deployment ID".to_string(),
        })?
        .to_string();
    let uri = response["artifact"]["source"]["uri"]
        .as_str()
        .ok_or_else(|| Error::InvalidDeploymentResponse {
            reason: "Could not get artifact URI for deployment".to_string(),
        })?
        .to_string();
    let expire = response["artifact"]["source"]["expire"]
        .as_str()
        .map(str::to_string);

    Ok(StateData {
        update_info: UpdateInfo {
            id,
            artifact: crate::db::ArtifactData {
                source: ArtifactSource { uri, expire },
                ..Default::default()
            },
            all_rollbacks_successful: true,
            ..Default::default()
        },
        ..Default::default()
    })
}

#[derive(Debug, Serialize)]
struct StatusBody<'a> {
    status: String,
    #[serde(skip_serializing_if = "str::is_empty")]
    substate: &'a str,
}

/// Reports deployment progress. A 409 means the deployment was aborted
/// server-side; the caller must stop pushing and go clean up.
pub async fn push_status(
    client: &ApiClient,
    deployment_id: &str,
    status: DeploymentStatus,
    substate: &str,
) -> Result<()> {
    let path = format!(
        "{}/{}/status",
        constants::DEPLOYMENTS_STATUS_URI,
        deployment_id
    );
    let body = serde_json::to_value(StatusBody {
        status: status.to_string(),
        substate,
    })
    .expect("static shape");

    let (code, text) = client.send(reqwest::Method::POST, &path, Some(&body)).await?;
    match code.as_u16() {
        200 | 204 => Ok(()),
        409 => {
            error!("Deployment was aborted on the server");
            error::DeploymentAbortedSnafu.fail()
        }
        status => error::BadResponseSnafu { status, body: text }.fail(),
    }
}

/// Uploads the deployment log, wrapped on the fly into
/// `{"messages":[...]}`.
pub async fn push_logs(client: &ApiClient, deployment_id: &str, log_file: &Path) -> Result<()> {
    let path = format!(
        "{}/{}/log",
        constants::DEPLOYMENTS_STATUS_URI,
        deployment_id
    );

    let file = File::open(log_file).context(error::DeploymentLogFileSnafu { path: log_file })?;
    let mut reader = JsonLogMessagesReader::new(file);
    let mut wrapped = String::new();
    reader
        .read_to_string(&mut wrapped)
        .context(error::DeploymentLogFileSnafu { path: log_file })?;
    let body: serde_json::Value =
        serde_json::from_str(&wrapped).map_err(|e| Error::InvalidDeploymentResponse {
            reason: format!("deployment log is not valid JSON: {}", e),
        })?;

    let (code, text) = client.send(reqwest::Method::PUT, &path, Some(&body)).await?;
    match code.as_u16() {
        200 | 204 => Ok(()),
        status => error::BadResponseSnafu { status, body: text }.fail(),
    }
}

/// Streams a newline-delimited JSON log file as one JSON document:
/// a fixed header, the records with newlines turned into commas, and a
/// fixed closing. Rewindable for retries.
pub struct JsonLogMessagesReader<R: Read + Seek> {
    inner: R,
    header_rem: &'static [u8],
    closing_rem: &'static [u8],
    // One byte of lookahead so a trailing newline becomes the closing
    // bracket instead of a dangling comma.
    pending: Option<u8>,
    done: bool,
}

const LOG_WRAP_HEADER: &[u8] = b"{\"messages\":[";
const LOG_WRAP_CLOSING: &[u8] = b"]}";

impl<R: Read + Seek> JsonLogMessagesReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            header_rem: LOG_WRAP_HEADER,
            closing_rem: LOG_WRAP_CLOSING,
            pending: None,
            done: false,
        }
    }

    pub fn rewind(&mut self) -> io::Result<()> {
        self.inner.seek(SeekFrom::Start(0))?;
        self.header_rem = LOG_WRAP_HEADER;
        self.closing_rem = LOG_WRAP_CLOSING;
        self.pending = None;
        self.done = false;
        Ok(())
    }

    fn next_byte(&mut self) -> io::Result<Option<u8>> {
        let mut buf = [0u8; 1];
        if self.inner.read(&mut buf)? == 0 {
            return Ok(None);
        }
        Ok(Some(buf[0]))
    }
}

impl<R: Read + Seek> Read for JsonLogMessagesReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut written = 0;
        while written < buf.len() {
            if !self.header_rem.is_empty() {
                buf[written] = self.header_rem[0];
                self.header_rem = &self.header_rem[1..];
                written += 1;
                continue;
            }
            if self.done {
                if self.closing_rem.is_empty() {
                    break;
                }
                buf[written] = self.closing_rem[0];
                self.closing_rem = &self.closing_rem[1..];
                written += 1;
                continue;
            }

            let byte = match self.pending.take() {
                Some(byte) => byte,
                None => match self.next_byte()? {
                    Some(byte) => byte,
                    None => {
                        self.done = true;
                        continue;
                    }
                },
            };

            if byte == b'\n' {
                // Only a comma if another record follows.
                match self.next_byte()? {
                    Some(next) => {
                        self.pending = Some(next);
                        buf[written] = b',';
                        written += 1;
                    }
                    None => self.done = true,
                }
            } else {
                buf[written] = byte;
                written += 1;
            }
        }
        Ok(written)
    }
}
