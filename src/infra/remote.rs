//! Probing and fetching image content over HTTP(S) or from `file://` locations.

use std::{path::PathBuf, time::Duration};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use reqwest::{Client, Response, StatusCode, header};
use tokio::fs;
use tracing::debug;
use url::Url;

use crate::{
    application::collaborators::{ContentProber, ProbeError},
    infra::error::InfraError,
};

enum Target {
    File(PathBuf),
    Http(Url),
}

/// HTTP client plus local file access behind one location string.
#[derive(Clone)]
pub struct RemoteContent {
    client: Client,
    max_bytes: u64,
}

impl RemoteContent {
    pub fn new(timeout: Duration, max_bytes: u64) -> Result<Self, InfraError> {
        let client = Client::builder()
            .user_agent(concat!("mapforge/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .map_err(|err| InfraError::http(err.to_string()))?;
        Ok(Self { client, max_bytes })
    }

    /// Download the full content, refusing anything above the configured size.
    pub async fn fetch(&self, location: &str) -> Result<Bytes, ProbeError> {
        match parse_location(location)? {
            Target::File(path) => {
                let metadata = fs::metadata(&path).await?;
                if metadata.len() > self.max_bytes {
                    return Err(self.too_large(location));
                }
                Ok(Bytes::from(fs::read(&path).await?))
            }
            Target::Http(url) => {
                let mut response = self
                    .client
                    .get(url)
                    .send()
                    .await
                    .map_err(|err| transport(location, err))?;
                ensure_success(location, &response)?;

                let mut body = BytesMut::new();
                while let Some(chunk) = response
                    .chunk()
                    .await
                    .map_err(|err| transport(location, err))?
                {
                    if (body.len() + chunk.len()) as u64 > self.max_bytes {
                        return Err(self.too_large(location));
                    }
                    body.extend_from_slice(&chunk);
                }
                debug!(
                    target = "infra::remote",
                    location,
                    bytes = body.len(),
                    "content fetched"
                );
                Ok(body.freeze())
            }
        }
    }

    async fn head(&self, location: &str, url: Url) -> Result<Response, ProbeError> {
        let response = self
            .client
            .head(url)
            .send()
            .await
            .map_err(|err| transport(location, err))?;
        ensure_success(location, &response)?;
        Ok(response)
    }

    fn too_large(&self, location: &str) -> ProbeError {
        ProbeError::TooLarge {
            location: location.to_string(),
            limit: self.max_bytes,
        }
    }
}

#[async_trait]
impl ContentProber for RemoteContent {
    async fn content_size(&self, location: &str) -> Result<Option<u64>, ProbeError> {
        match parse_location(location)? {
            Target::File(path) => Ok(Some(fs::metadata(&path).await?.len())),
            Target::Http(url) => {
                let response = self.head(location, url).await?;
                Ok(header_value(&response, header::CONTENT_LENGTH)
                    .and_then(|value| value.parse().ok()))
            }
        }
    }

    async fn content_type(&self, location: &str) -> Result<Option<String>, ProbeError> {
        match parse_location(location)? {
            Target::File(path) => Ok(mime_guess::from_path(&path)
                .first()
                .map(|mime| mime.essence_str().to_string())),
            Target::Http(url) => {
                let response = self.head(location, url).await?;
                Ok(header_value(&response, header::CONTENT_TYPE))
            }
        }
    }
}

fn parse_location(location: &str) -> Result<Target, ProbeError> {
    let invalid = |reason: &str| ProbeError::InvalidLocation {
        location: location.to_string(),
        reason: reason.to_string(),
    };

    let url = Url::parse(location).map_err(|err| invalid(&err.to_string()))?;
    match url.scheme() {
        "http" | "https" => Ok(Target::Http(url)),
        "file" => url
            .to_file_path()
            .map(Target::File)
            .map_err(|()| invalid("not a local file path")),
        other => Err(invalid(&format!("unsupported scheme `{other}`"))),
    }
}

fn ensure_success(location: &str, response: &Response) -> Result<(), ProbeError> {
    let status = response.status();
    if status.is_success() || status == StatusCode::NOT_MODIFIED {
        return Ok(());
    }
    Err(ProbeError::Status {
        location: location.to_string(),
        status: status.as_u16(),
    })
}

fn header_value(response: &Response, name: header::HeaderName) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

fn transport(location: &str, err: reqwest::Error) -> ProbeError {
    ProbeError::Transport {
        location: location.to_string(),
        message: err.to_string(),
    }
}
