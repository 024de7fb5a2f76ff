use std::error::Error as StdError;
use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use futures_util::StreamExt;
use log::{debug, error, info, warn};
use reqwest::{Client, StatusCode};
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;

use crate::error::{ComponentError, ComponentResult};
use crate::util::cancel_requested;

pub mod checksum;

/// Some mirrors answer 403 to the default reqwest signature.
pub const USER_AGENT: &str = "curl/7.79.1";
pub const BLOCK_SIZE: u64 = 1024;

#[derive(Clone, Debug)]
pub struct Fetcher {
    client: Client,
}

impl Fetcher {
    pub fn new(timeout: Option<Duration>) -> ComponentResult<Self> {
        Self::with_user_agent(USER_AGENT, timeout)
    }

    pub fn with_user_agent(user_agent: &str, timeout: Option<Duration>) -> ComponentResult<Self> {
        let mut builder = Client::builder().user_agent(user_agent);
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder.build().map_err(|err| {
            error!("fetch: unable to build HTTP client: {err}");
            ComponentError::HttpClient(err.to_string())
        })?;
        Ok(Self { client })
    }

    /// Follow redirects with a HEAD request and return the effective URL.
    pub async fn resolve(&self, url: &str) -> ComponentResult<String> {
        let resp = self
            .client
            .head(url)
            .send()
            .await
            .map_err(|e| classify_request_error(url, e))?;
        let effective = resp.url().to_string();
        let status = resp.status();
        if status != StatusCode::OK {
            warn!("fetch: {url} resolved to {effective} with status {status}");
            return Err(ComponentError::BadStatus {
                url: effective,
                status: status.as_u16(),
            });
        }
        if effective != url {
            debug!("fetch: {url} redirected to {effective}");
        }
        Ok(effective)
    }

    /// Download `url` into `dest`, calling `progress(count, block_size, total_size)`.
    ///
    /// With a known `Content-Length` the callback fires once per 1024-byte block;
    /// otherwise the body is written in one go followed by a single `(1, 1, 1)` call.
    /// A failed transfer may leave a partial file behind; callers must not trust it.
    pub async fn fetch<F>(
        &self,
        url: &str,
        dest: &Path,
        cancel: Option<&AtomicBool>,
        mut progress: F,
    ) -> ComponentResult<u64>
    where
        F: FnMut(u64, u64, u64),
    {
        if cancel_requested(cancel) {
            return Err(ComponentError::Cancelled);
        }
        let effective = self.resolve(url).await?;

        let response = self
            .client
            .get(&effective)
            .send()
            .await
            .map_err(|e| classify_request_error(&effective, e))?;
        let status = response.status();
        if status != StatusCode::OK {
            warn!("fetch: GET {effective} returned {status}");
            return Err(ComponentError::BadStatus {
                url: effective,
                status: status.as_u16(),
            });
        }

        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| ComponentError::io("failed to create download dir", e))?;
        }
        let mut file = File::create(dest)
            .await
            .map_err(|e| ComponentError::io(format!("failed to create {}", dest.display()), e))?;

        let received = match response.content_length().filter(|len| *len > 0) {
            Some(total) => {
                let mut stream = response.bytes_stream();
                let mut received: u64 = 0;
                let mut count: u64 = 0;
                while let Some(chunk) = stream.next().await {
                    if cancel_requested(cancel) {
                        drop(file);
                        let _ = fs::remove_file(dest).await;
                        warn!("fetch: cancelled while downloading {effective}");
                        return Err(ComponentError::Cancelled);
                    }
                    let chunk = chunk.map_err(|e| classify_request_error(&effective, e))?;
                    file.write_all(&chunk)
                        .await
                        .map_err(|e| ComponentError::io("write error", e))?;
                    received += chunk.len() as u64;
                    while count < received.div_ceil(BLOCK_SIZE) {
                        count += 1;
                        progress(count, BLOCK_SIZE, total);
                    }
                }
                if received < total {
                    return Err(ComponentError::Network(format!(
                        "download incomplete: received {received} of {total} bytes"
                    )));
                }
                received
            }
            None => {
                let body = response
                    .bytes()
                    .await
                    .map_err(|e| classify_request_error(&effective, e))?;
                file.write_all(&body)
                    .await
                    .map_err(|e| ComponentError::io("write error", e))?;
                progress(1, 1, 1);
                body.len() as u64
            }
        };

        file.flush()
            .await
            .map_err(|e| ComponentError::io("flush error", e))?;
        info!("fetch: saved {} ({received} bytes)", dest.display());
        Ok(received)
    }
}

/// Split request failures into TLS problems and everything else.
fn classify_request_error(url: &str, err: reqwest::Error) -> ComponentError {
    let mut tls = false;
    let mut source: Option<&dyn StdError> = Some(&err);
    while let Some(current) = source {
        let text = current.to_string().to_lowercase();
        if text.contains("certificate") || text.contains("tls") || text.contains("ssl") {
            tls = true;
            break;
        }
        source = current.source();
    }
    let detail = format!("{url}: {err}");
    if tls {
        warn!("fetch: TLS failure for {detail}");
        ComponentError::Tls(detail)
    } else {
        warn!("fetch: network failure for {detail}");
        ComponentError::Network(detail)
    }
}
