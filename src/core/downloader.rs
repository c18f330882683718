use anyhow::{Context, Result};
use bytes::Bytes;
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, USER_AGENT};
use reqwest::StatusCode;
use std::path::Path;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::time::sleep;

use crate::core::model::{DownloadContext, DownloadTask};

#[derive(thiserror::Error, Debug)]
pub enum DownloadError {
    #[error("http status error: {0}")]
    Status(StatusCode),

    #[error("empty response body")]
    EmptyBody,

    #[error("response truncated: got {got} of {expected} bytes")]
    Truncated { got: u64, expected: u64 },

    #[error("response exceeded declared length: got {got}, expected {expected}")]
    Overrun { got: u64, expected: u64 },
}

/// One progress notification. `percent` is present exactly when the server
/// declared a total length; it changes at most once per value and never
/// decreases within an attempt.
#[derive(Debug, Clone, Copy)]
pub struct TransferProgress {
    pub downloaded: u64,
    pub total: Option<u64>,
    pub percent: Option<u8>,
}

pub struct ArtifactDownloader {
    client: reqwest::Client,
}

impl ArtifactDownloader {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()
            .expect("reqwest client");
        Self { client }
    }

    fn build_headers(ctx: &DownloadContext) -> Result<HeaderMap> {
        let mut h = HeaderMap::new();
        h.insert(USER_AGENT, HeaderValue::from_str(&ctx.user_agent)?);
        for (k, v) in &ctx.headers {
            let name = HeaderName::from_bytes(k.as_bytes())?;
            let value = HeaderValue::from_str(v)?;
            h.insert(name, value);
        }
        Ok(h)
    }

    fn should_retry_status(status: StatusCode) -> bool {
        status == StatusCode::TOO_MANY_REQUESTS
            || status == StatusCode::REQUEST_TIMEOUT
            || status.is_server_error()
    }

    async fn sleep_backoff(ctx: &DownloadContext, attempt: u32) {
        let base = ctx.retry_backoff_ms.max(1);
        let shift = attempt.min(16);
        let mul = 1u64 << shift;
        let ms = base.saturating_mul(mul).min(30_000);
        sleep(Duration::from_millis(ms)).await;
    }

    /// Stream `url` into `destination`, reporting progress as bytes arrive.
    ///
    /// The body is written to a `.partial` sibling and renamed into place only
    /// once the byte count checks out against the declared length, so a failed
    /// attempt never leaves a complete-looking artifact at `destination`.
    /// Returns the number of bytes written.
    pub async fn download(
        &self,
        url: &str,
        destination: &Path,
        ctx: &DownloadContext,
        mut on_progress: impl FnMut(TransferProgress),
    ) -> Result<u64> {
        let headers = Self::build_headers(ctx)?;

        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("create dir {}", parent.display()))?;
        }

        // Retries happen only until a usable response arrives. Once streaming
        // has begun, a mid-stream error fails the whole attempt, which keeps
        // the per-attempt percent sequence monotonic.
        let resp = self.request_with_retries(url, &headers, ctx).await?;

        // None when the length is undeclared or the transfer is re-encoded;
        // progress degrades to indeterminate byte counts in that case.
        let total = resp.content_length();

        if total == Some(0) {
            return Err(DownloadError::EmptyBody.into());
        }

        let mut task = DownloadTask {
            source_url: url.to_string(),
            destination: destination.to_path_buf(),
            bytes_expected: total,
            bytes_transferred: 0,
        };

        let partial = destination.with_extension("partial");
        let streamed = self
            .stream_to_file(resp, &partial, &mut task, &mut on_progress)
            .await;

        match streamed {
            Ok(()) => {
                if tokio::fs::metadata(&task.destination).await.is_ok() {
                    let _ = tokio::fs::remove_file(&task.destination).await;
                }
                tokio::fs::rename(&partial, &task.destination)
                    .await
                    .with_context(|| format!("finalize {}", task.destination.display()))?;
                Ok(task.bytes_transferred)
            }
            Err(e) => {
                let _ = tokio::fs::remove_file(&partial).await;
                Err(e)
            }
        }
    }

    async fn request_with_retries(
        &self,
        url: &str,
        headers: &HeaderMap,
        ctx: &DownloadContext,
    ) -> Result<reqwest::Response> {
        let mut last_err: Option<anyhow::Error> = None;

        for attempt in 0..=ctx.retries {
            if attempt > 0 {
                Self::sleep_backoff(ctx, attempt - 1).await;
            }

            let resp = match self
                .client
                .get(url)
                .headers(headers.clone())
                .timeout(Duration::from_secs(ctx.timeout_secs))
                .send()
                .await
            {
                Ok(r) => r,
                Err(e) => {
                    last_err = Some(e.into());
                    continue;
                }
            };

            let status = resp.status();
            if status.is_success() {
                return Ok(resp);
            }
            if Self::should_retry_status(status) {
                last_err = Some(DownloadError::Status(status).into());
                continue;
            }
            return Err(DownloadError::Status(status).into());
        }

        Err(last_err.unwrap_or_else(|| DownloadError::Status(StatusCode::REQUEST_TIMEOUT).into()))
    }

    async fn stream_to_file(
        &self,
        resp: reqwest::Response,
        partial: &Path,
        task: &mut DownloadTask,
        on_progress: &mut impl FnMut(TransferProgress),
    ) -> Result<()> {
        let mut file = tokio::fs::File::create(partial)
            .await
            .with_context(|| format!("create {}", partial.display()))?;

        let mut stream = resp.bytes_stream();
        let mut last_percent: Option<u8> = None;

        while let Some(chunk) = stream.next().await {
            let chunk: Bytes =
                chunk.with_context(|| format!("read body of {}", task.source_url))?;
            file.write_all(&chunk)
                .await
                .with_context(|| format!("write {}", partial.display()))?;
            task.bytes_transferred += chunk.len() as u64;

            match task.bytes_expected {
                Some(expected) => {
                    if task.bytes_transferred > expected {
                        return Err(DownloadError::Overrun {
                            got: task.bytes_transferred,
                            expected,
                        }
                        .into());
                    }
                    let percent = (task.bytes_transferred * 100 / expected) as u8;
                    if last_percent != Some(percent) {
                        last_percent = Some(percent);
                        on_progress(TransferProgress {
                            downloaded: task.bytes_transferred,
                            total: Some(expected),
                            percent: Some(percent),
                        });
                    }
                }
                None => on_progress(TransferProgress {
                    downloaded: task.bytes_transferred,
                    total: None,
                    percent: None,
                }),
            }
        }

        file.flush()
            .await
            .with_context(|| format!("flush {}", partial.display()))?;

        if task.bytes_transferred == 0 {
            return Err(DownloadError::EmptyBody.into());
        }
        if let Some(expected) = task.bytes_expected {
            if task.bytes_transferred < expected {
                return Err(DownloadError::Truncated {
                    got: task.bytes_transferred,
                    expected,
                }
                .into());
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::model::DownloadContext;
    use std::net::SocketAddr;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn test_ctx() -> DownloadContext {
        DownloadContext {
            retries: 2,
            retry_backoff_ms: 1,
            timeout_secs: 10,
            ..DownloadContext::default()
        }
    }

    async fn read_request(sock: &mut tokio::net::TcpStream) {
        let mut buf = vec![0u8; 4096];
        let mut seen = Vec::new();
        loop {
            let n = sock.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            seen.extend_from_slice(&buf[..n]);
            if seen.windows(4).any(|w| w == b"\r\n\r\n") {
                break;
            }
        }
    }

    /// Serve each canned response to one connection, in order.
    async fn serve(responses: Vec<Vec<u8>>) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            for response in responses {
                let (mut sock, _) = listener.accept().await.unwrap();
                read_request(&mut sock).await;
                sock.write_all(&response).await.unwrap();
                sock.shutdown().await.ok();
            }
        });
        addr
    }

    fn response_with_length(body: &[u8]) -> Vec<u8> {
        let mut r = format!(
            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            body.len()
        )
        .into_bytes();
        r.extend_from_slice(body);
        r
    }

    #[tokio::test]
    async fn download_reports_monotonic_percent_ending_at_100() {
        let body = vec![0xABu8; 1_000_000];
        let addr = serve(vec![response_with_length(&body)]).await;

        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("Orange-2.0.bin");
        let mut percents: Vec<u8> = Vec::new();

        let written = ArtifactDownloader::new()
            .download(&format!("http://{addr}/Orange.bin"), &dest, &test_ctx(), |p| {
                percents.push(p.percent.unwrap());
            })
            .await
            .unwrap();

        assert_eq!(written, 1_000_000);
        assert_eq!(std::fs::metadata(&dest).unwrap().len(), 1_000_000);
        assert!(!percents.is_empty());
        assert!(percents.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(*percents.last().unwrap(), 100);
        // At most one callback per percent value.
        let mut dedup = percents.clone();
        dedup.dedup();
        assert_eq!(dedup.len(), percents.len());
        assert!(!dest.with_extension("partial").exists());
    }

    #[tokio::test]
    async fn download_without_content_length_is_indeterminate() {
        let mut response = b"HTTP/1.1 200 OK\r\nConnection: close\r\n\r\n".to_vec();
        response.extend_from_slice(&[0x42u8; 70_000]);
        let addr = serve(vec![response]).await;

        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("Orange-2.0.bin");
        let mut updates: Vec<TransferProgress> = Vec::new();

        let written = ArtifactDownloader::new()
            .download(&format!("http://{addr}/latest"), &dest, &test_ctx(), |p| {
                updates.push(p);
            })
            .await
            .unwrap();

        assert_eq!(written, 70_000);
        assert!(updates.iter().all(|p| p.percent.is_none() && p.total.is_none()));
        assert!(updates
            .windows(2)
            .all(|w| w[0].downloaded <= w[1].downloaded));
    }

    #[tokio::test]
    async fn download_fails_on_error_status() {
        let addr = serve(vec![
            b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n".to_vec(),
        ])
        .await;

        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("Orange-2.0.bin");

        let err = ArtifactDownloader::new()
            .download(&format!("http://{addr}/missing"), &dest, &test_ctx(), |_| {})
            .await
            .unwrap_err();

        assert!(err.to_string().contains("404"));
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn download_fails_on_empty_body() {
        let addr = serve(vec![
            b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\nConnection: close\r\n\r\n".to_vec(),
        ])
        .await;

        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("Orange-2.0.bin");

        let err = ArtifactDownloader::new()
            .download(&format!("http://{addr}/empty"), &dest, &test_ctx(), |_| {})
            .await
            .unwrap_err();

        assert!(err.to_string().contains("empty response body"));
        assert!(!dest.exists());
        assert!(!dest.with_extension("partial").exists());
    }

    #[tokio::test]
    async fn download_fails_on_truncated_body() {
        // Declares 1000 bytes, sends 100, then closes.
        let mut response =
            b"HTTP/1.1 200 OK\r\nContent-Length: 1000\r\nConnection: close\r\n\r\n".to_vec();
        response.extend_from_slice(&[0u8; 100]);
        let addr = serve(vec![response]).await;

        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("Orange-2.0.bin");

        let result = ArtifactDownloader::new()
            .download(&format!("http://{addr}/cut"), &dest, &test_ctx(), |_| {})
            .await;

        assert!(result.is_err());
        assert!(!dest.exists());
        assert!(!dest.with_extension("partial").exists());
    }

    #[tokio::test]
    async fn download_retries_transient_status() {
        let body = b"artifact-bytes".to_vec();
        let addr = serve(vec![
            b"HTTP/1.1 503 Service Unavailable\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
                .to_vec(),
            response_with_length(&body),
        ])
        .await;

        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("Orange-2.0.bin");

        let written = ArtifactDownloader::new()
            .download(&format!("http://{addr}/flaky"), &dest, &test_ctx(), |_| {})
            .await
            .unwrap();

        assert_eq!(written, body.len() as u64);
        assert_eq!(std::fs::read(&dest).unwrap(), body);
    }

    #[tokio::test]
    async fn download_overwrites_previous_artifact() {
        let body = b"second-download".to_vec();
        let addr = serve(vec![response_with_length(&body)]).await;

        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("Orange-2.0.bin");
        std::fs::write(&dest, "first-download-leftover").unwrap();

        ArtifactDownloader::new()
            .download(&format!("http://{addr}/again"), &dest, &test_ctx(), |_| {})
            .await
            .unwrap();

        assert_eq!(std::fs::read(&dest).unwrap(), body);
    }
}
