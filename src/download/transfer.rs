use std::path::Path;
use std::time::Duration;

use futures::StreamExt;
use sha2::{Digest, Sha256};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use crate::error::DownloadError;
use crate::http::HttpClient;

/// What a finished transfer produced
#[derive(Debug, Clone, PartialEq)]
pub struct TransferOutcome {
    pub bytes_downloaded: u64,
    pub total_bytes: Option<u64>,
    /// "sha256:<hex>" of the written bytes
    pub content_hash: String,
}

/// Stream `url` into `partial_path`, truncating anything already there.
///
/// Gives up with `Stalled` when no chunk arrives within `inactivity_timeout`
/// and with `Cancelled` as soon as `cancel` fires. `on_progress` receives the
/// running byte count and the expected total. The caller owns renaming the
/// partial file into place.
pub async fn stream_to_partial<C, P>(
    client: &C,
    url: &str,
    partial_path: &Path,
    inactivity_timeout: Duration,
    cancel: &CancellationToken,
    mut on_progress: P,
) -> Result<TransferOutcome, DownloadError>
where
    C: HttpClient,
    P: FnMut(u64, Option<u64>),
{
    let response = tokio::select! {
        _ = cancel.cancelled() => return Err(DownloadError::Cancelled),
        response = tokio::time::timeout(inactivity_timeout, client.get_stream(url)) => response,
    };
    let response = response
        .map_err(|_| DownloadError::Stalled {
            url: url.to_string(),
            timeout: inactivity_timeout,
        })?
        .map_err(|e| DownloadError::HttpFailed {
            url: url.to_string(),
            source: e,
        })?;

    if response.status >= 400 {
        return Err(DownloadError::HttpStatus {
            url: url.to_string(),
            status: response.status,
        });
    }

    let total_bytes = response.content_length;
    let mut file = File::create(partial_path)
        .await
        .map_err(|e| DownloadError::FileCreateFailed {
            path: partial_path.to_path_buf(),
            source: e,
        })?;

    let mut hasher = Sha256::new();
    let mut bytes_downloaded: u64 = 0;
    let mut stream = response.body;

    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => return Err(DownloadError::Cancelled),
            next = tokio::time::timeout(inactivity_timeout, stream.next()) => next,
        };

        let chunk = match next {
            Err(_) => {
                return Err(DownloadError::Stalled {
                    url: url.to_string(),
                    timeout: inactivity_timeout,
                });
            }
            Ok(None) => break,
            Ok(Some(chunk)) => chunk.map_err(|e| DownloadError::StreamFailed {
                url: url.to_string(),
                source: e,
            })?,
        };

        file.write_all(&chunk)
            .await
            .map_err(|e| DownloadError::FileWriteFailed {
                path: partial_path.to_path_buf(),
                source: e,
            })?;
        hasher.update(&chunk);

        bytes_downloaded += chunk.len() as u64;
        on_progress(bytes_downloaded, total_bytes);
    }

    // Ensure all data is flushed to disk
    file.flush()
        .await
        .map_err(|e| DownloadError::FileWriteFailed {
            path: partial_path.to_path_buf(),
            source: e,
        })?;

    Ok(TransferOutcome {
        bytes_downloaded,
        total_bytes,
        content_hash: format!("sha256:{:x}", hasher.finalize()),
    })
}

/// Fraction of the transfer done; 0 while the total is unknown
pub fn progress_fraction(bytes_downloaded: u64, total_bytes: Option<u64>) -> f64 {
    match total_bytes {
        Some(total) if total > 0 => (bytes_downloaded as f64 / total as f64).min(1.0),
        _ => 0.0,
    }
}
