// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::path::Path;
use std::time::Duration;

use bytes::Bytes;
use url::Url;

use crate::error::FeedError;
use crate::http::HttpClient;

/// Fetch raw feed bytes from a URL, giving up after `timeout`
pub async fn fetch_feed_bytes<C: HttpClient>(
    client: &C,
    url: &str,
    timeout: Duration,
) -> Result<Bytes, FeedError> {
    match tokio::time::timeout(timeout, client.get_bytes(url)).await {
        Ok(Ok(bytes)) => Ok(bytes),
        Ok(Err(e)) => Err(FeedError::FetchFailed {
            url: url.to_string(),
            source: e,
        }),
        Err(_) => Err(FeedError::FetchTimedOut {
            url: url.to_string(),
            timeout,
        }),
    }
}

/// Read raw feed bytes from a local file
pub async fn read_feed_file(path: &Path) -> Result<Vec<u8>, FeedError> {
    tokio::fs::read(path)
        .await
        .map_err(|e| FeedError::FileReadFailed {
            path: path.to_path_buf(),
            source: e,
        })
}

/// Construct a file:// URL for a local file path
pub fn file_path_to_url(path: &Path) -> Result<Url, FeedError> {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map_err(|e| FeedError::FileReadFailed {
                path: path.to_path_buf(),
                source: e,
            })?
            .join(path)
    };

    match Url::from_file_path(&absolute) {
        Ok(url) => Ok(url),
        Err(()) => Ok(Url::parse(&format!("file://{}", absolute.display()))?),
    }
}

/// Determine if a feed location is an HTTP(S) URL rather than a file path
pub fn is_url(source: &str) -> bool {
    source.starts_with("http://") || source.starts_with("https://")
}

/// Get the bytes of a feed from the network or from disk
pub async fn load_feed_bytes<C: HttpClient>(
    client: &C,
    source: &str,
    timeout: Duration,
) -> Result<Bytes, FeedError> {
    if is_url(source) {
        fetch_feed_bytes(client, source, timeout).await
    } else {
        let path = source.strip_prefix("file://").unwrap_or(source);
        read_feed_file(Path::new(path)).await.map(Bytes::from)
    }
}

/// The canonical URL recorded for a feed location
pub fn feed_location_url(source: &str) -> Result<Url, FeedError> {
    if is_url(source) || source.starts_with("file://") {
        Ok(Url::parse(source)?)
    } else {
        file_path_to_url(Path::new(source))
    }
}
