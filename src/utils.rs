use url::Url;

use crate::error::{Result, TransferError};

pub fn get_filename_from_url(url_str: &str) -> Result<String> {
    let url = Url::parse(url_str).map_err(|e| TransferError::InvalidUrl(format!("{}: {}", url_str, e)))?;

    if !matches!(url.scheme(), "http" | "https") {
        return Err(TransferError::InvalidUrl(format!(
            "{}: unsupported scheme {}",
            url_str,
            url.scheme()
        )));
    }

    if let Some(segments) = url.path_segments() {
        if let Some(filename) = segments.last() {
            if !filename.is_empty() {
                return Ok(filename.to_string());
            }
        }
    }

    // Fallback if no filename found in path
    Ok(format!("download_{}", uuid::Uuid::new_v4()))
}

pub fn sanitize_filename(filename: &str) -> String {
    let cleaned = filename.replace(|c: char| !c.is_alphanumeric() && c != '.' && c != '-' && c != '_', "_");
    // A bare "." or ".." would escape or alias the download directory.
    if cleaned.chars().all(|c| c == '.') {
        cleaned.replace('.', "_")
    } else {
        cleaned
    }
}

/// Stable transfer id for a URL: the sanitized last path segment.
pub fn transfer_id(url_str: &str) -> Result<String> {
    Ok(sanitize_filename(&get_filename_from_url(url_str)?))
}
