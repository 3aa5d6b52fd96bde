//! Transfers and their on-disk progress records.
//!
//! A record is three lines of text, `Download URL:`, `Downloaded: N / T` and
//! `Status:`, where a total of `0` means the length is unknown.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

const URL_PREFIX: &str = "Download URL:";
const DOWNLOADED_PREFIX: &str = "Downloaded:";
const STATUS_PREFIX: &str = "Status:";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    InProgress,
    Paused,
    Completed,
    Failed,
}

impl TransferStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferStatus::InProgress => "in-progress",
            TransferStatus::Paused => "paused",
            TransferStatus::Completed => "completed",
            TransferStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TransferStatus::Completed | TransferStatus::Failed)
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransferStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "in-progress" => Ok(TransferStatus::InProgress),
            "paused" => Ok(TransferStatus::Paused),
            "completed" => Ok(TransferStatus::Completed),
            "failed" => Ok(TransferStatus::Failed),
            other => Err(format!("unknown status {:?}", other)),
        }
    }
}

/// One unit of work: a URL and the file it is written to.
#[derive(Debug, Clone)]
pub struct Transfer {
    pub id: String,
    pub source_url: String,
    pub destination: PathBuf,
    pub bytes_downloaded: u64,
    /// `0` when the server never reported a length.
    pub bytes_total: u64,
    pub status: TransferStatus,
}

impl Transfer {
    pub fn new(id: impl Into<String>, source_url: impl Into<String>, destination: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            source_url: source_url.into(),
            destination: destination.into(),
            bytes_downloaded: 0,
            bytes_total: 0,
            status: TransferStatus::InProgress,
        }
    }

    pub fn total(&self) -> Option<u64> {
        (self.bytes_total > 0).then_some(self.bytes_total)
    }

    pub fn to_record(&self) -> ProgressRecord {
        ProgressRecord {
            url: self.source_url.clone(),
            downloaded: self.bytes_downloaded,
            total: self.bytes_total,
            status: self.status,
        }
    }
}

/// Durable resumability state for one transfer, as stored in its sidecar file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressRecord {
    pub url: String,
    pub downloaded: u64,
    pub total: u64,
    pub status: TransferStatus,
}

impl ProgressRecord {
    #[cfg(test)]
    pub fn new(url: impl Into<String>, status: TransferStatus) -> Self {
        Self {
            url: url.into(),
            downloaded: 0,
            total: 0,
            status,
        }
    }

    pub fn total(&self) -> Option<u64> {
        (self.total > 0).then_some(self.total)
    }

    /// Percentage complete, or `None` when the total is unknown.
    pub fn percent(&self) -> Option<f64> {
        self.total()
            .map(|total| (self.downloaded as f64 / total as f64) * 100.0)
    }

    pub fn to_text(&self) -> String {
        format!(
            "{} {}\n{} {} / {}\n{} {}\n",
            URL_PREFIX, self.url, DOWNLOADED_PREFIX, self.downloaded, self.total, STATUS_PREFIX, self.status
        )
    }

    /// Parse the three-line sidecar format.
    ///
    /// `Downloaded: N` without a total is accepted and means the total is unknown.
    /// Unrecognised lines are ignored.
    pub fn parse(text: &str) -> Result<Self, String> {
        let mut url = None;
        let mut counts = None;
        let mut status = None;

        for line in text.lines() {
            let line = line.trim();
            if let Some(rest) = line.strip_prefix(URL_PREFIX) {
                let rest = rest.trim();
                if !rest.is_empty() {
                    url = Some(rest.to_string());
                }
            } else if let Some(rest) = line.strip_prefix(DOWNLOADED_PREFIX) {
                counts = Some(parse_counts(rest)?);
            } else if let Some(rest) = line.strip_prefix(STATUS_PREFIX) {
                status = Some(rest.parse::<TransferStatus>()?);
            }
        }

        let url = url.ok_or("missing URL line")?;
        let (downloaded, total) = counts.ok_or("missing downloaded line")?;
        let status = status.ok_or("missing status line")?;

        Ok(Self {
            url,
            downloaded,
            total,
            status,
        })
    }
}

fn parse_counts(raw: &str) -> Result<(u64, u64), String> {
    let mut parts = raw.splitn(2, '/');
    let downloaded = parts
        .next()
        .unwrap_or_default()
        .trim()
        .parse::<u64>()
        .map_err(|e| format!("bad downloaded count: {}", e))?;
    let total = match parts.next() {
        Some(t) => t
            .trim()
            .parse::<u64>()
            .map_err(|e| format!("bad total count: {}", e))?,
        None => 0,
    };
    Ok((downloaded, total))
}
