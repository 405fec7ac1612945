//! Download request data structures

use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};
use url::Url;

use crate::error::TransferError;

/// Caller-supplied description of one transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadConfig {
    /// Network URL, `file://` URI or bare local path
    pub source: String,
    /// Path of the output file relative to the download root
    pub destination: PathBuf,
}

impl DownloadConfig {
    pub fn new(source: impl Into<String>, destination: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            destination: destination.into(),
        }
    }

    pub fn locator(&self) -> std::result::Result<SourceLocator, TransferError> {
        SourceLocator::parse(&self.source)
    }

    /// Join the destination onto `root`, refusing paths that would leave it.
    pub fn resolve_destination(&self, root: &Path) -> std::result::Result<PathBuf, TransferError> {
        if self.destination.as_os_str().is_empty() {
            return Err(TransferError::invalid_path("destination path is empty"));
        }

        for component in self.destination.components() {
            match component {
                Component::Normal(_) | Component::CurDir => {}
                Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                    return Err(TransferError::invalid_path(format!(
                        "destination {} escapes the download root",
                        self.destination.display()
                    )));
                }
            }
        }

        Ok(root.join(&self.destination))
    }
}

/// Where the bytes come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceLocator {
    Local(PathBuf),
    Remote(Url),
}

impl SourceLocator {
    pub fn parse(source: &str) -> std::result::Result<Self, TransferError> {
        let source = source.trim();

        if has_drive_prefix(source) {
            return Ok(SourceLocator::Local(PathBuf::from(source)));
        }

        match Url::parse(source) {
            Ok(url) if url.scheme() == "file" => url
                .to_file_path()
                .map(SourceLocator::Local)
                .map_err(|_| {
                    TransferError::invalid_path(format!("{} does not name a local path", url))
                }),
            Ok(url) => Ok(SourceLocator::Remote(url)),
            Err(url::ParseError::RelativeUrlWithoutBase) if !source.is_empty() => {
                Ok(SourceLocator::Local(PathBuf::from(source)))
            }
            Err(e) => Err(TransferError::invalid_path(format!(
                "invalid source {:?}: {}",
                source, e
            ))),
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self, SourceLocator::Local(_))
    }
}

// `C:\data\file.bin` would otherwise parse with the drive letter as scheme
fn has_drive_prefix(source: &str) -> bool {
    let bytes = source.as_bytes();
    bytes.len() >= 2
        && bytes[0].is_ascii_alphabetic()
        && bytes[1] == b':'
        && (bytes.len() == 2 || bytes[2] == b'\\' || bytes[2] == b'/')
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadStatus {
    /// Prepared but not yet scheduled
    Pending,
    /// Transfer running
    InProgress,
    /// Every byte written to the destination
    Succeeded,
    /// Transfer ended with an error or was cancelled
    Failed,
}

impl DownloadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DownloadStatus::Pending => "pending",
            DownloadStatus::InProgress => "inprogress",
            DownloadStatus::Succeeded => "succeeded",
            DownloadStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, DownloadStatus::Succeeded | DownloadStatus::Failed)
    }
}

impl std::str::FromStr for DownloadStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(DownloadStatus::Pending),
            "inprogress" | "in_progress" => Ok(DownloadStatus::InProgress),
            "succeeded" => Ok(DownloadStatus::Succeeded),
            "failed" => Ok(DownloadStatus::Failed),
            _ => Err(format!("Unknown download status: {}", s)),
        }
    }
}

impl std::fmt::Display for DownloadStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_remote() {
        let locator = SourceLocator::parse("https://example.com/assets/pack.bin").unwrap();
        match locator {
            SourceLocator::Remote(url) => assert_eq!(url.host_str(), Some("example.com")),
            other => panic!("expected remote, got {:?}", other),
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_parse_local() {
        assert_eq!(
            SourceLocator::parse("file:///tmp/source.bin").unwrap(),
            SourceLocator::Local(PathBuf::from("/tmp/source.bin"))
        );
        assert_eq!(
            SourceLocator::parse("/tmp/source.bin").unwrap(),
            SourceLocator::Local(PathBuf::from("/tmp/source.bin"))
        );
    }

    #[test]
    fn test_parse_drive_letter_is_local() {
        let locator = SourceLocator::parse(r"C:\data\source.bin").unwrap();
        assert!(locator.is_local());
    }

    #[test]
    fn test_unknown_scheme_goes_to_network() {
        let locator = SourceLocator::parse("gopher://example.com/x").unwrap();
        assert!(!locator.is_local());
    }

    #[test]
    fn test_empty_source_is_rejected() {
        assert!(SourceLocator::parse("").is_err());
    }

    #[test]
    fn test_resolve_destination() {
        let root = Path::new("/data");
        let config = DownloadConfig::new("https://example.com/a", "packs/a.bin");
        assert_eq!(
            config.resolve_destination(root).unwrap(),
            PathBuf::from("/data/packs/a.bin")
        );

        let escaping = DownloadConfig::new("https://example.com/a", "../a.bin");
        assert!(escaping.resolve_destination(root).is_err());

        let empty = DownloadConfig::new("https://example.com/a", "");
        assert!(empty.resolve_destination(root).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_absolute_destination_is_rejected() {
        let config = DownloadConfig::new("https://example.com/a", "/etc/passwd");
        assert!(config.resolve_destination(Path::new("/data")).is_err());
    }

    #[test]
    fn test_status_round_trip_and_terminal() {
        for status in [
            DownloadStatus::Pending,
            DownloadStatus::InProgress,
            DownloadStatus::Succeeded,
            DownloadStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<DownloadStatus>().unwrap(), status);
        }

        assert!(!DownloadStatus::InProgress.is_terminal());
        assert!(DownloadStatus::Failed.is_terminal());
        assert!("cancelled".parse::<DownloadStatus>().is_err());
    }
}
