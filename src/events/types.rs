//! Typed bridge events
//!
//! The original bridge dispatched events by name string; here the event set
//! is a closed union so handlers receive a typed payload and the subscription
//! table can key on the discriminant.

use serde::{Deserialize, Serialize};

/// Event discriminant, used as the subscription/handler table key.
///
/// `as_str()` returns the wire name the frontend sees.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    Shell,
    DownloadProgress,
    UploadProgress,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Shell => "Shell",
            EventKind::DownloadProgress => "DownloadProgress",
            EventKind::UploadProgress => "UploadProgress",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Out-of-band event published by an engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "name", content = "value")]
pub enum Event {
    /// Interactive shell output chunk
    Shell(String),
    /// Download progress update
    DownloadProgress(TransferProgress),
    /// Upload progress update
    UploadProgress(TransferProgress),
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::Shell(_) => EventKind::Shell,
            Event::DownloadProgress(_) => EventKind::DownloadProgress,
            Event::UploadProgress(_) => EventKind::UploadProgress,
        }
    }
}

/// Transfer progress information
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferProgress {
    /// Bytes transferred so far
    pub transferred_bytes: u64,
    /// Total bytes to transfer
    pub total_bytes: u64,
}

impl TransferProgress {
    /// Calculate progress percentage (0-100)
    pub fn percentage(&self) -> f64 {
        if self.total_bytes == 0 {
            100.0
        } else {
            (self.transferred_bytes as f64 / self.total_bytes as f64) * 100.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_wire_names() {
        assert_eq!(EventKind::Shell.as_str(), "Shell");
        assert_eq!(EventKind::DownloadProgress.as_str(), "DownloadProgress");
        assert_eq!(EventKind::UploadProgress.as_str(), "UploadProgress");
    }

    #[test]
    fn test_event_kind_matches_payload() {
        let ev = Event::Shell("ls\r\n".to_string());
        assert_eq!(ev.kind(), EventKind::Shell);

        let ev = Event::UploadProgress(TransferProgress {
            transferred_bytes: 10,
            total_bytes: 100,
        });
        assert_eq!(ev.kind(), EventKind::UploadProgress);
    }

    #[test]
    fn test_percentage() {
        let p = TransferProgress {
            transferred_bytes: 25,
            total_bytes: 100,
        };
        assert_eq!(p.percentage(), 25.0);

        // Zero-length transfers count as complete
        let p = TransferProgress {
            transferred_bytes: 0,
            total_bytes: 0,
        };
        assert_eq!(p.percentage(), 100.0);
    }

    #[test]
    fn test_event_serializes_with_wire_name() {
        let ev = Event::DownloadProgress(TransferProgress {
            transferred_bytes: 512,
            total_bytes: 1024,
        });
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["name"], "DownloadProgress");
        assert_eq!(json["value"]["transferredBytes"], 512);
    }
}
