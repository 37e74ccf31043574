use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Data-transfer progress notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ProgressEvent {
    /// The first byte is about to be read.
    Started,
    /// Bytes moved since the previous `Rw` event.
    #[serde(rename_all = "camelCase")]
    Rw {
        rw_once_bytes: u64,
        consumed_bytes: u64,
        total_bytes: u64,
    },
    /// A read failed with something other than end-of-stream.
    Failed,
    /// Every declared byte has been consumed.
    #[serde(rename_all = "camelCase")]
    Succeeded {
        consumed_bytes: u64,
        total_bytes: u64,
    },
}

impl ProgressEvent {
    /// Returns the completion ratio carried by the event, if any.
    pub fn fraction(&self) -> Option<f64> {
        match *self {
            Self::Rw {
                consumed_bytes,
                total_bytes,
                ..
            }
            | Self::Succeeded {
                consumed_bytes,
                total_bytes,
            } => {
                if total_bytes == 0 {
                    Some(1.0)
                } else {
                    Some(consumed_bytes as f64 / total_bytes as f64)
                }
            }
            _ => None,
        }
    }
}

/// Sink for progress events; shared by every part stream of a transfer.
pub type ProgressListener = Arc<dyn Fn(ProgressEvent) + Send + Sync>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rw_event_json_shape() {
        let ev = ProgressEvent::Rw {
            rw_once_bytes: 4,
            consumed_bytes: 8,
            total_bytes: 16,
        };
        let v = serde_json::to_value(ev).unwrap();
        assert_eq!(v["type"], "rw");
        assert_eq!(v["rwOnceBytes"], 4);
        assert_eq!(v["consumedBytes"], 8);
    }

    #[test]
    fn fraction_of_events() {
        assert_eq!(ProgressEvent::Started.fraction(), None);
        let ev = ProgressEvent::Succeeded {
            consumed_bytes: 0,
            total_bytes: 0,
        };
        assert_eq!(ev.fraction(), Some(1.0));
        let ev = ProgressEvent::Rw {
            rw_once_bytes: 1,
            consumed_bytes: 1,
            total_bytes: 4,
        };
        assert_eq!(ev.fraction(), Some(0.25));
    }
}
