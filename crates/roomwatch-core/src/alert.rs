//! Intruder alert batches and the classification reply format.

use chrono::{DateTime, Utc};
use image::RgbImage;
use uuid::Uuid;

/// Maximum number of snapshots delivered per alert.
pub const MAX_ALERT_SNAPSHOTS: usize = 3;

/// Snapshots collected for one intruder alert, awaiting human classification.
#[derive(Debug, Clone)]
pub struct AlertBatch {
    pub id: Uuid,
    /// Full-resolution frames, oldest first, at most [`MAX_ALERT_SNAPSHOTS`].
    pub images: Vec<RgbImage>,
    pub raised_at: DateTime<Utc>,
}

impl AlertBatch {
    /// Build a batch, keeping only the first [`MAX_ALERT_SNAPSHOTS`] images.
    pub fn new(mut images: Vec<RgbImage>) -> Self {
        images.truncate(MAX_ALERT_SNAPSHOTS);
        Self {
            id: Uuid::new_v4(),
            images,
            raised_at: Utc::now(),
        }
    }
}

/// Where the frame loop hands finished batches.
///
/// Implementations must not block: the frame loop never waits on delivery
/// or on the classification reply.
pub trait AlertSink {
    fn send_alert(&self, batch: AlertBatch);
}

/// The user's answer to an alert prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Known,
    Unknown,
}

impl Classification {
    pub fn as_str(self) -> &'static str {
        match self {
            Classification::Known => "known",
            Classification::Unknown => "unknown",
        }
    }

    /// Button payload tying this answer to a batch, e.g. `known:<uuid>`.
    pub fn callback_data(self, batch: Uuid) -> String {
        format!("{}:{batch}", self.as_str())
    }

    /// Parse a button payload produced by [`callback_data`](Self::callback_data).
    pub fn parse_callback(data: &str) -> Option<(Self, Uuid)> {
        let (kind, id) = data.split_once(':')?;
        let classification = match kind {
            "known" => Classification::Known,
            "unknown" => Classification::Unknown,
            _ => return None,
        };
        let id = Uuid::parse_str(id).ok()?;
        Some((classification, id))
    }
}
