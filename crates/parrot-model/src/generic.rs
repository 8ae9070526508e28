use serde::{Deserialize, Serialize};

use crate::payload::Payload;

/// Which peer produced a captured frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Application -> dependency.
    Client,
    /// Dependency -> application.
    Server,
}

/// One read's worth of bytes on an unclassified stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenericFrame {
    pub direction: Direction,
    pub payload: Payload,
    /// Nanoseconds between the previous frame in the same direction and this
    /// one, replayed as pacing.
    #[serde(default)]
    pub read_delay_ns: u64,
}

/// Capture of a full unclassified connection, frames in arrival order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct GenericSpec {
    pub frames: Vec<GenericFrame>,
}

impl GenericSpec {
    pub fn requests(&self) -> impl Iterator<Item = &GenericFrame> {
        self.frames
            .iter()
            .filter(|f| f.direction == Direction::Client)
    }

    pub fn responses(&self) -> impl Iterator<Item = &GenericFrame> {
        self.frames
            .iter()
            .filter(|f| f.direction == Direction::Server)
    }
}
