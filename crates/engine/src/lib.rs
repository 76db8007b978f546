mod broll;
pub mod color;
pub mod compiler;
pub mod diff;
pub mod guide;
pub mod registry;
mod selection;
pub mod timeline;

pub use color::{ColorLibrary, ColorPreset, ColorResolver};
pub use compiler::*;
pub use diff::{diff_snapshot, expected_items, PlacementKey, SnapshotDiff, SnapshotItem, TimelineSnapshot};
pub use guide::ManualGuide;
pub use registry::{Clip, ClipFeedEntry, ClipKey, ClipRegistry, RegistryError};
pub use timeline::*;
