pub mod provider;

pub use provider::{HttpSnapshotProvider, SnapshotProvider};
