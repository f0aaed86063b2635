pub mod wire;
pub mod proto;
pub mod pathmap;
pub mod sidecar;
pub mod idmap;
pub mod processor;
pub mod overlay;
pub mod launcher;
pub mod fs;
pub mod pty;
pub mod relay;

pub use launcher::{BindMount, ChildParams, LaunchConfig, OverlayParams, launch};
pub use pathmap::{AttrType, PathMap};
pub use processor::{ChownPolicy, Processor};
