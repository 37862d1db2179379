//! Consumer handles to package files.

mod registry;

pub use registry::{MwmHandle, MwmRegistry, RegResult};
