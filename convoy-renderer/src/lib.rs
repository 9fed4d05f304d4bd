//! # convoy-renderer
//!
//! Turns a checked-out desired-state tree into a [`RenderedUnitSet`]: every
//! Quadlet unit parsed and validated, `${VAR}` references resolved against
//! the host, and a SHA-256 checksum per installed file.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::collections::BTreeMap;
//! use std::path::{Path, PathBuf};
//! use convoy_core::CommitRef;
//! use convoy_renderer::{HostEnv, Renderer};
//!
//! let renderer = Renderer::new(vec![PathBuf::from(".")], HostEnv::capture(&BTreeMap::new()));
//! if let Ok(result) = renderer.render(Path::new("/srv/units"), &CommitRef::from("abc")) {
//!     for unit in result.units.iter() {
//!         println!("{} {}", unit.checksum, unit.name);
//!     }
//!     for error in &result.errors {
//!         eprintln!("{error}");
//!     }
//! }
//! ```

pub mod error;
pub mod health;
pub mod render;
pub mod substitute;
pub mod unit;

pub use error::RenderError;
pub use render::{
    checksum, RenderResult, RenderWarning, RenderedUnit, RenderedUnitSet, Renderer,
    ValidationError,
};
pub use substitute::HostEnv;
pub use unit::{service_for_file, FileKind};
