//! Template-based detection of UI elements.
//!
//! This module provides:
//! - Template storage and the calibration manifest (`TemplateLibrary`)
//! - The escalating detection chain (`TemplateDetector`)
//! - The individual matchers it is built from

pub mod detector;
pub mod edges;
pub mod features;
pub mod histogram;
pub mod library;
pub mod matching;

pub use detector::{Detection, DetectorConfig, MatchStage, TemplateDetector};
pub use library::{Manifest, Resolution, SetupError, Template, TemplateLibrary};
