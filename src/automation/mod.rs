//! Auto-join automation.
//!
//! This module provides:
//! - Application configuration loaded from config.json
//! - Per-tick screen scanning into detection snapshots
//! - The join state machine
//! - The session runner tying capture, detection and input together

pub mod config;
pub mod detection;
pub mod runner;
pub mod state;

pub use config::{AppConfig, CaptureConfig};
pub use detection::{DetectionSnapshot, OptionalTemplates, Scanner};
pub use runner::Session;
pub use state::{Action, CallbackId, JoinState, JoinStateMachine, SessionInfo, StateMachineConfig};
