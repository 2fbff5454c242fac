//! joinsim - automatic server joining for ARK: Survival Ascended.
//!
//! Watches the game window for the join button, clicks it with human-like
//! mouse motion and retries until the join goes through.

pub mod automation;
pub mod capture;
pub mod input;
pub mod logger;
pub mod paths;
pub mod vision;
