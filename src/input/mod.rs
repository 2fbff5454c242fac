//! Human-like mouse and keyboard input.

pub mod device;
pub mod path;
pub mod simulator;
pub mod timing;

pub use device::{InputBackend, InputDevice, Key, MouseButton};
pub use simulator::{MotionConfig, MotionSimulator, Sleeper, ThreadSleeper};
pub use timing::GaussianDelay;
