//! Gradient bookkeeping, task-gradient surgery and the Adam update.

pub mod adam;
pub mod grads;
pub mod surgery;

pub use adam::{Adam, AdamConfig, StepLr};
pub use grads::ParamGradients;
pub use surgery::{discover_probe, GradientSurgery, SurgeryStats};
