//! Infrastructure layer: background workers and broker backends.

pub mod background;
pub mod broker;
