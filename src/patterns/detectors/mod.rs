//! One module per structural pattern detector (§4.4.1–§4.4.7).

pub mod burst;
pub mod cycle;
pub mod layering;
pub mod motif;
pub mod network;
pub mod proximity;
pub mod threshold;
