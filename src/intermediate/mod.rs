//! Intermediate stages supplementing the core pipeline (spec §11): plugins
//! implementing `plugin::IntermediatePlugin` that are part of this crate
//! itself rather than left to a host application, grounded in the
//! original's `intermediate/anonymization` and `intermediate/odip`
//! directories.

pub mod anonymization;
pub mod odip;
