//! Domain logic shared by the generation client and the CLI.
//!
//! Nothing in this crate touches the network: workflow templates and
//! payload building, the on-disk settings record, the annotation
//! collaborators and dataset import/export live here.

pub mod annotation;
pub mod dataset;
pub mod error;
pub mod settings;
pub mod types;
pub mod workflow;
