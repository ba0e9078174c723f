//! # virtd Deploy
//!
//! Deployment driver on top of `virtd-hypervisor`: reads a deployment
//! definition, keeps resource state in a JSON file and runs the machine
//! and network reconcilers in dependency order.

pub mod cli;
pub mod config;
pub mod deployment;
pub mod dev;
pub mod driver;
pub mod evaluator;
pub mod keys;
pub mod prompt;
pub mod state_file;

pub use config::Settings;
pub use deployment::{DefinitionError, Deployment};
pub use driver::{DeployOptions, Driver, ResourceStatus, SshTarget};
pub use evaluator::NixBuilder;
pub use keys::SshKeygen;
pub use prompt::PromptConfirm;
pub use state_file::JsonFileStore;
