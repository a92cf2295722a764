//! cast-deploy: versioned application instances.
//!
//! An instance is created from an extracted bundle by materializing a
//! version tree (mirrored directories, rendered templates, hard-linked
//! files, data-file links), registering a supervised service for it and
//! then pointing `current` at it. Upgrades build the next version beside
//! the active one and swap `current` atomically.

pub mod error;
pub mod files;
pub mod hooks;
pub mod instance;
pub mod manager;
pub mod rollback;
pub mod services;
pub mod templates;

pub use error::{DeployError, DeployResult};
pub use hooks::{HookRunner, HookTarget};
pub use instance::{INSTANCE_TYPE, Instance, InstanceInfo, InstanceJob};
pub use manager::{INSTANCE_MANAGER, InstanceManager};
pub use rollback::{Rollback, Undo};
pub use services::{
    MockServiceManager, RunitServiceManager, ServiceAction, ServiceDetails, ServiceManager,
    ServiceSpec, ServiceState, ServiceStatus, service_name,
};
pub use templates::{PlaceholderRenderer, TemplateRenderer, build_context};
