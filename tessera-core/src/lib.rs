//! Tessera Core Library
//!
//! Daemonless container image building: a layered snapshot engine, a
//! content store, a distributed layer cache and the plan/stage/node build
//! machinery.

pub mod builder;
pub mod cache;
pub mod config;
pub mod error;
pub mod fsutil;
pub mod image;
pub mod observability;
pub mod paths;
pub mod registry;
pub mod snapshot;
pub mod storage;
pub mod tario;
pub mod worker;

// Re-export commonly used items
pub use builder::{BuildPlan, PlanOptions};
pub use config::Config;
pub use error::{Result, TesseraError};
pub use image::{DistributionManifest, ImageConfig, ImageName};
pub use observability::init as init_observability;
pub use storage::ImageStore;
pub use worker::{BuildRequest, BuildWorker, CommitMode};
