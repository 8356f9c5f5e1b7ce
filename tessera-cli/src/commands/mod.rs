//! CLI command implementations

pub mod build;
pub mod pull;
pub mod version;

pub use build::build;
pub use pull::pull;
pub use version::version;
