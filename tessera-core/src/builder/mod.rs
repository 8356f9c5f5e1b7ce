//! Image building for tessera.
//!
//! This module provides Dockerfile parsing, per-step caching, and the
//! plan/stage/node machinery that turns a Dockerfile into image layers.

pub mod context;
pub mod directive;
pub mod node;
pub mod parser;
pub mod plan;
pub mod runner;
pub mod stage;
pub mod step;

pub use context::BuildContext;
pub use directive::{Directive, DirectiveKind, HealthcheckConfig, RunCommand};
pub use node::{BuildNode, NodeOptions};
pub use parser::{parse_dockerfile, parse_dockerfile_file, ParseError, ParsedStage};
pub use plan::{BuildPlan, PlanOptions};
pub use runner::{CommandRunner, RunOptions, ShellRunner};
pub use stage::BuildStage;
pub use step::Step;
