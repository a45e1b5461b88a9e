//! Cryostat - JVM target discovery and rule-driven capture automation
//!
//! This library discovers JVM targets across deployment platforms, merges
//! them into one event stream and topology tree, and runs rules that start
//! captures on matching targets and keep a bounded number of periodic
//! archives of them.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//!
//! - `discovery`: platform backends (JDP, Kubernetes, Docker/Podman, custom
//!   list) and the merging client
//! - `rules`: rules, match expressions, registry, processor and archiver
//! - `credentials`: credential store scoped by match expressions
//! - `session`: interfaces to the target session service and archive store
//! - `target`: target identity
//! - `events`: listener fan-out shared by every event source
//! - `config`: configuration management and validation
//! - `logging`: tracing subscriber setup
//! - `error`: error types and result aliases
//! - `cli` and `commands`: command-line interface
//!
//! # Example
//!
//! ```no_run
//! use cryostat::rules::expression::MatchExpressionEvaluator;
//! use cryostat::target::ServiceRef;
//!
//! let evaluator = MatchExpressionEvaluator::default();
//! let target = ServiceRef::new("service:jmx:rmi:///jndi/rmi://app:9091/jmxrmi").with_alias("app");
//! assert!(evaluator.applies("target.alias == 'app'", &target).unwrap());
//! ```

pub mod cli;
pub mod commands;
pub mod config;
pub mod credentials;
pub mod discovery;
pub mod error;
pub mod events;
pub mod logging;
pub mod rules;
pub mod session;
pub mod target;

// Re-export commonly used types
pub use config::Config;
pub use discovery::{MergingPlatformClient, PlatformClient, TargetDiscoveryEvent};
pub use error::{CryostatError, Result};
pub use rules::{Rule, RuleProcessor, RuleRegistry};
pub use target::ServiceRef;
