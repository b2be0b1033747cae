//! # Secret Sync Pipeline
//!
//! A multi-store secrets synchronization engine. Secrets flow from source
//! stores (Vault KV mounts, AWS Secrets Manager scopes) through an
//! intermediate merge store (Vault or S3) into destination stores across
//! accounts, driven by one declarative configuration file.
//!
//! ## Overview
//!
//! 1. **Config** — a single YAML document declares sources, the merge
//!    store, static and dynamic targets, and pipeline tuning
//! 2. **Graph** — imports form a DAG over sources and targets; inherited
//!    targets layer on top of their parents
//! 3. **Merge phase** — each target's imports are deep-merged into the
//!    merge store, in dependency order
//! 4. **Sync phase** — merged secrets are written to each target account
//!    through an assumed role, in parallel
//! 5. **Diff** — every secret is classified added/removed/modified/
//!    unchanged; zero-sum runs signal a clean migration in CI
//!
//! The same engine backs the one-shot `sspctl pipeline` command and the
//! long-running `sspctl operator` mode watching file-system sync specs.

pub mod aws;
pub mod cli;
pub mod config;
pub mod diff;
pub mod graph;
pub mod merge;
pub mod observability;
pub mod pipeline;
pub mod store;
pub mod sync;

pub use config::Config;
pub use diff::{OutputFormat, PipelineDiff};
pub use graph::Graph;
pub use pipeline::{Operation, Options, Pipeline};
