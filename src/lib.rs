//! # mcbuild - Model-Driven Embedded Build Orchestrator
//!
//! mcbuild (`mcb`) drives embedded C/C++ toolchains (armcc, armclang, GCC,
//! SDCC, Keil C51 and friends) from two JSON documents: a **compiler model**
//! describing the toolchain's command-line grammar, and a **project
//! parameter** document with sources, paths, defines and option values.
//!
//! ## Features
//!
//! - **Declarative Toolchains**: one model document per compiler family
//! - **Incremental Rebuilds**: include-graph staleness tracking with a
//!   persisted cache
//! - **Parallel Compilation**: worker pool sized to the pending work
//! - **Post-Link Pipeline**: hex/bin extraction, map-report parsing,
//!   RAM/ROM usage bars
//!
//! ## Quick Start
//!
//! ```bash
//! # Full build
//! mcb build -m gcc.model.json -p params.json -b /opt/gcc-arm
//!
//! # Incremental build
//! mcb build -m gcc.model.json -p params.json -b /opt/gcc-arm --fast
//! ```
//!
//! ## Module Organization
//!
//! - [`render`] - Command synthesis from model + parameters
//! - [`depscan`] - Include-graph staleness tracking
//! - [`driver`] - Build sequencing and the worker pool
//! - [`model`] / [`params`] - The two input documents

/// Include-graph staleness tracking and the persisted record store.
pub mod depscan;

/// Build sequencing, compile fan-out, linking, map-report handling.
pub mod driver;

/// External tool invocation and environment expansion.
pub mod exec;

/// Compiler model document parsing and validation.
pub mod model;

/// Project parameter document parsing and normalization.
pub mod params;

/// Command-line synthesis from model and parameters.
pub mod render;

/// Pre/post build shell hooks.
pub mod tasks;

/// Terminal UI utilities (tables, diagnostics coloring, usage bars).
pub mod ui;
