//! rstage: run tree-shaped messages through scripts on a pooled Rserve
//! interpreter.
//!
//! Values flow between a [`tree::Message`] and interpreter variables through
//! the bindings declared in a [`config::Config`]; a [`stage::Stage`] leases a
//! session per message and runs the evaluate script between pushing the
//! inputs and pulling the outputs.

pub mod binding;
pub mod cli;
pub mod coerce;
pub mod config;
pub mod error;
pub mod memory;
pub mod path;
pub mod pool;
pub mod qap;
pub mod remote;
pub mod resource;
pub mod rserve;
pub mod runner;
pub mod session;
pub mod stage;
pub mod table;
pub mod tree;
pub mod value;
pub mod variable;
pub mod xml;
