//! Code-acting LLM agent for adsorbing ligands on catalytic surfaces.
//!
//! The model writes Python; [`sandbox::Sandbox`] runs it in a persistent worker and
//! threads the resulting variables from turn to turn; [`tools::ToolRegistry`] exposes
//! the chemistry helpers as structured tool calls; [`agent::Agent`] drives the loop.

pub mod agent;
pub mod cache;
pub mod config;
pub mod llm;
pub mod prompt;
pub mod sandbox;
pub mod tools;
