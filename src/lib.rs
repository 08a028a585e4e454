//! # boot-finder
//!
//! Static detection of Spring Boot applications in compiled Java archives.
//!
//! ## Architecture
//!
//! - **model**: Immutable descriptors for classes, methods, annotations and instruction streams
//! - **classfile**: Binary class-file decoding into the model
//! - **bytecode**: JVM opcode table and method-body decoding
//! - **archive**: JAR/WAR ingestion, including fat-jar layouts and the manifest
//! - **scan**: Archive discovery on disk and class-name/entry-path mapping
//! - **cache**: Bounded LRU cache of decoded class handles with guaranteed release
//! - **scanner**: Static-call detection and call-site argument recovery
//! - **indicator**: The indicator contract and priority-ordered registry
//! - **indicators**: Manifest, annotation-marker and entry-point indicators
//! - **pool**: Bounded worker pool with deadline for indicator execution
//! - **engine**: Orchestration, early termination and confidence aggregation
//! - **config**: Settings resolution from file, environment and defaults

pub mod archive;
pub mod bytecode;
pub mod cache;
pub mod classfile;
pub mod cli;
pub mod config;
pub mod engine;
pub mod errors;
pub mod indicator;
pub mod indicators;
pub mod model;
pub mod pool;
pub mod scan;
pub mod scanner;

#[cfg(test)]
mod fixtures;
