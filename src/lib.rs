// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

// Use README.md as crate documentation.
#![doc = include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/README.md"))]

mod compile;
mod engine;
mod error;
mod flat;
mod interpreter;
pub mod mapping;
mod normalize;
pub mod paths;
mod populate;
mod value;

pub use compile::{CompiledMapper, Compiler, Helper, MapperRegistry};
pub use engine::Engine;
pub use error::MapError;
pub use flat::{FlatRecord, FlatValue};
pub use interpreter::{ConversionHook, Interpreter, PathEvaluator};
pub use mapping::{ModelMapper, TargetType};
pub use value::{
    Attachment, Coding, Concept, Extension, Identifier, Node, Quantity, Ratio, Reference, Value,
};

#[cfg(test)]
mod tests;
