// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The mapping engine facade. Compiles every model mapper registered for
//! the entity kinds present in a source bundle, joins the resulting helper
//! trees and executes them against the bundle, producing a flat record.

use crate::compile::{CompiledMapper, Compiler, Helper, MapperRegistry};
use crate::flat::FlatRecord;
use crate::interpreter::{ConversionHook, Interpreter, PathEvaluator};
use crate::value::{Node, Value};

use anyhow::Result;
use log::debug;

/// The mapping engine.
///
/// The engine itself holds no state beyond its collaborators: the registry
/// resolving mapping configuration, the evaluator resolving source paths
/// and an optional hook for externally registered conversions.
pub struct Engine<'a> {
    registry: &'a dyn MapperRegistry,
    evaluator: &'a dyn PathEvaluator,
    conversion: Option<&'a dyn ConversionHook>,
}

impl<'a> Engine<'a> {
    pub fn new(registry: &'a dyn MapperRegistry, evaluator: &'a dyn PathEvaluator) -> Engine<'a> {
        Engine {
            registry,
            evaluator,
            conversion: None,
        }
    }

    pub fn with_conversion_hook(mut self, hook: &'a dyn ConversionHook) -> Engine<'a> {
        self.conversion = Some(hook);
        self
    }

    /// Maps a source bundle onto the template's flat record.
    ///
    /// Mapping always runs over a bundle; a bare instance is wrapped into
    /// a single-entry bundle first so limiting criteria evaluate the same
    /// way in both cases.
    pub fn map(&self, template_id: &str, source: &Value) -> Result<FlatRecord> {
        let wrapped;
        let bundle = if source.kind() == Some("Bundle") {
            source
        } else {
            wrapped = wrap_in_bundle(source);
            &wrapped
        };

        let helpers = self.compile_helpers(template_id, bundle)?;
        let mut flat = FlatRecord::new();
        if helpers.is_empty() {
            debug!("No model mappers matched any entry of the source bundle");
            return Ok(flat);
        }

        let interpreter = match self.conversion {
            Some(hook) => Interpreter::new(self.evaluator).with_conversion_hook(hook),
            None => Interpreter::new(self.evaluator),
        };
        interpreter.resolve_fhir_paths(&helpers, bundle, &mut flat)?;
        Ok(flat)
    }

    /// Compiles the mappers for every distinct entity kind in the bundle.
    /// Cover helpers are appended after the primary ones so indirectly
    /// referenced entities are mapped once the main content is in place.
    fn compile_helpers(&self, template_id: &str, bundle: &Value) -> Result<Vec<Helper>> {
        let compiler = Compiler::new(self.registry, template_id);
        let mut helpers: Vec<Helper> = vec![];
        let mut cover_helpers: Vec<Helper> = vec![];

        for kind in entry_kinds(bundle) {
            let mappers = self.registry.mappers_for_kind(&kind);
            if mappers.is_empty() {
                debug!("No model mappers registered for entity kind {kind}");
                continue;
            }
            for mapper in &mappers {
                let CompiledMapper {
                    helpers: mut compiled,
                    cover_helpers: mut cover,
                } = compiler.compile(mapper)?;
                helpers.append(&mut compiled);
                cover_helpers.append(&mut cover);
            }
        }

        helpers.append(&mut cover_helpers);
        for helper in helpers.iter_mut() {
            helper.unescape_dots();
        }
        Ok(helpers)
    }
}

/// The distinct entity kinds of the bundle's entries, in entry order.
/// Compiling per distinct kind keeps a bundle with several instances of
/// the same kind from producing duplicate helpers.
fn entry_kinds(bundle: &Value) -> Vec<String> {
    let Value::Node(node) = bundle else {
        return vec![];
    };
    let mut kinds: Vec<String> = vec![];
    for entry in node.children("entry") {
        let Value::Node(entry) = entry else {
            continue;
        };
        let Some(kind) = entry.first_child("resource").and_then(Value::kind) else {
            continue;
        };
        if !kinds.iter().any(|k| k == kind) {
            kinds.push(kind.to_string());
        }
    }
    kinds
}

fn wrap_in_bundle(instance: &Value) -> Value {
    let mut entry = Node::new("BundleEntry");
    entry.set("resource", instance.clone());
    let mut bundle = Node::new("Bundle");
    bundle.set("entry", Value::node(entry));
    Value::node(bundle)
}
