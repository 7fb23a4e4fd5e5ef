// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

/// Error type for mapping compilation.
#[derive(Debug, Clone, thiserror::Error)]
pub enum MapError {
    /// A rule references a slot archetype no registered mapper implements.
    #[error("couldn't find referenced slot archetype mapper {archetype}, referenced in {rule}")]
    UnknownSlotArchetype { archetype: String, rule: String },

    /// A simplified flat path produced an invalid matching expression.
    #[error("invalid path pattern {pattern}: {message}")]
    InvalidPathPattern { pattern: String, message: String },
}
