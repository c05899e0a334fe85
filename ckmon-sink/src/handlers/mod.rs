// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Built-in handlers: binary-file persistence and the in-memory collector.

use crate::config::HandlerRegistry;

pub mod binary_file;
pub mod memory;

pub use binary_file::{BinaryFileConfig, BinaryFileHandler};
pub use memory::{MemoryConfig, MemoryHandler};

/// Registers the built-in handler types.
pub fn register_defaults(registry: &mut HandlerRegistry) {
    registry.register::<BinaryFileConfig>("BinaryFile", |config| {
        Ok(Box::new(BinaryFileHandler::new(config.clone())))
    });
    registry.register::<MemoryConfig>("Memory", |config| {
        Ok(Box::new(MemoryHandler::new(config.clone())))
    });
}
