// Copyright 2025 The Drasi Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Severity routing for connection driver diagnostics.
//!
//! The driver reports at four levels (error, critical, warning, debug). Each
//! level is bound to a [`DiagnosticSink`] when the client is built: error and
//! critical go to the client logger's error channel, warning to its info
//! channel, and debug to its info channel only in debug mode. Without a
//! client logger every level is silent.

use std::fmt;
use std::sync::Arc;

use crate::logging::StructuredLogger;

/// Two-method sink for driver diagnostics.
pub trait DiagnosticSink: Send + Sync {
    fn println(&self, message: &str);
    fn printf(&self, args: fmt::Arguments<'_>);
}

/// Forwards diagnostics to the error channel of a structured logger.
pub struct ErrorAdapter {
    logger: Arc<dyn StructuredLogger>,
}

impl ErrorAdapter {
    pub fn new(logger: Arc<dyn StructuredLogger>) -> Self {
        Self { logger }
    }
}

impl DiagnosticSink for ErrorAdapter {
    fn println(&self, message: &str) {
        self.logger.error(message, &[]);
    }

    fn printf(&self, args: fmt::Arguments<'_>) {
        self.logger.error(&args.to_string(), &[]);
    }
}

/// Forwards diagnostics to the info channel of a structured logger.
pub struct InfoAdapter {
    logger: Arc<dyn StructuredLogger>,
}

impl InfoAdapter {
    pub fn new(logger: Arc<dyn StructuredLogger>) -> Self {
        Self { logger }
    }
}

impl DiagnosticSink for InfoAdapter {
    fn println(&self, message: &str) {
        self.logger.info(message, &[]);
    }

    fn printf(&self, args: fmt::Arguments<'_>) {
        self.logger.info(&args.to_string(), &[]);
    }
}

struct Silent;

impl DiagnosticSink for Silent {
    fn println(&self, _message: &str) {}

    fn printf(&self, _args: fmt::Arguments<'_>) {}
}

/// Per-client binding of diagnostic levels to sinks.
#[derive(Clone)]
pub struct Diagnostics {
    pub error: Arc<dyn DiagnosticSink>,
    pub critical: Arc<dyn DiagnosticSink>,
    pub warn: Arc<dyn DiagnosticSink>,
    pub debug: Arc<dyn DiagnosticSink>,
    debug_enabled: bool,
}

impl Diagnostics {
    pub fn new(client_logger: Option<Arc<dyn StructuredLogger>>, debug: bool) -> Self {
        let silent: Arc<dyn DiagnosticSink> = Arc::new(Silent);
        match client_logger {
            Some(logger) => {
                let error: Arc<dyn DiagnosticSink> = Arc::new(ErrorAdapter::new(logger.clone()));
                let info: Arc<dyn DiagnosticSink> = Arc::new(InfoAdapter::new(logger));
                Self {
                    critical: error.clone(),
                    error,
                    debug: if debug { info.clone() } else { silent },
                    warn: info,
                    debug_enabled: debug,
                }
            }
            None => Self {
                error: silent.clone(),
                critical: silent.clone(),
                warn: silent.clone(),
                debug: silent,
                debug_enabled: false,
            },
        }
    }

    /// Whether debug diagnostics reach a logger. Lets callers skip
    /// formatting per-event output that would be dropped.
    pub fn debug_enabled(&self) -> bool {
        self.debug_enabled
    }
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self::new(None, false)
    }
}
