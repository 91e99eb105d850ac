//! The process-wide active logger.
//!
//! [`PipelineConfiguration::assemble`](crate::PipelineConfiguration::assemble) publishes the
//! logger it builds here. Readers always observe either the previous logger or the new one,
//! never a partially built engine.

use std::sync::{Arc, PoisonError, RwLock};

use crate::logger::Logger;

static ACTIVE: RwLock<Option<Arc<Logger>>> = RwLock::new(None);

/// The active logger, if one has been published.
pub fn current() -> Option<Arc<Logger>> {
    ACTIVE
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .clone()
}

/// Makes `logger` the active logger, returning the logger it replaces.
///
/// The replaced logger keeps working for whoever still holds it, and is flushed once its last
/// holder drops it.
pub fn publish(logger: Arc<Logger>) -> Option<Arc<Logger>> {
    ACTIVE
        .write()
        .unwrap_or_else(PoisonError::into_inner)
        .replace(logger)
}

/// Serializes the tests that publish loggers.
#[cfg(test)]
pub(crate) static TEST_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());
