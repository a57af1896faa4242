use thiserror::Error;

use crate::engine::persistence::PersistenceError;
use crate::engine::registry::RegistryError;
use crate::engine::sandbox::SandboxError;
use crate::engine::strategy::CompileError;
use crate::engine::stream::StreamError;
use crate::engine::types::InvalidInterval;

/// The crate's top-level error type. Each component defines its own
/// focused error enum close to where it's raised; this composes them for
/// the composition root's `Result` signatures.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("persistence: {0}")]
    Persistence(#[from] PersistenceError),

    #[error("trader registry: {0}")]
    Registry(#[from] RegistryError),

    #[error("sandbox: {0}")]
    Sandbox(#[from] SandboxError),

    #[error("strategy compilation: {0}")]
    Compile(#[from] CompileError),

    #[error("stream client: {0}")]
    Stream(#[from] StreamError),

    #[error("invalid interval: {0}")]
    Interval(#[from] InvalidInterval),

    #[error("configuration error: {0}")]
    Config(String),
}

pub type EngineResult<T> = Result<T, EngineError>;

/// Attaches a human-readable operation description to an error while it's
/// still in scope, logging it at the point of failure rather than letting
/// it surface bare at the composition root.
pub trait ErrorContext<T> {
    fn context(self, msg: &str) -> EngineResult<T>;
    fn with_context<F>(self, f: F) -> EngineResult<T>
    where
        F: FnOnce() -> String;
}

impl<T, E> ErrorContext<T> for Result<T, E>
where
    E: Into<EngineError>,
{
    fn context(self, msg: &str) -> EngineResult<T> {
        self.map_err(|e| {
            let engine_error: EngineError = e.into();
            tracing::error!("{}: {:?}", msg, engine_error);
            engine_error
        })
    }

    fn with_context<F>(self, f: F) -> EngineResult<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| {
            let engine_error: EngineError = e.into();
            let context = f();
            tracing::error!("{}: {:?}", context, engine_error);
            engine_error
        })
    }
}

pub fn setup_panic_handler() {
    std::panic::set_hook(Box::new(|panic_info| {
        let msg = match panic_info.payload().downcast_ref::<&str>() {
            Some(s) => *s,
            None => match panic_info.payload().downcast_ref::<String>() {
                Some(s) => &s[..],
                None => "Unknown panic",
            },
        };

        let location = if let Some(location) = panic_info.location() {
            format!("{}:{}:{}", location.file(), location.line(), location.column())
        } else {
            "Unknown location".to_string()
        };

        tracing::error!(target: "panic", "Panic occurred: {} at {}", msg, location);
    }));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_wraps_and_preserves_source_error() {
        let result: Result<(), PersistenceError> = Err(PersistenceError::NotFound("t1".to_string()));
        let wrapped = result.context("loading trader");
        assert!(matches!(wrapped, Err(EngineError::Persistence(_))));
    }
}
