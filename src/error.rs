//! Engine error taxonomy.
//!
//! Only `Device` and `Configuration` are allowed to keep a pipeline from
//! reaching the capturing state. Every other class is caught at its
//! component boundary, logged, and converted into an event; nothing
//! unwinds into the capture loop or the frame-serving path.

use std::path::PathBuf;
use std::time::Duration;

/// Result alias for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Camera or audio device unavailable. The owning pipeline degrades
    /// (or marks itself failed) instead of taking the process down.
    #[error("device unavailable: {0}")]
    Device(String),

    /// Missing gallery directory, model artifacts, or invalid settings at
    /// startup. Fatal for the affected camera instance only.
    #[error("configuration: {0}")]
    Configuration(String),

    /// A single frame failed detection or feature extraction. The frame is
    /// skipped and the recognition loop continues.
    #[error("recognition: {0}")]
    Recognition(String),

    /// Mail or HTTP transport failure. Alert state is preserved so the
    /// next eligible window can retry with accumulated data.
    #[error("dispatch: {0}")]
    Dispatch(String),

    /// Encoder pipeline failure; see [`ClipAssemblyError`].
    #[error(transparent)]
    ClipAssembly(#[from] ClipAssemblyError),
}

/// Failures from the external encoder pipeline.
#[derive(Debug, thiserror::Error)]
pub enum ClipAssemblyError {
    /// The encoder binary could not be started.
    #[error("failed to spawn encoder `{command}`: {source}")]
    Spawn {
        command: String,
        source: std::io::Error,
    },

    /// The encoder exited unsuccessfully; `stderr` carries its diagnostics.
    #[error("encoder exited with status {code:?}: {stderr}")]
    Encoder { code: Option<i32>, stderr: String },

    /// The output file size kept changing past the configured timeout.
    #[error("clip {path} did not stabilize within {timeout:?}")]
    Stabilization { path: PathBuf, timeout: Duration },

    #[error("clip i/o: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encoder_error_carries_diagnostics() {
        let err = ClipAssemblyError::Encoder {
            code: Some(1),
            stderr: "pixel format mismatch".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("1"));
        assert!(msg.contains("pixel format mismatch"));
    }

    #[test]
    fn clip_errors_convert_to_engine_errors() {
        let err: EngineError = ClipAssemblyError::Stabilization {
            path: PathBuf::from("/tmp/clip.mp4"),
            timeout: Duration::from_secs(10),
        }
        .into();
        assert!(matches!(err, EngineError::ClipAssembly(_)));
        assert!(err.to_string().contains("did not stabilize"));
    }
}
