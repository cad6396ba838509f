//! Configuration objects.
use std::path::PathBuf;

use serde::Deserialize;
use serde::Serialize;

use crate::error::Result;

/// What to do with a chain error that nothing in the chain observed.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum UnhandledErrorPolicy {
    /// Panic, the way an unhandled error event crashes a process.
    #[default]
    Panic,
    /// Log the error at `error` level and carry on.
    Log,
}

/// Process-wide settings shared by every node created from a
/// [Context](crate::context::Context).
///
/// # JSON Format
///
/// Every field is optional:
///
/// - `byte-high-water-mark`: Buffered bytes at which a byte-mode side
///   signals backpressure.  The default is `16384`.
///
/// - `object-high-water-mark`: Buffered items at which an object-mode
///   side signals backpressure.  The default is `16`.
///
/// - `tick-budget`: Number of queued callbacks run before yielding
///   back to the runtime.  The default is `1024`.
///
/// - `foreign-read-size`: Read size used when pulling from foreign
///   readers.  The default is `16384`.
///
/// - `unhandled-error`: Either `panic` or `log`.  The default is `panic`.
///
/// - `file-buffer`: Defaults for [FileBufferOptions].
///
/// ## Examples
///
/// ```json
/// {
///   "byte-high-water-mark": 65536,
///   "unhandled-error": "log",
///   "file-buffer": { "remove-file": false }
/// }
/// ```
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
#[serde(default)]
pub struct ContextConfig {
    pub byte_high_water_mark: usize,
    pub object_high_water_mark: usize,
    pub tick_budget: usize,
    pub foreign_read_size: usize,
    pub unhandled_error: UnhandledErrorPolicy,
    pub file_buffer: FileBufferOptions,
}

impl ContextConfig {
    /// Parse a configuration from JSON text
    pub fn from_json_str(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Set the unhandled-error policy
    pub fn with_unhandled_error(mut self, policy: UnhandledErrorPolicy) -> Self {
        self.unhandled_error = policy;
        self
    }

    /// Set both high-water marks
    pub fn with_high_water_marks(mut self, bytes: usize, objects: usize) -> Self {
        self.byte_high_water_mark = bytes.max(1);
        self.object_high_water_mark = objects.max(1);
        self
    }

    /// Default high-water mark for a side in the given mode
    pub fn high_water_mark(&self, object_mode: bool) -> usize {
        if object_mode {
            self.object_high_water_mark
        } else {
            self.byte_high_water_mark
        }
    }
}

impl Default for ContextConfig {
    fn default() -> Self {
        ContextConfig {
            byte_high_water_mark: 16 * 1024,
            object_high_water_mark: 16,
            tick_budget: 1024,
            foreign_read_size: 16 * 1024,
            unhandled_error: UnhandledErrorPolicy::default(),
            file_buffer: FileBufferOptions::default(),
        }
    }
}

/// Options for a [FileBufferStream](crate::file_buffer::FileBufferStream).
///
/// # JSON Format
///
/// - `path`: Backing file path.  When absent a random name under
///   `directory` is generated.
///
/// - `directory`: Directory for generated names.  Defaults to the
///   system temporary directory.
///
/// - `remove-file`: Whether to unlink the backing file once the
///   stream is done.  The default is `true`.
///
/// - `read-buffer-size`: Largest single read from the backing file.
///   The default is `16384`.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
#[serde(default)]
pub struct FileBufferOptions {
    pub path: Option<PathBuf>,
    pub directory: Option<PathBuf>,
    pub remove_file: bool,
    pub read_buffer_size: usize,
}

impl FileBufferOptions {
    /// Buffer to an explicit path
    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Generate random backing file names inside `dir`
    pub fn with_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.directory = Some(dir.into());
        self
    }

    /// Keep or remove the backing file once done
    pub fn with_remove_file(mut self, remove: bool) -> Self {
        self.remove_file = remove;
        self
    }

    /// Largest single read from the backing file
    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size.max(1);
        self
    }

    /// The backing file path, generating a random one if unset
    pub fn resolve_path(&self) -> PathBuf {
        match &self.path {
            Some(path) => path.clone(),
            None => {
                let dir = self.directory.clone().unwrap_or_else(std::env::temp_dir);
                dir.join(format!("stream-chain-{}", uuid::Uuid::new_v4().simple()))
            }
        }
    }
}

impl Default for FileBufferOptions {
    fn default() -> Self {
        FileBufferOptions {
            path: None,
            directory: None,
            remove_file: true,
            read_buffer_size: 16 * 1024,
        }
    }
}

/// Per-node options.
///
/// `object_mode` sets both sides; the side-specific flags override it.
/// When both sides end up in object mode the node is in unified object
/// mode.
#[derive(Clone, Debug, Default)]
pub struct StreamOptions {
    pub name: Option<String>,
    pub object_mode: bool,
    pub readable_object_mode: Option<bool>,
    pub writable_object_mode: Option<bool>,
    pub readable_high_water_mark: Option<usize>,
    pub writable_high_water_mark: Option<usize>,
}

impl StreamOptions {
    /// Create default (byte mode) options
    pub fn new() -> Self {
        Self::default()
    }

    /// Shorthand for unified object mode
    pub fn object() -> Self {
        Self::default().with_object_mode(true)
    }

    /// Name shown in logs and metrics
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set both sides' object mode
    pub fn with_object_mode(mut self, object_mode: bool) -> Self {
        self.object_mode = object_mode;
        self
    }

    /// Override the readable side's mode
    pub fn with_readable_object_mode(mut self, object_mode: bool) -> Self {
        self.readable_object_mode = Some(object_mode);
        self
    }

    /// Override the writable side's mode
    pub fn with_writable_object_mode(mut self, object_mode: bool) -> Self {
        self.writable_object_mode = Some(object_mode);
        self
    }

    /// Set the high-water mark for both sides
    pub fn with_high_water_mark(mut self, limit: usize) -> Self {
        self.readable_high_water_mark = Some(limit.max(1));
        self.writable_high_water_mark = Some(limit.max(1));
        self
    }

    /// Resolved readable-side object mode
    pub fn readable_mode(&self) -> bool {
        self.readable_object_mode.unwrap_or(self.object_mode)
    }

    /// Resolved writable-side object mode
    pub fn writable_mode(&self) -> bool {
        self.writable_object_mode.unwrap_or(self.object_mode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults_from_empty_json() {
        let config = ContextConfig::from_json_str("{}").expect("Parse failed");
        assert_eq!(config, ContextConfig::default());
        assert_eq!(config.high_water_mark(true), 16);
        assert_eq!(config.high_water_mark(false), 16 * 1024);
    }

    #[test]
    fn test_config_kebab_case_fields() {
        let config = ContextConfig::from_json_str(
            r#"{ "unhandled-error": "log", "file-buffer": { "remove-file": false } }"#,
        )
        .expect("Parse failed");
        assert_eq!(config.unhandled_error, UnhandledErrorPolicy::Log);
        assert!(!config.file_buffer.remove_file);
        assert_eq!(config.file_buffer.read_buffer_size, 16 * 1024);
    }

    #[test]
    fn test_stream_options_side_overrides() {
        let opts = StreamOptions::object().with_writable_object_mode(false);
        assert!(opts.readable_mode());
        assert!(!opts.writable_mode());
    }

    #[test]
    fn test_generated_paths_are_unique() {
        let opts = FileBufferOptions::default().with_directory("/var/tmp");
        let a = opts.resolve_path();
        let b = opts.resolve_path();
        assert_ne!(a, b);
        assert!(a.starts_with("/var/tmp"));
    }
}
