//! Weaver configuration.

/// Configuration of a [`crate::weaver::Weaver`].
///
/// # Examples
///
/// ```rust
/// use dotweave::weaver::WeaverConfig;
///
/// let config = WeaverConfig::default()
///     .with_parallel(false)
///     .with_warnings_as_errors(true);
/// assert!(!config.parallel);
/// assert_eq!(config.backing_field_name("Count"), "<Count>k__BackingField");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WeaverConfig {
    /// Weave independent methods on the rayon thread pool
    pub parallel: bool,
    /// Namespace and name of the type caught by untyped exception advices
    pub root_exception_type: (String, String),
    /// Treat warning diagnostics as failures in [`crate::weaver::WeaveOutcome::success`]
    pub warnings_as_errors: bool,
    /// Verify tree structure and stack depth of every woven body
    pub verify_bodies: bool,
    /// Name of a promoted field's backing field; `{}` stands for the field name
    pub backing_field_format: String,
}

impl Default for WeaverConfig {
    fn default() -> Self {
        WeaverConfig {
            parallel: true,
            root_exception_type: ("System".to_string(), "Exception".to_string()),
            warnings_as_errors: false,
            verify_bodies: true,
            backing_field_format: "<{}>k__BackingField".to_string(),
        }
    }
}

impl WeaverConfig {
    /// Enables or disables parallel weaving
    #[must_use]
    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    /// Sets the root exception type
    #[must_use]
    pub fn with_root_exception_type(mut self, namespace: &str, name: &str) -> Self {
        self.root_exception_type = (namespace.to_string(), name.to_string());
        self
    }

    /// Promotes warnings to failures
    #[must_use]
    pub fn with_warnings_as_errors(mut self, enabled: bool) -> Self {
        self.warnings_as_errors = enabled;
        self
    }

    /// Enables or disables post-weave verification
    #[must_use]
    pub fn with_verify_bodies(mut self, enabled: bool) -> Self {
        self.verify_bodies = enabled;
        self
    }

    /// Sets the backing field name format
    #[must_use]
    pub fn with_backing_field_format(mut self, format: &str) -> Self {
        self.backing_field_format = format.to_string();
        self
    }

    /// Backing field name for a promoted field
    #[must_use]
    pub fn backing_field_name(&self, field: &str) -> String {
        self.backing_field_format.replace("{}", field)
    }
}
