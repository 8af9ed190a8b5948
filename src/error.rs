use thiserror::Error;

/// Aggregates every failure mode exposed by the Skailar client.
///
/// Proxy reachability problems never show up here: an unreachable proxy degrades to a
/// direct connection instead of failing the call.
#[derive(Debug, Error)]
pub enum SkailarError {
    /// Raised when caller-supplied configuration is invalid (proxy, base URL, API key).
    #[error("invalid configuration for {field}: {reason}")]
    Configuration {
        /// Name of the configuration field that failed validation.
        field: String,
        /// Additional context explaining why the field is invalid.
        reason: String,
    },
    /// Represents transport-layer or networking failures, including mid-stream errors.
    #[error("transport error: {message}")]
    Transport { message: String },
    /// The API answered with a non-success status.
    #[error("upstream returned status {status}: {body}")]
    Upstream {
        status: u16,
        /// Raw response body, kept verbatim.
        body: String,
    },
    /// The requested model does not belong to the family served by the called operation.
    #[error("model {model} is not valid here: {expected}")]
    ModelMismatch {
        model: String,
        /// Hint naming the operation that should be used instead.
        expected: &'static str,
    },
    /// Signals that the request payload could not be serialized.
    #[error("invalid request: {message}")]
    Validation { message: String },
    /// A successful response whose body could not be decoded.
    #[error("failed to decode response: {message}")]
    Decode { message: String },
}

impl SkailarError {
    /// Creates a [`SkailarError::Transport`] from a textual description.
    ///
    /// # Examples
    ///
    /// ```
    /// use skailar::error::SkailarError;
    ///
    /// let err = SkailarError::transport("dns lookup failed");
    /// assert!(matches!(err, SkailarError::Transport { .. }));
    /// ```
    pub fn transport<T: Into<String>>(message: T) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    /// Creates a [`SkailarError::Configuration`] for the named field.
    ///
    /// # Examples
    ///
    /// ```
    /// use skailar::error::SkailarError;
    ///
    /// let err = SkailarError::configuration("proxy.port", "must be within 1..=65535");
    /// assert_eq!(
    ///     err.to_string(),
    ///     "invalid configuration for proxy.port: must be within 1..=65535"
    /// );
    /// ```
    pub fn configuration<F: Into<String>, R: Into<String>>(field: F, reason: R) -> Self {
        Self::Configuration {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Returns `true` for errors raised before any network activity took place.
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            Self::Configuration { .. } | Self::ModelMismatch { .. } | Self::Validation { .. }
        )
    }
}
