use miette::Diagnostic;
use thiserror::Error;

/// Generic error type for store and handler failures.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// A `Result` typedef to use with the [`CacheError`] type
pub type Result<T> = std::result::Result<T, CacheError>;

/// Errors surfaced by the caching interceptor.
///
/// Only programming errors (a handler whose declared parameters cannot be
/// bound) and failures of the wrapped handler itself reach the caller. Store
/// and serialization problems are logged and degrade to an uncached response.
#[derive(Error, Diagnostic, Debug)]
pub enum CacheError {
    /// The call arguments did not fit the operation's parameter list.
    #[error(transparent)]
    #[diagnostic(transparent)]
    Binding(#[from] BindingError),
    /// A payload could not be encoded or decoded.
    #[error(transparent)]
    #[diagnostic(transparent)]
    Serialization(#[from] SerializationError),
    /// The wrapped handler failed.
    #[error("endpoint handler failed: {0}")]
    #[diagnostic(code(response_cache::handler))]
    Handler(#[source] BoxError),
    /// The store backend failed.
    #[error("cache store failed: {0}")]
    #[diagnostic(code(response_cache::store))]
    Store(#[source] BoxError),
    /// A header value could not be constructed.
    #[error(transparent)]
    #[diagnostic(code(response_cache::invalid_header_value))]
    InvalidHeaderValue(#[from] http::header::InvalidHeaderValue),
    /// A response could not be assembled.
    #[error(transparent)]
    #[diagnostic(code(response_cache::http))]
    Http(#[from] http::Error),
}

/// Failure to bind call arguments against an [`Operation`](crate::Operation).
#[derive(Error, Diagnostic, Debug, Clone, PartialEq, Eq)]
pub enum BindingError {
    /// More positional values than declared parameters.
    #[error("{operation} takes {expected} positional arguments but {given} were given")]
    #[diagnostic(code(response_cache::binding::too_many_positional))]
    TooManyPositional {
        /// Operation name
        operation: String,
        /// Number of declared parameters
        expected: usize,
        /// Number of positional values supplied
        given: usize,
    },
    /// A named value for a parameter the operation does not declare.
    #[error("{operation} got an unexpected argument `{name}`")]
    #[diagnostic(code(response_cache::binding::unknown_argument))]
    UnknownArgument {
        /// Operation name
        operation: String,
        /// Offending argument name
        name: String,
    },
    /// A parameter bound twice, positionally and by name or by name twice.
    #[error("{operation} got multiple values for argument `{name}`")]
    #[diagnostic(code(response_cache::binding::duplicate_argument))]
    DuplicateArgument {
        /// Operation name
        operation: String,
        /// Offending argument name
        name: String,
    },
    /// A parameter without default received no value.
    #[error("{operation} is missing required argument `{name}`")]
    #[diagnostic(code(response_cache::binding::missing_argument))]
    MissingArgument {
        /// Operation name
        operation: String,
        /// Missing argument name
        name: String,
    },
}

/// Failure to move a payload across the codec boundary.
#[derive(Error, Diagnostic, Debug)]
pub enum SerializationError {
    /// The value has no representation in the codec.
    #[error("value of type `{type_name}` is not serializable")]
    #[diagnostic(code(response_cache::codec::unsupported))]
    Unsupported {
        /// Rust type name of the offending value
        type_name: String,
    },
    /// NaN and infinities have no JSON form.
    #[error("non-finite number {0} is not serializable")]
    #[diagnostic(code(response_cache::codec::non_finite))]
    NonFiniteNumber(f64),
    /// An ordinary object used the key reserved for extension wrappers.
    #[error("object key `{0}` is reserved for extension values")]
    #[diagnostic(code(response_cache::codec::reserved_key))]
    ReservedKey(&'static str),
    /// A wrapped value carried a tag outside the extension registry.
    #[error("\"{val}\" (type: {tag}) is not a known extension value")]
    #[diagnostic(code(response_cache::codec::unknown_extension))]
    UnknownExtension {
        /// The unrecognised tag
        tag: String,
        /// The wrapped canonical string
        val: String,
    },
    /// A wrapped value whose shape or canonical string is invalid.
    #[error("malformed `{tag}` extension value: {reason}")]
    #[diagnostic(code(response_cache::codec::malformed_extension))]
    MalformedExtension {
        /// The extension tag
        tag: String,
        /// What was wrong with it
        reason: String,
    },
    /// The payload is not valid JSON.
    #[error(transparent)]
    #[diagnostic(code(response_cache::codec::json))]
    Json(#[from] serde_json::Error),
}
