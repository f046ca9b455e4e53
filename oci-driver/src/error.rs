use std::backtrace::Backtrace;
use std::error::Error as StdError;
use std::fmt;

use tracing_error::SpanTrace;

/// Categorizes store errors by their semantic meaning, independent of
/// the backend that produced them.
///
/// Callers branch on the kind, never on the error message: a
/// [`StoreErrorKind::NotFound`] means "try another backend or a peer",
/// while [`StoreErrorKind::MalformedContent`] and
/// [`StoreErrorKind::UnresolvablePlatform`] mean the content itself is
/// unusable here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreErrorKind {
    /// The requested digest, tag, descriptor or blob is not held by this backend.
    ///
    /// **Retryable:** No - but another backend or peer may have it.
    /// **Caller action:** Resolve the key against peers.
    NotFound,

    /// An image index has no entries matching the platform policy with local content.
    ///
    /// **Retryable:** No - this is expected for multi-arch images on other platforms.
    /// **Caller action:** Skip the image; do not report it as a fault.
    UnresolvablePlatform,

    /// Stored bytes failed to parse, or their media type could not be determined.
    ///
    /// **Retryable:** No - the content is corrupt or unsupported.
    /// **Caller action:** Treat the digest as unusable.
    MalformedContent,

    /// The backend could not be reached, or an I/O operation against it failed.
    ///
    /// **Retryable:** Yes - with backoff owned by the caller.
    /// **Caller action:** Retry later or fall back to another backend.
    BackendUnavailable,

    /// The operation was cancelled by the caller before it completed.
    ///
    /// **Retryable:** No - the caller asked for it to stop.
    Cancelled,

    /// The request itself was invalid (missing digest, digest mismatch on write).
    ///
    /// **Retryable:** No - fix the request.
    InvalidRequest,
}

impl StoreErrorKind {
    /// Returns whether this error kind typically indicates a retryable condition.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreErrorKind::BackendUnavailable)
    }

    /// Returns whether this error says something about the content itself,
    /// rather than about its availability.
    pub fn is_content_fault(&self) -> bool {
        matches!(
            self,
            StoreErrorKind::MalformedContent | StoreErrorKind::UnresolvablePlatform
        )
    }
}

impl fmt::Display for StoreErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreErrorKind::NotFound => write!(f, "not found"),
            StoreErrorKind::UnresolvablePlatform => write!(f, "unresolvable platform"),
            StoreErrorKind::MalformedContent => write!(f, "malformed content"),
            StoreErrorKind::BackendUnavailable => write!(f, "backend unavailable"),
            StoreErrorKind::Cancelled => write!(f, "cancelled"),
            StoreErrorKind::InvalidRequest => write!(f, "invalid request"),
        }
    }
}

#[derive(Debug)]
struct ErrorTrace {
    /// Controlled by `RUST_BACKTRACE`.
    backtrace: Backtrace,

    /// The span context at the point where the error was created.
    span_trace: SpanTrace,
}

impl ErrorTrace {
    #[track_caller]
    fn capture() -> Self {
        ErrorTrace {
            backtrace: Backtrace::capture(),
            span_trace: SpanTrace::capture(),
        }
    }
}

/// Error returned by every store operation.
///
/// This error type provides:
/// - **Semantic categorization** via [`StoreErrorKind`]
/// - **Operation context** (engine, digest, reference)
/// - **Error chain preservation** via `Box<dyn Error + Send + Sync>`
/// - **Backtrace and spantrace capture** for debugging
///
/// # Example
///
/// ```rust
/// use oci_driver::{StoreError, StoreErrorKind};
///
/// let error = StoreError::builder(
///     "memory",
///     StoreErrorKind::NotFound,
///     "blob not found",
/// )
/// .digest("sha256:2c26b46b68ffc68ff99b453c1d30413413422d706483bfa0f98a5e886266e7ae")
/// .build();
///
/// assert!(error.is_not_found());
/// ```
#[derive(Debug)]
pub struct StoreError {
    kind: StoreErrorKind,

    /// The name of the backend that produced this error.
    engine: &'static str,

    digest: Option<String>,

    /// The image reference or tag name, if applicable.
    reference: Option<String>,

    context: Option<String>,

    source: Box<dyn StdError + Send + Sync + 'static>,

    traces: Box<ErrorTrace>,
}

impl StdError for StoreError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        Some(self.source.as_ref())
    }
}

impl StoreError {
    /// Create a new store error with the minimum required information.
    ///
    /// For more control, use [`StoreError::builder`].
    #[track_caller]
    pub fn new<E>(engine: &'static str, kind: StoreErrorKind, error: E) -> Self
    where
        E: Into<Box<dyn StdError + Send + Sync + 'static>>,
    {
        Self {
            kind,
            engine,
            digest: None,
            reference: None,
            context: None,
            source: error.into(),
            traces: Box::new(ErrorTrace::capture()),
        }
    }

    /// Create a builder for constructing a store error with full context.
    pub fn builder<E>(engine: &'static str, kind: StoreErrorKind, error: E) -> StoreErrorBuilder
    where
        E: Into<Box<dyn StdError + Send + Sync + 'static>>,
    {
        StoreErrorBuilder {
            engine,
            kind,
            source: error.into(),
            digest: None,
            reference: None,
            context: None,
        }
    }

    /// Returns a boxed closure that creates a store error from a downstream error.
    ///
    /// ```rust
    /// use oci_driver::{StoreError, StoreErrorKind};
    ///
    /// fn operation() -> Result<(), StoreError> {
    ///     std::fs::File::open("index.json")
    ///         .map_err(StoreError::with("local", StoreErrorKind::BackendUnavailable))?;
    ///     Ok(())
    /// }
    /// ```
    pub fn with<E>(
        engine: &'static str,
        kind: StoreErrorKind,
    ) -> Box<dyn FnOnce(E) -> StoreError + Send + Sync>
    where
        E: Into<Box<dyn StdError + Send + Sync + 'static>>,
    {
        Box::new(move |error: E| StoreError::new(engine, kind, error))
    }

    /// Shorthand for a [`StoreErrorKind::NotFound`] error about a digest.
    pub fn not_found(engine: &'static str, digest: impl fmt::Display, what: &str) -> Self {
        let digest = digest.to_string();
        Self::builder(
            engine,
            StoreErrorKind::NotFound,
            format!("{what} with digest {digest} not found"),
        )
        .digest(digest)
        .build()
    }

    /// Shorthand for a [`StoreErrorKind::Cancelled`] error.
    pub fn cancelled(engine: &'static str) -> Self {
        Self::new(engine, StoreErrorKind::Cancelled, "operation cancelled")
    }

    /// Attach (or replace) the context describing the failed operation,
    /// keeping the kind and the source intact.
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    /// Returns the error kind.
    pub fn kind(&self) -> StoreErrorKind {
        self.kind
    }

    /// Returns whether this is the shared not-found condition.
    pub fn is_not_found(&self) -> bool {
        self.kind == StoreErrorKind::NotFound
    }

    /// Returns the backend name.
    pub fn engine(&self) -> &'static str {
        self.engine
    }

    /// Returns the offending digest, if available.
    pub fn digest(&self) -> Option<&str> {
        self.digest.as_deref()
    }

    /// Returns the offending reference or tag name, if available.
    pub fn reference(&self) -> Option<&str> {
        self.reference.as_deref()
    }

    /// Returns additional context, if available.
    pub fn context(&self) -> Option<&str> {
        self.context.as_deref()
    }

    /// Returns whether this error is likely retryable.
    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }

    /// Returns a reference to the captured backtrace.
    pub fn backtrace(&self) -> &Backtrace {
        &self.traces.backtrace
    }

    /// Returns a reference to the captured span trace.
    pub fn span_trace(&self) -> &SpanTrace {
        &self.traces.span_trace
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Store error [{}] from {}", self.kind, self.engine)?;

        if let Some(reference) = &self.reference {
            write!(f, " (reference: {})", reference)?;
        }

        if let Some(digest) = &self.digest {
            write!(f, " (digest: {})", digest)?;
        }

        if let Some(context) = &self.context {
            write!(f, ": {}", context)?;
        }

        write!(f, ": {}", self.source)
    }
}

/// Builder for constructing [`StoreError`] with optional context fields.
#[derive(Debug)]
pub struct StoreErrorBuilder {
    kind: StoreErrorKind,
    engine: &'static str,
    source: Box<dyn StdError + Send + Sync + 'static>,
    digest: Option<String>,
    reference: Option<String>,
    context: Option<String>,
}

impl StoreErrorBuilder {
    /// Set the digest the operation was about.
    pub fn digest(mut self, digest: impl fmt::Display) -> Self {
        self.digest = Some(digest.to_string());
        self
    }

    /// Set the image reference or tag name the operation was about.
    pub fn reference(mut self, reference: impl Into<String>) -> Self {
        self.reference = Some(reference.into());
        self
    }

    /// Set additional context.
    pub fn context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    /// Build the [`StoreError`].
    #[track_caller]
    pub fn build(self) -> StoreError {
        StoreError {
            kind: self.kind,
            engine: self.engine,
            digest: self.digest,
            reference: self.reference,
            context: self.context,
            source: self.source,
            traces: Box::new(ErrorTrace::capture()),
        }
    }
}
