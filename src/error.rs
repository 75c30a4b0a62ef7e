use thiserror::Error;

/// Errors raised while fetching the raw bytes of a source image.
#[derive(Debug, Clone, Error)]
pub enum FetchError {
    /// The locator could not be parsed
    #[error("Invalid locator '{locator}': {message}")]
    InvalidLocator { locator: String, message: String },

    /// No fetcher is registered for the locator's scheme
    #[error("Unsupported locator scheme: {0}")]
    UnsupportedScheme(String),

    /// The resource does not exist
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Error from S3 or S3-compatible storage
    #[error("S3 error: {0}")]
    S3(String),

    /// Local I/O or connection failure
    #[error("I/O error reading {locator}: {message}")]
    Io { locator: String, message: String },
}

/// Errors raised by the decode collaborator.
#[derive(Debug, Clone, Error)]
pub enum DecodeError {
    /// The bytes are not a recognizable or well-formed image
    #[error("Malformed image: {message}")]
    Malformed { message: String },

    /// An animated source decoded to zero frames
    #[error("Image decoded to zero frames")]
    NoFrames,

    /// A region decode produced no pixels
    #[error("Region {left},{top} {width}x{height} produced no pixels")]
    EmptyRegion {
        left: i64,
        top: i64,
        width: i64,
        height: i64,
    },

    /// The source has no region decoder attached
    #[error("Source is not a deep-zoom image: {key}")]
    NotDeepZoom { key: String },
}

/// Errors raised while applying a transform chain.
#[derive(Debug, Clone, Error)]
pub enum TransformError {
    /// A step in the chain failed
    #[error("Transform '{step}' failed: {message}")]
    StepFailed { step: String, message: String },

    /// A textual transform description could not be parsed
    #[error("Invalid transform spec '{spec}': {message}")]
    InvalidSpec { spec: String, message: String },

    /// The source result carries no still raster to transform
    #[error("Source {key} has no raster to transform")]
    UnsupportedSource { key: String },
}

/// Errors from the persistent cache.
///
/// None of these are fatal to a load: write failures are logged and dropped,
/// corrupt entries are removed and treated as a miss.
#[derive(Debug, Clone, Error)]
pub enum CacheError {
    /// Writing an entry failed; the edit was aborted
    #[error("Cache write failed for {key}: {message}")]
    Write { key: String, message: String },

    /// A stored entry could not be read back
    #[error("Corrupt cache entry {key}: {message}")]
    Corrupt { key: String, message: String },

    /// Another edit is already open for this key
    #[error("Cache entry {0} is being edited")]
    Busy(String),

    /// Underlying filesystem error
    #[error("Cache I/O error: {0}")]
    Io(String),
}

/// Terminal error delivered to every waiter of a failed load.
#[derive(Debug, Clone, Error)]
pub enum LoadError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Transform(#[from] TransformError),
}

impl From<std::io::Error> for CacheError {
    fn from(err: std::io::Error) -> Self {
        CacheError::Io(err.to_string())
    }
}
