//! Image transforms.
//!
//! A [`TransformChain`] is an ordered list of pure [`Transform`] steps. Each
//! step has a stable identifier; the chain's [`signature`](TransformChain::signature)
//! joins them in order and becomes part of the request key, so two different
//! chains never share a cache entry.
//!
//! # Components
//!
//! - [`Transform`]: a single pure step over a decoded image
//! - [`TransformChain`]: ordered steps plus their signature
//! - [`builtin`]: resize, crop, grayscale, rotate, blur, flip and the
//!   `name:args` parser used by the CLI
//! - [`TransformPipeline`]: runs a chain on a source result and writes the
//!   output through to the disk cache

mod builtin;
mod pipeline;

use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;

use image::DynamicImage;

use crate::error::TransformError;

pub use builtin::{parse_transform, Blur, CenterCrop, Flip, FlipAxis, Grayscale, Resize, Rotate};
pub use pipeline::TransformPipeline;

/// Separator between step identifiers in a chain signature.
const SIGNATURE_SEPARATOR: char = ',';

/// A pure, deterministic function over a decoded image.
///
/// Implementations must not depend on hidden state: the same input always
/// yields the same output.
pub trait Transform: Send + Sync {
    /// Stable identifier, including any parameters.
    fn key(&self) -> String;

    /// Apply the step, consuming the input image.
    fn transform(&self, image: DynamicImage) -> Result<DynamicImage, TransformError>;
}

/// Ordered sequence of transforms.
///
/// # Example
///
/// ```ignore
/// use bitmap_pipeline::transform::{Grayscale, Resize, TransformChain};
///
/// let chain = TransformChain::new().then(Resize::new(256, 256)).then(Grayscale);
/// assert_eq!(chain.signature(), "resize(256x256),grayscale");
/// ```
#[derive(Clone, Default)]
pub struct TransformChain {
    steps: Vec<Arc<dyn Transform>>,
}

impl TransformChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a step.
    pub fn then<T: Transform + 'static>(self, step: T) -> Self {
        self.then_shared(Arc::new(step))
    }

    /// Append an already shared step.
    pub fn then_shared(mut self, step: Arc<dyn Transform>) -> Self {
        self.steps.push(step);
        self
    }

    /// Build a chain from `name:args` specs, in order.
    pub fn from_specs<I, S>(specs: I) -> Result<Self, TransformError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        specs
            .into_iter()
            .try_fold(Self::new(), |chain, spec| {
                Ok(chain.then_shared(parse_transform(spec.as_ref())?))
            })
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Step identifiers in order, joined with `,`.
    ///
    /// An identifier containing `,` or `%` is percent-encoded.
    pub fn signature(&self) -> String {
        let mut out = String::new();
        for (i, step) in self.steps.iter().enumerate() {
            if i > 0 {
                out.push(SIGNATURE_SEPARATOR);
            }
            out.push_str(&escape_step_key(&step.key()));
        }
        out
    }

    /// Run every step in order; the first failure aborts the chain.
    pub fn apply(&self, image: DynamicImage) -> Result<DynamicImage, TransformError> {
        self.steps
            .iter()
            .try_fold(image, |image, step| step.transform(image))
    }
}

/// Percent-encode a step key that contains the separator or `%`.
///
/// Other keys stay readable; an encoded key always contains `%`, a plain one
/// never does, so the two forms cannot collide.
fn escape_step_key(key: &str) -> Cow<'_, str> {
    if key.contains(SIGNATURE_SEPARATOR) || key.contains('%') {
        urlencoding::encode(key)
    } else {
        Cow::Borrowed(key)
    }
}

impl fmt::Debug for TransformChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("TransformChain")
            .field(&self.signature())
            .finish()
    }
}
