//! Built-in transforms and the `name:args` spec parser.

use std::sync::Arc;

use image::imageops::FilterType;
use image::DynamicImage;

use super::Transform;
use crate::error::TransformError;

fn step_failed(step: &dyn Transform, message: impl Into<String>) -> TransformError {
    TransformError::StepFailed {
        step: step.key(),
        message: message.into(),
    }
}

/// Resize to exact dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resize {
    pub width: u32,
    pub height: u32,
}

impl Resize {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl Transform for Resize {
    fn key(&self) -> String {
        format!("resize({}x{})", self.width, self.height)
    }

    fn transform(&self, image: DynamicImage) -> Result<DynamicImage, TransformError> {
        if self.width == 0 || self.height == 0 {
            return Err(step_failed(self, "target size must be non-zero"));
        }
        Ok(image.resize_exact(self.width, self.height, FilterType::Triangle))
    }
}

/// Crop a centered rectangle, clipped to the image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CenterCrop {
    pub width: u32,
    pub height: u32,
}

impl CenterCrop {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl Transform for CenterCrop {
    fn key(&self) -> String {
        format!("crop({}x{})", self.width, self.height)
    }

    fn transform(&self, image: DynamicImage) -> Result<DynamicImage, TransformError> {
        if self.width == 0 || self.height == 0 {
            return Err(step_failed(self, "crop size must be non-zero"));
        }
        let width = self.width.min(image.width());
        let height = self.height.min(image.height());
        let x = (image.width() - width) / 2;
        let y = (image.height() - height) / 2;
        Ok(image.crop_imm(x, y, width, height))
    }
}

/// Convert to grayscale, keeping any alpha channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Grayscale;

impl Transform for Grayscale {
    fn key(&self) -> String {
        "grayscale".to_string()
    }

    fn transform(&self, image: DynamicImage) -> Result<DynamicImage, TransformError> {
        Ok(image.grayscale())
    }
}

/// Clockwise rotation by a multiple of 90 degrees.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rotate {
    Deg90,
    Deg180,
    Deg270,
}

impl Transform for Rotate {
    fn key(&self) -> String {
        let degrees = match self {
            Rotate::Deg90 => 90,
            Rotate::Deg180 => 180,
            Rotate::Deg270 => 270,
        };
        format!("rotate({degrees})")
    }

    fn transform(&self, image: DynamicImage) -> Result<DynamicImage, TransformError> {
        Ok(match self {
            Rotate::Deg90 => image.rotate90(),
            Rotate::Deg180 => image.rotate180(),
            Rotate::Deg270 => image.rotate270(),
        })
    }
}

/// Gaussian blur.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Blur {
    pub sigma: f32,
}

impl Blur {
    pub fn new(sigma: f32) -> Self {
        Self { sigma }
    }
}

impl Transform for Blur {
    fn key(&self) -> String {
        format!("blur({})", self.sigma)
    }

    fn transform(&self, image: DynamicImage) -> Result<DynamicImage, TransformError> {
        if !self.sigma.is_finite() || self.sigma <= 0.0 {
            return Err(step_failed(self, "sigma must be a positive number"));
        }
        Ok(image.blur(self.sigma))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlipAxis {
    Horizontal,
    Vertical,
}

/// Mirror along one axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Flip(pub FlipAxis);

impl Transform for Flip {
    fn key(&self) -> String {
        match self.0 {
            FlipAxis::Horizontal => "flip(h)".to_string(),
            FlipAxis::Vertical => "flip(v)".to_string(),
        }
    }

    fn transform(&self, image: DynamicImage) -> Result<DynamicImage, TransformError> {
        Ok(match self.0 {
            FlipAxis::Horizontal => image.fliph(),
            FlipAxis::Vertical => image.flipv(),
        })
    }
}

// =============================================================================
// Spec parsing
// =============================================================================

/// Parse a transform spec of the form `name` or `name:args`.
///
/// | Spec              | Transform                 |
/// |-------------------|---------------------------|
/// | `resize:WxH`      | [`Resize`]                |
/// | `crop:WxH`        | [`CenterCrop`]            |
/// | `grayscale`       | [`Grayscale`]             |
/// | `rotate:90`       | [`Rotate`] (90, 180, 270) |
/// | `blur:SIGMA`      | [`Blur`]                  |
/// | `flip:h`/`flip:v` | [`Flip`]                  |
///
/// # Errors
///
/// Returns [`TransformError::InvalidSpec`] for unknown names or bad arguments.
pub fn parse_transform(spec: &str) -> Result<Arc<dyn Transform>, TransformError> {
    let invalid = |message: &str| TransformError::InvalidSpec {
        spec: spec.to_string(),
        message: message.to_string(),
    };

    let (name, args) = match spec.trim().split_once(':') {
        Some((name, args)) => (name, Some(args.trim())),
        None => (spec.trim(), None),
    };

    match (name.to_ascii_lowercase().as_str(), args) {
        ("resize", Some(args)) => {
            let (width, height) = parse_dimensions(args).ok_or_else(|| invalid("expected WxH"))?;
            Ok(Arc::new(Resize::new(width, height)))
        }
        ("crop", Some(args)) => {
            let (width, height) = parse_dimensions(args).ok_or_else(|| invalid("expected WxH"))?;
            Ok(Arc::new(CenterCrop::new(width, height)))
        }
        ("grayscale", None) => Ok(Arc::new(Grayscale)),
        ("rotate", Some(args)) => match args {
            "90" => Ok(Arc::new(Rotate::Deg90)),
            "180" => Ok(Arc::new(Rotate::Deg180)),
            "270" => Ok(Arc::new(Rotate::Deg270)),
            _ => Err(invalid("rotation must be 90, 180 or 270")),
        },
        ("blur", Some(args)) => {
            let sigma: f32 = args.parse().map_err(|_| invalid("sigma must be a number"))?;
            if !sigma.is_finite() || sigma <= 0.0 {
                return Err(invalid("sigma must be a positive number"));
            }
            Ok(Arc::new(Blur::new(sigma)))
        }
        ("flip", Some(args)) => match args {
            "h" => Ok(Arc::new(Flip(FlipAxis::Horizontal))),
            "v" => Ok(Arc::new(Flip(FlipAxis::Vertical))),
            _ => Err(invalid("axis must be h or v")),
        },
        ("resize" | "crop" | "rotate" | "blur" | "flip", None) => Err(invalid("missing arguments")),
        ("grayscale", Some(_)) => Err(invalid("grayscale takes no arguments")),
        _ => Err(invalid("unknown transform")),
    }
}

fn parse_dimensions(args: &str) -> Option<(u32, u32)> {
    let (width, height) = args.split_once(['x', 'X'])?;
    let width = width.trim().parse().ok()?;
    let height = height.trim().parse().ok()?;
    if width == 0 || height == 0 {
        return None;
    }
    Some((width, height))
}
