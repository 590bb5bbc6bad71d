/// Errors returned by the tracking and detection entry points.
///
/// Numerical failures inside an iterative solve and lost tracks are *not*
/// represented here: those paths log a warning, leave the transformation
/// untouched, and return `Ok` so the caller can retry on the next frame.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackError {
    #[error("invalid parameters: {0}")]
    InvalidParameters(&'static str),
    #[error("invalid size: {0}")]
    InvalidSize(&'static str),
    #[error("invalid object: {0}")]
    InvalidObject(&'static str),
    #[error("scratch arena exhausted: requested {requested} bytes, {available} available")]
    OutOfMemory { requested: usize, available: usize },
    #[error("aliased memory: {0}")]
    AliasedMemory(&'static str),
}

pub type TrackResult<T> = Result<T, TrackError>;
