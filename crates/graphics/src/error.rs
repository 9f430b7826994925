/// Errors raised while creating a device or one of its resources.
///
/// Errors during a frame are not recoverable and panic instead.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[cfg(target_os = "windows")]
    #[error("graphics API call failed: {0}")]
    Api(#[from] windows::core::Error),

    #[error("window handle not supported by this backend: {0}")]
    UnsupportedWindow(&'static str),

    #[error("invalid device configuration: {0}")]
    InvalidConfig(String),
}
