use thiserror::Error;

/// Errors raised by the fusion layers and their orchestration.
///
/// Conditioning-protocol violations are programming errors on the caller's
/// side, not data errors. They are surfaced at the call site that broke the
/// contract and never recovered internally.
#[derive(Debug, Error)]
pub enum FlamingoError {
    #[error("fusion layers are not initialized, call init_fusion first")]
    NotInitialized,
    #[error("fusion layers are already initialized")]
    AlreadyInitialized,
    #[error("visual features must be conditioned before the forward pass")]
    MissingVisualFeatures,
    #[error("media locations must be conditioned before the forward pass")]
    MissingMediaLocations,
    #[error("cached media attention requested but no media has been attended yet")]
    NoCachedMedia,
    #[error("invalid fusion config: {0}")]
    InvalidConfig(String),
    #[error(transparent)]
    Tensor(#[from] candle_core::Error),
}
