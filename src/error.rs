use thiserror::Error;

#[derive(Error, Debug)]
pub enum NetError {
    #[error("tap device setup failed: {0}")]
    Tap(String),

    #[error("vhost setup failed: {0}")]
    Vhost(String),

    #[error("device stopped")]
    DeviceStopped,

    #[error("address resolution aborted")]
    ResolutionAborted,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
