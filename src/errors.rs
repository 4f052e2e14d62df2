use gpurent_api::ApiError;
use gpurent_core::CoreError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("API error: {0}")]
    Api(#[from] ApiError),

    #[error("Core error: {0}")]
    Core(#[from] CoreError),

    /// The instance's own status text carries an error marker.
    #[error("instance on machine {machine_id} reported error status: {message}")]
    ErrorStatus { machine_id: i64, message: String },

    /// A bid-priced instance fell below the market clearing price.
    #[error("outbid")]
    Outbid,

    #[error("no offer matches the search query")]
    NoMatchingOffer,

    /// `create()` on an instance that is already bound. Programming error;
    /// a live binding is never overwritten.
    #[error("instance is already bound to a remote resource")]
    AlreadyBound,

    /// An operation that needs a bound instance was called on an unbound one.
    #[error("instance is not bound to a remote resource")]
    NotBound,

    #[error("Not found: {0}")]
    NotFound(String),

    /// Only raised when a maximum wait duration was configured.
    #[error("instance did not converge within the configured wait limit")]
    WaitTimeout,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
