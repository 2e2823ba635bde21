use derive_more::From;
use k8s_openapi::serde_json;

pub type Result<T> = core::result::Result<T, Error>;

#[derive(Debug, From)]
pub enum Error {
    #[from]
    Json(serde_json::Error),

    #[from]
    Kube(kube::Error),

    #[from]
    Infer(kube::config::InferConfigError),

    #[from]
    HttpHeader(hyper::http::Error),

    #[from]
    Io(std::io::Error),

    /// Connection-level failure in the watch transport; retried by the
    /// channel itself and reported through its error handlers.
    Transport(String),

    /// A page request failed during an incremental list run.
    ListFetch(String),

    /// The subscription was torn down while work was in flight.
    Cancelled,

    /// Custom error message
    Custom(String),
}

impl core::fmt::Display for Error {
    fn fmt(&self, fmt: &mut core::fmt::Formatter) -> core::result::Result<(), core::fmt::Error> {
        write!(fmt, "{self:?}")
    }
}

impl std::error::Error for Error {}
