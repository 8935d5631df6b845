use crate::body::BoxError;

/// Hop-level error for a single request/response lifecycle.
///
/// At the handler boundary every variant except [`Error::MethodNotSupported`]
/// is rendered as a `502 Bad Gateway` to the downstream client. Within the
/// middleware chain errors propagate verbatim so middlewares can decide
/// whether to swallow them.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Terminal-step refusal for CONNECT requests.
    ///
    /// This is a sentinel, not a failure: it means "no middleware
    /// short-circuited, the transport will not tunnel, proceed to
    /// hijack-and-splice". It carries the request head back so the tunnel and
    /// MITM handlers see any mutations middlewares applied (a cascade
    /// credential injected into `Proxy-Authorization`, for example).
    #[error("transport does not support CONNECT")]
    MethodNotSupported(Box<http::request::Parts>),

    /// The upstream round trip failed (DNS, dial, TLS, read).
    #[error("upstream round trip failed: {0}")]
    Transport(BoxError),

    /// The serving framework does not permit withdrawing the connection.
    #[error("connection hijacking is not available for this request")]
    HijackUnavailable,

    /// The request target could not be resolved to a dialable address.
    #[error("invalid proxy target: {0}")]
    InvalidTarget(String),

    /// The context's cancellation token fired while work was in flight.
    #[error("request canceled")]
    Canceled,

    /// Minting a leaf certificate under the configured CA failed.
    #[error("cannot sign host certificate with provided CA: {0}")]
    CertSign(String),

    /// The CA private key is neither RSA nor P-256 ECDSA.
    #[error("unsupported CA key type")]
    UnsupportedKeyType,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn transport(err: impl Into<BoxError>) -> Self {
        Error::Transport(err.into())
    }

    /// True for the CONNECT sentinel the tunnel and MITM handlers key off.
    pub fn is_method_not_supported(&self) -> bool {
        matches!(self, Error::MethodNotSupported(_))
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
