use super::SubConn;
use std::any::Any;
use std::fmt;
use std::sync::Arc;
use tonic::metadata::MetadataMap;
use tonic::{Code, Status};

/// Information about the call a [`Picker`] is asked to route.
#[derive(Debug, Clone, Default)]
pub struct PickInfo {
    /// The full method name, in the `/service/Method` form.
    pub full_method_name: String,
    /// The outgoing request metadata.
    pub metadata: MetadataMap,
}

impl PickInfo {
    pub fn new<T: Into<String>>(full_method_name: T) -> Self {
        Self {
            full_method_name: full_method_name.into(),
            metadata: MetadataMap::new(),
        }
    }
}

/// The outcome of a call that was routed to a SubConn.
#[derive(Default)]
pub struct DoneInfo {
    /// The final error of the call, if it failed.
    pub err: Option<Status>,
    /// The trailing metadata returned by the server.
    pub trailer: MetadataMap,
    /// Whether any bytes were sent to the server.
    pub bytes_sent: bool,
    /// Whether any bytes were received from the server.
    pub bytes_received: bool,
    /// Load report sent by the server, usually as part of the trailers.
    pub server_load: Option<Arc<dyn Any + Send + Sync>>,
}

impl fmt::Debug for DoneInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DoneInfo")
            .field("err", &self.err)
            .field("trailer", &self.trailer)
            .field("bytes_sent", &self.bytes_sent)
            .field("bytes_received", &self.bytes_received)
            .field("server_load", &self.server_load.is_some())
            .finish()
    }
}

/// Invoked once when a call routed by a picker completes.
pub type DoneCallback = Box<dyn FnOnce(DoneInfo) + Send>;

/// The connection chosen for a call.
pub struct PickResult {
    /// Must be a SubConn returned by [`ClientConn::new_sub_conn`](super::ClientConn::new_sub_conn).
    /// If it is not ready when the call starts, the channel waits for the next picker.
    pub sub_conn: Arc<dyn SubConn>,
    /// Invoked exactly once when the call completes. It is dropped without being
    /// invoked if the pick did not end up carrying a call.
    pub done: Option<DoneCallback>,
}

impl PickResult {
    pub fn new(sub_conn: Arc<dyn SubConn>) -> Self {
        Self {
            sub_conn,
            done: None,
        }
    }

    pub fn with_done<F>(self, done: F) -> Self
    where
        F: FnOnce(DoneInfo) + Send + 'static,
    {
        Self {
            done: Some(Box::new(done)),
            ..self
        }
    }
}

impl fmt::Debug for PickResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PickResult")
            .field("sub_conn", &self.sub_conn.id())
            .field("done", &self.done.is_some())
            .finish()
    }
}

/// How the channel handles a failed pick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PickErrorKind {
    /// Block the call until a new picker is published, then pick again.
    UnavailableRetry,
    /// Fail the call with the carried status.
    Status,
    /// Wait-for-ready calls block until the next picker, others fail as unavailable.
    Opaque,
}

/// Why a [`Picker`] could not route a call.
#[derive(Debug, Clone, thiserror::Error)]
pub enum PickError {
    /// No SubConn is available yet. The call waits for the next picker.
    #[error("no SubConn is available")]
    NoSubConnAvailable,
    /// The call fails with this status code and message.
    #[error("status {code:?}: {message}")]
    Status { code: Code, message: String },
    /// Any other failure, e.g. the last connection error of the balancer.
    #[error("{0}")]
    Opaque(Arc<anyhow::Error>),
}

impl PickError {
    pub fn status<T: Into<String>>(code: Code, message: T) -> Self {
        PickError::Status {
            code,
            message: message.into(),
        }
    }

    pub fn opaque<E: Into<anyhow::Error>>(err: E) -> Self {
        PickError::Opaque(Arc::new(err.into()))
    }

    pub fn kind(&self) -> PickErrorKind {
        match self {
            PickError::NoSubConnAvailable => PickErrorKind::UnavailableRetry,
            PickError::Status { .. } => PickErrorKind::Status,
            PickError::Opaque(_) => PickErrorKind::Opaque,
        }
    }

    /// The status a call fails with when it does not wait for this error to clear.
    pub fn to_status(&self) -> Status {
        match self {
            PickError::NoSubConnAvailable => Status::unavailable(self.to_string()),
            PickError::Status { code, message } => Status::new(*code, message.clone()),
            PickError::Opaque(err) => Status::unavailable(err.to_string()),
        }
    }
}

impl From<Status> for PickError {
    fn from(status: Status) -> Self {
        PickError::status(status.code(), status.message())
    }
}

/// Routes calls to SubConns.
///
/// A balancer builds a new picker from a snapshot of its state every time that
/// state changes and hands it to [`ClientConn::update_state`](super::ClientConn::update_state).
/// Pickers are never mutated once published.
pub trait Picker: Send + Sync {
    /// Choose the SubConn for a call.
    ///
    /// Must not block. When no decision can be made yet, return
    /// [`PickError::NoSubConnAvailable`]; the channel retries with the next picker.
    fn pick(&self, info: &PickInfo) -> Result<PickResult, PickError>;
}

/// A picker that fails every pick with the same error.
#[derive(Debug, Clone)]
pub struct ErrorPicker {
    err: PickError,
}

impl ErrorPicker {
    pub fn new(err: PickError) -> Self {
        Self { err }
    }

    /// A picker that makes every call wait for the next one.
    pub fn no_sub_conn_available() -> Self {
        Self::new(PickError::NoSubConnAvailable)
    }
}

impl Picker for ErrorPicker {
    fn pick(&self, _info: &PickInfo) -> Result<PickResult, PickError> {
        Err(self.err.clone())
    }
}
