use reqwest::StatusCode;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum McpError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("timeout after {0}ms")]
    Timeout(u64),

    #[error("protocol parse error: {0}")]
    ProtocolParse(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("capacity exceeded: {0}")]
    CapacityExceeded(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("unsupported protocol: {0}")]
    Unsupported(String),

    #[error("circuit open for backend {0}")]
    CircuitOpen(String),

    #[error("backend {backend} exceeded {restarts} restarts")]
    MaxRestartsExceeded { backend: String, restarts: u32 },

    #[error("no server available: {0}")]
    NoServerAvailable(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("upstream returned {status}: {message}")]
    UpstreamStatus { status: u16, message: String },

    #[error("backend error {code}: {message}")]
    Backend { code: i32, message: String },

    #[error("request cancelled")]
    Cancelled,

    #[error("gateway is shutting down")]
    ShuttingDown,

    #[error("internal error: {0}")]
    Internal(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<anyhow::Error> for McpError {
    fn from(e: anyhow::Error) -> Self {
        McpError::Internal(e.to_string())
    }
}

impl From<reqwest::Error> for McpError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            return McpError::Timeout(0);
        }
        if let Some(status) = e.status() {
            return McpError::UpstreamStatus {
                status: status.as_u16(),
                message: e.to_string(),
            };
        }
        if e.is_connect() {
            return McpError::Connection(e.to_string());
        }
        McpError::Transport(e.to_string())
    }
}

impl McpError {
    /// Whether the failure was a 4xx answer from the backend.
    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::UpstreamStatus { status, .. } if (400..500).contains(status))
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Configuration(_) | Self::Unsupported(_) => StatusCode::BAD_REQUEST,
            Self::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::CapacityExceeded(_) => StatusCode::TOO_MANY_REQUESTS,
            Self::NoServerAvailable(_)
            | Self::CircuitOpen(_)
            | Self::MaxRestartsExceeded { .. }
            | Self::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
            Self::Connection(_)
            | Self::Transport(_)
            | Self::ProtocolParse(_)
            | Self::UpstreamStatus { .. }
            | Self::Backend { .. } => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Connection(_) => "CONNECTION_ERROR",
            Self::Timeout(_) => "TIMEOUT",
            Self::ProtocolParse(_) => "PROTOCOL_PARSE_ERROR",
            Self::Configuration(_) => "CONFIGURATION_ERROR",
            Self::CapacityExceeded(_) => "CAPACITY_EXCEEDED",
            Self::NotFound(_) => "NOT_FOUND",
            Self::Unsupported(_) => "UNSUPPORTED",
            Self::CircuitOpen(_) => "CIRCUIT_OPEN",
            Self::MaxRestartsExceeded { .. } => "MAX_RESTARTS_EXCEEDED",
            Self::NoServerAvailable(_) => "NO_SERVER_AVAILABLE",
            Self::Transport(_) => "TRANSPORT_ERROR",
            Self::UpstreamStatus { .. } => "UPSTREAM_STATUS",
            Self::Backend { .. } => "BACKEND_ERROR",
            Self::Cancelled => "CANCELLED",
            Self::ShuttingDown => "SHUTTING_DOWN",
            Self::Internal(_) => "INTERNAL_ERROR",
            Self::Io(_) => "IO_ERROR",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
        }
    }
}

pub type McpResult<T> = Result<T, McpError>;
