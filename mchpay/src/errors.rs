use axum::response::{IntoResponse, Response};
use thiserror::Error as ThisError;

use crate::fields::{FAIL, FieldMap, RETURN_CODE, RETURN_MSG};
use crate::mockserver::Xml;

#[derive(ThisError, Debug)]
pub enum Error {
    /// The request never produced an HTTP response (connect, timeout, body read)
    #[error("transport error calling {url}: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    /// The payload is not a well-formed flat document
    #[error("malformed payload: {message}")]
    Decode { message: String },

    /// A field is present but its value cannot be interpreted
    #[error("invalid value {value:?} for {}: {reason}", display_field(.field, .index))]
    InvalidField {
        field: String,
        index: Option<usize>,
        value: String,
        reason: String,
    },

    /// A required field is absent
    #[error("missing required field {}", display_field(.field, .index))]
    MissingField { field: String, index: Option<usize> },

    #[error("unsupported sign_type: {0}")]
    UnsupportedSignType(String),

    /// The supplied `sign` does not match the one computed over the payload
    #[error("signature mismatch")]
    SignatureMismatch,

    /// Invalid request data
    #[error("{message}")]
    InvalidRequest { message: String },

    #[error("configuration error: {message}")]
    Config { message: String },
}

fn display_field(field: &str, index: &Option<usize>) -> String {
    match index {
        Some(i) => format!("{field}_{i}"),
        None => field.to_string(),
    }
}

impl Error {
    pub fn missing(field: impl Into<String>) -> Self {
        Error::MissingField {
            field: field.into(),
            index: None,
        }
    }

    pub fn invalid(field: impl Into<String>, index: Option<usize>, value: impl Into<String>, reason: impl ToString) -> Self {
        Error::InvalidField {
            field: field.into(),
            index,
            value: value.into(),
            reason: reason.to_string(),
        }
    }

    /// True for errors caused by the network rather than by the payload
    pub fn is_transport(&self) -> bool {
        matches!(self, Error::Transport { .. })
    }

    /// The `return_msg` reported to an inbound caller when its request is rejected
    pub fn return_msg(&self) -> String {
        match self {
            Error::Decode { message } => format!("Decode Error:{message}"),
            Error::SignatureMismatch => "Signature Incorrect".to_string(),
            Error::Transport { .. } | Error::Config { .. } => "System Error".to_string(),
            other => other.to_string(),
        }
    }
}

/// Rejections are reported in-band: the provider always answers 200 with a `FAIL` body.
impl IntoResponse for Error {
    fn into_response(self) -> Response {
        match &self {
            Error::Transport { .. } | Error::Config { .. } => {
                tracing::error!("Internal error while handling request: {:#}", self);
            }
            Error::SignatureMismatch => {
                tracing::info!("Rejected request: {}", self);
            }
            _ => {
                tracing::debug!("Rejected request: {}", self);
            }
        }

        let mut fields = FieldMap::new();
        fields.insert(RETURN_CODE, FAIL);
        fields.insert(RETURN_MSG, self.return_msg());
        Xml(fields).into_response()
    }
}

/// Errors from delivering an asynchronous result notification
#[derive(ThisError, Debug)]
pub enum CallbackError {
    #[error("invalid notify url")]
    MissingUrl,

    #[error("callback to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("malformed acknowledgement: {0}")]
    Decode(#[source] Error),

    /// The receiver answered, but not with the success sentinel
    #[error("callback not acknowledged: {return_msg}")]
    NotAcknowledged { return_msg: String },
}

/// Type alias for protocol operation results
pub type Result<T> = std::result::Result<T, Error>;
