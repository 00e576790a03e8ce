// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::{borrow::Cow, fmt::Display};

pub type Result<T> = ::std::result::Result<T, Error>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// Indicates that a continuation token could not be parsed, or that it does not match the shape of the query being resumed.
    ///
    /// This error is not recoverable by retrying. The caller must restart the query without a continuation, or supply the token that was issued for this query.
    MalformedContinuation,

    /// Indicates that the query targets more than one partition key range, but cross-partition queries were not enabled in the [`QueryOptions`](crate::query::QueryOptions).
    CrossPartitionDisabled,

    /// Indicates that the `ORDER BY` items returned for the query cannot be compared.
    ///
    /// This happens when a sort term has values of different types across documents (including documents where the term is undefined), or when a value is an object or array.
    /// The whole query fails, because continuing would produce a silently incorrect order.
    UnsupportedComparison,

    /// Indicates that a request made by the transport collaborator failed.
    ///
    /// The status code and activity ID reported by the transport are available on the [`Error`].
    UpstreamRequestError,

    /// Indicates that the query plan requires features that are not supported by the query engine.
    ///
    /// The [`SUPPORTED_FEATURES`](crate::query::SUPPORTED_FEATURES) constant reports the features supported by the engine, and the caller must provide that information to the planner.
    UnsupportedQueryPlan,

    /// Indicates that the options referenced a partition key range that is not known to the coordinator.
    UnknownPartitionKeyRange,

    /// Indicates that one of the provided options is out of range or conflicts with another option.
    InvalidArgument,

    /// Indicates that a page returned by the gateway could not be decoded, or is otherwise inconsistent.
    ///
    /// This error is not recoverable and indicates a bug in the gateway.
    InvalidGatewayResponse,

    /// Indicates a failure to deserialize result payloads into a caller-provided type, the details of which should be available in [`Error::source`](std::error::Error::source).
    DeserializationError,

    /// Indicates an internal error in the query engine.
    ///
    /// This error is not recoverable, and indicates a bug in the engine. We return this error only to allow the caller to log the error and report it to the user.
    InternalError,
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            ErrorKind::MalformedContinuation => write!(f, "malformed continuation token"),
            ErrorKind::CrossPartitionDisabled => {
                write!(f, "cross partition query is required but disabled")
            }
            ErrorKind::UnsupportedComparison => {
                write!(f, "order by items could not be compared")
            }
            ErrorKind::UpstreamRequestError => write!(f, "upstream request failed"),
            ErrorKind::UnsupportedQueryPlan => write!(f, "unsupported query plan"),
            ErrorKind::UnknownPartitionKeyRange => write!(f, "unknown partition key range"),
            ErrorKind::InvalidArgument => write!(f, "invalid argument"),
            ErrorKind::InvalidGatewayResponse => write!(f, "invalid data recieved from gateway"),
            ErrorKind::DeserializationError => write!(f, "deserialization error"),
            ErrorKind::InternalError => write!(f, "internal query engine error"),
        }
    }
}

impl ErrorKind {
    pub fn with_source(self, source: impl std::error::Error + Send + Sync + 'static) -> Error {
        Error::from(self).with_source(source)
    }

    pub fn with_message(self, message: impl Into<Cow<'static, str>>) -> Error {
        Error::from(self).with_message(message)
    }

    /// The HTTP-style status code reported for errors of this kind, unless the error carries its own.
    pub fn default_status_code(self) -> u16 {
        match self {
            ErrorKind::MalformedContinuation
            | ErrorKind::CrossPartitionDisabled
            | ErrorKind::UnsupportedComparison
            | ErrorKind::UnsupportedQueryPlan
            | ErrorKind::UnknownPartitionKeyRange
            | ErrorKind::InvalidArgument
            | ErrorKind::DeserializationError => 400,
            ErrorKind::UpstreamRequestError
            | ErrorKind::InvalidGatewayResponse
            | ErrorKind::InternalError => 500,
        }
    }
}

#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
    message: Option<Cow<'static, str>>,
    status_code: Option<u16>,
    activity_id: Option<String>,
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Self {
            kind,
            source: None,
            message: None,
            status_code: None,
            activity_id: None,
        }
    }
}

impl Error {
    /// Creates an [`ErrorKind::UpstreamRequestError`] carrying the status code and activity ID reported by the transport.
    pub fn upstream(
        status_code: u16,
        activity_id: impl Into<String>,
        message: impl Into<Cow<'static, str>>,
    ) -> Self {
        Error::from(ErrorKind::UpstreamRequestError)
            .with_status_code(status_code)
            .with_activity_id(activity_id)
            .with_message(message)
    }

    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    pub fn with_message(mut self, message: impl Into<Cow<'static, str>>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_status_code(mut self, status_code: u16) -> Self {
        self.status_code = Some(status_code);
        self
    }

    pub fn with_activity_id(mut self, activity_id: impl Into<String>) -> Self {
        self.activity_id = Some(activity_id.into());
        self
    }

    /// Sets the activity ID, unless the error already carries one from the transport.
    pub(crate) fn or_activity_id(mut self, activity_id: &str) -> Self {
        if self.activity_id.is_none() {
            self.activity_id = Some(activity_id.to_string());
        }
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn status_code(&self) -> u16 {
        self.status_code
            .unwrap_or_else(|| self.kind.default_status_code())
    }

    /// The correlation ID of the request or query execution that produced this error.
    pub fn activity_id(&self) -> Option<&str> {
        self.activity_id.as_deref()
    }

    /// Indicates if reissuing the failed request could succeed.
    ///
    /// Only transport failures are ever retryable. Client errors mean the query or its options must be fixed.
    pub fn is_retryable(&self) -> bool {
        self.kind == ErrorKind::UpstreamRequestError
            && matches!(self.status_code(), 408 | 410 | 429 | 449 | 500..=599)
    }

    pub fn into_source(self) -> Option<Box<dyn std::error::Error + Send + Sync>> {
        self.source
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match &self.message {
            Some(message) => write!(f, "{message}")?,
            None => write!(f, "{}", self.kind)?,
        }
        write!(f, " (status: {}", self.status_code())?;
        if let Some(activity_id) = &self.activity_id {
            write!(f, ", activity id: {activity_id}")?;
        }
        write!(f, ")")
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        let source = self.source.as_ref()?;
        Some(&**source)
    }
}
