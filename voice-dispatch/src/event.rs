use std::{
    fmt::{Display, Formatter},
    sync::Arc,
};

/// Where in the pipeline a stream failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureKind {
    /// The decode process failed or the input could not be read.
    Source,
    /// The codec rejected a frame.
    Encode,
    /// The outbound transport rejected a frame.
    Sink,
}

impl Display for FailureKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureKind::Source => write!(f, "source"),
            FailureKind::Encode => write!(f, "encode"),
            FailureKind::Sink => write!(f, "sink"),
        }
    }
}

/// A failure carried by an `error` signal. Cheap to clone so it can travel
/// through broadcast channels.
#[derive(Clone, Debug)]
pub struct StreamFailure {
    pub kind: FailureKind,
    pub cause: Arc<anyhow::Error>,
}

impl StreamFailure {
    pub fn new(kind: FailureKind, cause: anyhow::Error) -> Self {
        Self {
            kind,
            cause: Arc::new(cause),
        }
    }

    pub fn source(cause: impl Into<anyhow::Error>) -> Self {
        Self::new(FailureKind::Source, cause.into())
    }

    pub fn encode(cause: impl Into<anyhow::Error>) -> Self {
        Self::new(FailureKind::Encode, cause.into())
    }

    pub fn sink(cause: impl Into<anyhow::Error>) -> Self {
        Self::new(FailureKind::Sink, cause.into())
    }
}

impl Display for StreamFailure {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} failure: {:#}", self.kind, self.cause)
    }
}

impl From<StreamFailure> for anyhow::Error {
    fn from(failure: StreamFailure) -> Self {
        anyhow::anyhow!("{}", failure)
    }
}
