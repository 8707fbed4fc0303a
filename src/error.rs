//! Error taxonomy for the ingestion pipeline.
//!
//! Each component fails fast with its own error type. The ingestion loop
//! folds them into [`IngestError`] and is the single place that decides,
//! through [`ErrorKind::disposition`], whether a failure is retried or fatal.
//!
//! | Kind | Disposition |
//! |------|-------------|
//! | [`ErrorKind::Configuration`] | [`Disposition::Fatal`] |
//! | [`ErrorKind::Transport`] | [`Disposition::RetryCycle`] |
//! | [`ErrorKind::Store`] | [`Disposition::ReconnectStore`] |
//! | [`ErrorKind::Decode`] | [`Disposition::DropMessage`] |

use thiserror::Error;

use crate::broker::BrokerError;
use crate::models::DecodeError;
use crate::schema::SchemaError;
use crate::store::StoreError;
use crate::tunnel::TunnelError;

pub type IngestResult<T> = Result<T, IngestError>;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("schema error: {0}")]
    Schema(#[from] SchemaError),

    #[error("tunnel error: {0}")]
    Tunnel(#[from] TunnelError),

    #[error("broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),
}

/// Coarse failure category.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Configuration,
    Transport,
    Store,
    Decode,
}

/// What the ingestion loop does with a failure of a given kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Stop the process.
    Fatal,
    /// Tear down tunnel and store, back off, start a new cycle.
    RetryCycle,
    /// Recycle the store session and keep streaming; escalates to
    /// [`Disposition::RetryCycle`] if the reconnect fails.
    ReconnectStore,
    /// Report and drop the offending message.
    DropMessage,
}

impl ErrorKind {
    pub fn disposition(self) -> Disposition {
        match self {
            ErrorKind::Configuration => Disposition::Fatal,
            ErrorKind::Transport => Disposition::RetryCycle,
            ErrorKind::Store => Disposition::ReconnectStore,
            ErrorKind::Decode => Disposition::DropMessage,
        }
    }
}

impl IngestError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            IngestError::Config(_) | IngestError::Schema(_) => ErrorKind::Configuration,
            IngestError::Tunnel(_) | IngestError::Broker(_) => ErrorKind::Transport,
            IngestError::Store(_) => ErrorKind::Store,
            IngestError::Decode(_) => ErrorKind::Decode,
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.kind().disposition() == Disposition::Fatal
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_propagation_table() {
        let cases = [
            (
                IngestError::Config("missing device.name".into()),
                ErrorKind::Configuration,
                Disposition::Fatal,
            ),
            (
                IngestError::Schema(SchemaError::MissingTimestamp),
                ErrorKind::Configuration,
                Disposition::Fatal,
            ),
            (
                IngestError::Tunnel(TunnelError::Dropped),
                ErrorKind::Transport,
                Disposition::RetryCycle,
            ),
            (
                IngestError::Broker(BrokerError::Closed),
                ErrorKind::Transport,
                Disposition::RetryCycle,
            ),
            (
                IngestError::Store(StoreError::NotConnected),
                ErrorKind::Store,
                Disposition::ReconnectStore,
            ),
            (
                IngestError::Decode(DecodeError::NotAnObject),
                ErrorKind::Decode,
                Disposition::DropMessage,
            ),
        ];

        for (err, kind, disposition) in cases {
            assert_eq!(err.kind(), kind, "{}", err);
            assert_eq!(err.kind().disposition(), disposition, "{}", err);
        }
    }

    #[test]
    fn test_only_configuration_is_fatal() {
        assert!(IngestError::Config("x".into()).is_fatal());
        assert!(!IngestError::Tunnel(TunnelError::Dropped).is_fatal());
        assert!(!IngestError::Store(StoreError::NotConnected).is_fatal());
    }
}
