//! Outbound signals of a change stream
//!
//! Records, catch-up announcements and errors travel on one ordered channel
//! as a tagged union, so a consumer sees them interleaved exactly as the
//! transform produced them.

use crate::error::ChangesError;
use crate::event::Seq;
use crate::record::AdaptedRecord;

/// A signal emitted by a [`ChangeStream`](crate::ChangeStream).
#[derive(Debug)]
pub enum ChangeSignal {
    /// A change carrying a document, wrapped as a record
    Record(AdaptedRecord),
    /// The feed reached the database's current sequence at this seq
    Current(Seq),
    /// A failure. Fatal errors are the last signal of the stream.
    Error(ChangesError),
}

impl ChangeSignal {
    /// Returns the record, if this is a record signal.
    pub fn into_record(self) -> Option<AdaptedRecord> {
        match self {
            Self::Record(record) => Some(record),
            _ => None,
        }
    }

    /// Borrow the record, if this is a record signal.
    pub fn as_record(&self) -> Option<&AdaptedRecord> {
        match self {
            Self::Record(record) => Some(record),
            _ => None,
        }
    }

    /// The announced sequence, if this is a catch-up signal.
    pub fn as_current(&self) -> Option<&Seq> {
        match self {
            Self::Current(seq) => Some(seq),
            _ => None,
        }
    }

    /// Borrow the error, if this is an error signal.
    pub fn as_error(&self) -> Option<&ChangesError> {
        match self {
            Self::Error(err) => Some(err),
            _ => None,
        }
    }

    /// Check if this is a record signal
    pub fn is_record(&self) -> bool {
        matches!(self, Self::Record(_))
    }

    /// Check if this is an error signal
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }
}

impl From<ChangesError> for ChangeSignal {
    fn from(err: ChangesError) -> Self {
        Self::Error(err)
    }
}
