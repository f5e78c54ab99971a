#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("malformed trace data at offset {offset}: {reason}")]
    Parse { offset: u64, reason: String },
    #[error("the stream was closed in the middle of a record at offset {offset}")]
    TransportClosed { offset: u64 },
    #[error("metadata id {0} was defined more than once")]
    DuplicateMetadataId(u32),
    #[error("event references metadata id {0} which has not been defined")]
    UnknownMetadataId(u32),
}

impl Error {
    #[inline]
    pub(crate) fn parse(offset: u64, reason: impl Into<String>) -> Self {
        Self::Parse {
            offset,
            reason: reason.into(),
        }
    }
}
