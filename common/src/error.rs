use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Sentinel for a scrape whose payload outpaced the ingestion channel.
    #[error("ingest channel full")]
    IngestChannelFull,
    #[error("server returned HTTP status {0}")]
    BadResponseStatus(String),
    #[error("invalid scrape configuration: {0}")]
    Config(String),
    #[error("decoding scrape payload: {0}")]
    Decode(String),
    #[error("appending sample: {0}")]
    Append(String),
    #[error("{0}")]
    Internal(String),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn is_ingest_channel_full(&self) -> bool {
        matches!(self, Error::IngestChannelFull)
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
