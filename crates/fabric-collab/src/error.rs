use thiserror::Error;

#[derive(Debug, Error)]
pub enum CollabError {
    #[error("tracker rejected claim: item already claimed")]
    Conflict,

    #[error("http error: {0}")]
    Http(String),

    #[error("reasoning backend returned no candidates")]
    NoCandidates,
}

impl From<reqwest::Error> for CollabError {
    fn from(e: reqwest::Error) -> Self {
        CollabError::Http(e.to_string())
    }
}
