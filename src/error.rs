use thiserror::Error;

/// Errors raised while fetching and parsing a playlist stream
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("Playlist muito grande: {size_mb:.1}MB (limite {limit_mb}MB)")]
    SourceTooLarge { size_mb: f64, limit_mb: usize },

    #[error("{message}")]
    HttpStatus { status: u16, message: String },

    #[error("Tempo esgotado ao baixar a playlist")]
    Timeout,

    #[error("Formato de playlist inválido: {0}")]
    MalformedStream(String),

    #[error("Falha de rede: {0}")]
    Network(String),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error("Processamento cancelado")]
    Cancelled,
}

impl ParseError {
    /// Transient failures are retried by the job queue; permanent ones are not.
    pub fn is_transient(&self) -> bool {
        match self {
            ParseError::Network(_) | ParseError::Timeout => true,
            ParseError::HttpStatus { status, .. } => *status == 429 || *status >= 500,
            ParseError::Cache(CacheError::Io(_)) => true,
            _ => false,
        }
    }
}

/// Errors raised by the content-addressed cache store
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Cache não encontrado")]
    NotFound,

    #[error("Cache expirado")]
    Expired,

    #[error("I/O do cache falhou: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialização do cache falhou: {0}")]
    Serde(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(ParseError::Timeout.is_transient());
        assert!(ParseError::Network("reset".into()).is_transient());
        assert!(ParseError::HttpStatus { status: 503, message: "".into() }.is_transient());
        assert!(ParseError::HttpStatus { status: 429, message: "".into() }.is_transient());
        assert!(!ParseError::HttpStatus { status: 404, message: "".into() }.is_transient());
        assert!(!ParseError::SourceTooLarge { size_mb: 2048.0, limit_mb: 1000 }.is_transient());
        assert!(!ParseError::MalformedStream("bad".into()).is_transient());
        assert!(!ParseError::Cancelled.is_transient());
    }
}
