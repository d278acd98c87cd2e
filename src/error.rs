use std::{error::Error as StdError, io, net::SocketAddr};

type BoxError = Box<dyn StdError + Send + Sync>;

#[derive(thiserror::Error, Debug)]
pub enum BenchError {
    #[error("concurrency must be at least 1")]
    InvalidConcurrency,
    #[error("failed to listen on a port: {}", render_attempts(.attempts))]
    Bind { attempts: Vec<(SocketAddr, io::Error)> },
    /// The unit of work could not complete its exchange. Displays the innermost
    /// error of the cause chain verbatim; the full chain stays reachable through
    /// `source()`.
    #[error("{}", root_cause(.cause.as_ref()))]
    Transport {
        iteration: usize,
        #[source]
        cause: BoxError,
    },
    #[error("iteration: {iteration}, unexpected result status: {status}, body: {body:?}")]
    UnexpectedResult {
        iteration: usize,
        status: u16,
        body: String,
    },
    #[error("iteration: {iteration} panicked")]
    Panicked { iteration: usize },
    #[error("failed to serve: {0}")]
    Serve(io::Error),
    #[error("failed to shutdown test server: {0}")]
    Shutdown(String),
    #[error("Networking error - {0}")]
    Io(#[from] io::Error),
}

impl BenchError {
    pub fn transport<E>(iteration: usize, cause: E) -> Self
    where
        E: Into<BoxError>,
    {
        Self::Transport {
            iteration,
            cause: cause.into(),
        }
    }

    /// Builds a validation failure, keeping at most `limit` bytes of the body.
    pub fn unexpected(iteration: usize, status: u16, body: &[u8], limit: usize) -> Self {
        Self::UnexpectedResult {
            iteration,
            status,
            body: body_preview(body, limit),
        }
    }

    /// Iteration index the error is attributed to, if any.
    pub fn iteration(&self) -> Option<usize> {
        match self {
            Self::Transport { iteration, .. }
            | Self::UnexpectedResult { iteration, .. }
            | Self::Panicked { iteration } => Some(*iteration),
            _ => None,
        }
    }
}

/// Innermost error of a source chain, e.g. the OS error below hyper's
/// `client error (Connect)`.
pub(crate) fn root_cause<'a>(err: &'a (dyn StdError + 'static)) -> &'a (dyn StdError + 'static) {
    let mut current = err;
    while let Some(next) = current.source() {
        current = next;
    }
    current
}

fn render_attempts(attempts: &[(SocketAddr, io::Error)]) -> String {
    attempts
        .iter()
        .map(|(addr, err)| format!("{addr}: {err}"))
        .collect::<Vec<_>>()
        .join(", ")
}

pub(crate) fn body_preview(body: &[u8], limit: usize) -> String {
    if body.len() <= limit {
        return String::from_utf8_lossy(body).into_owned();
    }
    format!("{}...", String::from_utf8_lossy(&body[..limit]))
}
