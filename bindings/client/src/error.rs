use flowcheck_core::prelude::{ContextDone, ConvergenceTimeout};

const MAX_BODY_IN_ERROR: usize = 500;

/// A payload from the system under test that did not have the expected shape.
#[derive(Debug, thiserror::Error)]
#[error("could not decode {target}: {source} (body: {body})")]
pub struct DecodeError {
    pub target: &'static str,
    pub body: String,
    #[source]
    pub source: serde_json::Error,
}

impl DecodeError {
    pub fn new(target: &'static str, body: &str, source: serde_json::Error) -> Self {
        Self {
            target,
            body: clip(body),
            source,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("invalid URL: {0}")]
    Url(#[from] url::ParseError),
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
    #[error("CLI process: {0}")]
    Process(String),
    #[error("interrupted: {0}")]
    Interrupted(#[from] ContextDone),
    #[error(transparent)]
    Timeout(#[from] ConvergenceTimeout),
}

impl ClientError {
    pub(crate) fn status(status: u16, body: &str) -> Self {
        ClientError::Status {
            status,
            body: clip(body),
        }
    }

    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        ClientError::Io {
            context: context.into(),
            source,
        }
    }

    /// The HTTP status if the server answered with an error status.
    pub fn http_status(&self) -> Option<u16> {
        match self {
            ClientError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.http_status() == Some(404)
    }
}

fn clip(body: &str) -> String {
    if body.len() <= MAX_BODY_IN_ERROR {
        return body.to_string();
    }

    let mut end = MAX_BODY_IN_ERROR;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &body[..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn long_bodies_are_clipped() {
        let body = "é".repeat(400);
        let err = ClientError::status(500, &body);

        match err {
            ClientError::Status { body, .. } => {
                assert!(body.ends_with("..."));
                assert!(body.len() <= MAX_BODY_IN_ERROR + 3);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn not_found_is_recognised() {
        assert!(ClientError::status(404, "no such plan").is_not_found());
        assert!(!ClientError::status(422, "needs changes").is_not_found());
        assert_eq!(
            "HTTP 404: no such plan",
            ClientError::status(404, "no such plan").to_string()
        );
    }
}
