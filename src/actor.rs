use act_zero::ActorError;
use tracing::error;
use tracing_error::SpanTrace;

/// Error returned from actor methods. Fatal errors stop the actor, non fatal
/// ones are logged and the actor keeps processing its mailbox.
#[derive(Debug, thiserror::Error)]
#[error("{source}")]
pub struct Error {
    source: ErrorKind,
    span_trace: SpanTrace,
}

#[derive(Debug, thiserror::Error)]
pub enum ErrorKind {
    #[error(transparent)]
    Fatal(anyhow::Error),
    #[error(transparent)]
    NonFatal(#[from] anyhow::Error),
}

impl Error {
    pub fn fatal(source: anyhow::Error) -> Self {
        Self {
            source: ErrorKind::Fatal(source),
            span_trace: SpanTrace::capture(),
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self.source, ErrorKind::Fatal(_))
    }
}

impl<E> From<E> for Error
where
    ErrorKind: From<E>,
{
    fn from(source: E) -> Self {
        Self {
            source: ErrorKind::from(source),
            span_trace: SpanTrace::capture(),
        }
    }
}

/// Logs an actor error and decides whether the actor has to stop.
pub fn handle_error(error: ActorError) -> bool {
    let (error, stop_actor, span_trace) = match error.downcast_ref::<Error>() {
        Some(e) => (
            format!("{:?}", e.source),
            e.is_fatal(),
            Some(&e.span_trace),
        ),
        None => (format!("{:?}", error), false, None),
    };

    error!(
        %stop_actor,
        "ActorError: {} SpanTrace: {}",
        error,
        span_trace
            .map(|st| format!("{}", st))
            .unwrap_or_else(|| String::from("None"))
    );

    stop_actor
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn test_only_fatal_errors_stop_the_actor() {
        let non_fatal: ActorError = Box::new(Error::from(anyhow!("gateway unavailable")));
        let fatal: ActorError = Box::new(Error::fatal(anyhow!("pipeline poisoned")));
        let foreign: ActorError = "plain".into();

        assert!(!handle_error(non_fatal));
        assert!(handle_error(fatal));
        assert!(!handle_error(foreign));
    }
}
