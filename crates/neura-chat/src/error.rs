//! Error types for the chat session.

use neura_core::error::NeuraError;

/// Errors from a chat turn or session.
///
/// Everything except `ConfigurationFatal` and `SessionClosed` aborts only the
/// current turn; the session keeps accepting input.
#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("template error: {0}")]
    Template(String),
    #[error("encode error: {0}")]
    Encode(String),
    #[error("context exhausted: {used} used + {pending} pending reaches capacity {capacity}")]
    ContextExhausted {
        used: usize,
        pending: usize,
        capacity: usize,
    },
    #[error("engine error: {0}")]
    Engine(String),
    #[error("generation cancelled")]
    Cancelled,
    #[error("configuration error: {0}")]
    ConfigurationFatal(String),
    #[error("session is closed")]
    SessionClosed,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ChatError {
    /// Whether the session can keep taking turns after this error.
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            ChatError::ConfigurationFatal(_) | ChatError::SessionClosed
        )
    }
}

impl From<NeuraError> for ChatError {
    fn from(err: NeuraError) -> Self {
        match err {
            NeuraError::Template(msg) => ChatError::Template(msg),
            NeuraError::Encode(msg) => ChatError::Encode(msg),
            NeuraError::Inference(msg) => ChatError::Engine(msg),
            NeuraError::Config(msg) | NeuraError::ModelLoad(msg) => {
                ChatError::ConfigurationFatal(msg)
            }
            NeuraError::Io(e) => ChatError::Io(e),
            other => ChatError::Engine(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chat_error_display() {
        assert_eq!(
            ChatError::Template("bad".to_string()).to_string(),
            "template error: bad"
        );
        assert_eq!(
            ChatError::Encode("nul".to_string()).to_string(),
            "encode error: nul"
        );
        assert_eq!(
            ChatError::ContextExhausted {
                used: 8,
                pending: 2,
                capacity: 10
            }
            .to_string(),
            "context exhausted: 8 used + 2 pending reaches capacity 10"
        );
        assert_eq!(
            ChatError::Engine("decode".to_string()).to_string(),
            "engine error: decode"
        );
        assert_eq!(ChatError::Cancelled.to_string(), "generation cancelled");
        assert_eq!(ChatError::SessionClosed.to_string(), "session is closed");
    }

    #[test]
    fn test_from_neura_error_mapping() {
        let err: ChatError = NeuraError::Template("t".into()).into();
        assert!(matches!(err, ChatError::Template(_)));

        let err: ChatError = NeuraError::Encode("e".into()).into();
        assert!(matches!(err, ChatError::Encode(_)));

        let err: ChatError = NeuraError::Inference("i".into()).into();
        assert!(matches!(err, ChatError::Engine(_)));

        let err: ChatError = NeuraError::ModelLoad("m".into()).into();
        assert!(matches!(err, ChatError::ConfigurationFatal(_)));

        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe");
        let err: ChatError = NeuraError::Io(io).into();
        assert!(matches!(err, ChatError::Io(_)));
    }

    #[test]
    fn test_recoverability() {
        assert!(ChatError::Template(String::new()).is_recoverable());
        assert!(ChatError::Encode(String::new()).is_recoverable());
        assert!(ChatError::Engine(String::new()).is_recoverable());
        assert!(ChatError::Cancelled.is_recoverable());
        assert!(ChatError::ContextExhausted {
            used: 0,
            pending: 0,
            capacity: 0
        }
        .is_recoverable());
        assert!(!ChatError::ConfigurationFatal(String::new()).is_recoverable());
        assert!(!ChatError::SessionClosed.is_recoverable());
    }
}
