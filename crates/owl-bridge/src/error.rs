//! Error taxonomy for boundary crossings.
//!
//! Every recoverable failure the bridge can observe maps onto one of these
//! variants. The foreign-side diagnostic text is preserved verbatim; the
//! bridge never swallows or rewrites it. Programmer errors (double release,
//! provider-loop death) are not represented here — those fail loudly via
//! panics by design.

/// A failure observed while crossing into or decoding from the host runtime.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// A handle-producing operation received a null foreign reference where
    /// presence is mandatory.
    #[error("null foreign reference: {context}")]
    NullReference {
        /// What was being decoded or acquired.
        context: &'static str,
    },

    /// A decoded value's concrete foreign type does not match the expected
    /// native wrapper or shape.
    #[error("foreign type mismatch: expected {expected}, got {actual}")]
    TypeMismatch { expected: String, actual: String },

    /// A failure was pending on the foreign side after a call. The
    /// description is the host's own diagnostic, verbatim.
    #[error("foreign failure: {0}")]
    ForeignFailure(String),

    /// Class or member lookup failed at bind time. Non-recoverable when it
    /// happens for the fixed operation set during session attach.
    #[error("failed to resolve {class}.{member}{signature}: {detail}")]
    ResolutionFailure {
        class: String,
        member: String,
        signature: String,
        detail: String,
    },
}

pub type Result<T> = std::result::Result<T, BridgeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages_preserve_foreign_diagnostics() {
        let err = BridgeError::ForeignFailure("owl.ltl.ParseException: unexpected token".into());

        assert_eq!(
            err.to_string(),
            "foreign failure: owl.ltl.ParseException: unexpected token"
        );
    }

    #[test]
    fn test_resolution_failure_names_the_member() {
        let err = BridgeError::ResolutionFailure {
            class: "owl/ltl/Literal".into(),
            member: "create".into(),
            signature: "(IZ)Lowl/ltl/Literal;".into(),
            detail: "no such member".into(),
        };

        let text = err.to_string();
        assert!(text.contains("owl/ltl/Literal.create(IZ)Lowl/ltl/Literal;"));
        assert!(text.contains("no such member"));
    }

    #[test]
    fn test_errors_are_send_and_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<BridgeError>();
    }
}
