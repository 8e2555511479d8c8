//! One-shot host bootstrap parameters.

/// Parameters passed once at host-runtime construction.
///
/// These are immutable after the host is built; there is deliberately no way
/// to change the classpath or memory limits of a running host.
#[derive(Debug, Clone, Default)]
pub struct VmOptions {
    /// Library search path entries handed to the host class loader.
    pub classpath: Vec<String>,
    /// Enables host-side debug assertions and verbose diagnostics.
    pub debug_assertions: bool,
    /// Initial heap/arena size in mebibytes, host default when `None`.
    pub initial_heap_mb: Option<u32>,
    /// Maximum heap/arena size in mebibytes, host default when `None`.
    pub max_heap_mb: Option<u32>,
    /// Trades throughput for a smaller resident footprint.
    pub aggressive_reclaim: bool,
}

impl VmOptions {
    #[must_use]
    pub fn with_classpath<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            classpath: entries.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options_have_empty_classpath() {
        let options = VmOptions::default();

        assert!(options.classpath.is_empty());
        assert!(!options.debug_assertions);
        assert!(options.initial_heap_mb.is_none());
        assert!(options.max_heap_mb.is_none());
        assert!(!options.aggressive_reclaim);
    }

    #[test]
    fn test_with_classpath_collects_entries() {
        let options = VmOptions::with_classpath(["lib/owl.jar", "lib/parser.jar"]);

        assert_eq!(options.classpath, vec!["lib/owl.jar", "lib/parser.jar"]);
    }
}
