use thiserror::Error;

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("io error: {0}")]
    Io(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("config parse error: {0}")]
    ConfigParse(String),
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("cli error: {0}")]
    Cli(String),
    #[error("process error: {0}")]
    Process(String),
    #[error("bus error: {0}")]
    Bus(String),
    #[error("journal error: {0}")]
    Journal(String),
    #[error("assertion failed: {0}")]
    Assertion(String),
    #[error("skipped: {0}")]
    Skipped(String),
    #[error("{original} (cleanup also failed: {})", cleanup.join("; "))]
    Cleanup {
        original: Box<HarnessError>,
        cleanup: Vec<String>,
    },
}

impl HarnessError {
    /// The failure that started an unwind, looking through cleanup wrappers.
    pub fn root(&self) -> &HarnessError {
        match self {
            Self::Cleanup { original, .. } => original.root(),
            other => other,
        }
    }

    pub fn is_skip(&self) -> bool {
        matches!(self.root(), Self::Skipped(_))
    }

    /// Attaches cleanup failure summaries, keeping `self` as the original.
    pub fn with_cleanup_failures(self, failures: Vec<String>) -> Self {
        if failures.is_empty() {
            return self;
        }
        match self {
            Self::Cleanup {
                original,
                mut cleanup,
            } => {
                cleanup.extend(failures);
                Self::Cleanup { original, cleanup }
            }
            original => Self::Cleanup {
                original: Box::new(original),
                cleanup: failures,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::HarnessError;

    #[test]
    fn cleanup_error_leads_with_original_failure() {
        let err = HarnessError::Cleanup {
            original: Box::new(HarnessError::Assertion("5 != 6".to_string())),
            cleanup: vec!["journal: boom".to_string(), "udevadm: gone".to_string()],
        };
        assert_eq!(
            err.to_string(),
            "assertion failed: 5 != 6 (cleanup also failed: journal: boom; udevadm: gone)"
        );
        assert!(matches!(err.root(), HarnessError::Assertion(_)));
    }

    #[test]
    fn skip_is_seen_through_cleanup_wrapper() {
        let err = HarnessError::Cleanup {
            original: Box::new(HarnessError::Skipped("no lvm".to_string())),
            cleanup: vec![],
        };
        assert!(err.is_skip());
        assert!(!HarnessError::Bus("x".to_string()).is_skip());
    }

    #[test]
    fn cleanup_failures_accumulate_on_one_wrapper() {
        let plain = HarnessError::Bus("gone".to_string()).with_cleanup_failures(Vec::new());
        assert!(matches!(plain, HarnessError::Bus(_)));

        let err = HarnessError::Bus("gone".to_string())
            .with_cleanup_failures(vec!["journal: a".to_string()])
            .with_cleanup_failures(vec!["flight record: b".to_string()]);
        assert_eq!(
            err.to_string(),
            "bus error: gone (cleanup also failed: journal: a; flight record: b)"
        );
    }
}
