use std::error::Error;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

static FORCE_BACKTRACES: AtomicBool = AtomicBool::new(false);

/// Forces backtrace printing on, regardless of `RUST_BACKTRACE`.
pub fn force_backtraces() {
    FORCE_BACKTRACES.store(true, Ordering::Relaxed);
}

/// Returns `true` if backtrace printing is enabled.
pub fn backtrace_enabled() -> bool {
    FORCE_BACKTRACES.load(Ordering::Relaxed)
        || matches!(
            std::env::var("RUST_BACKTRACE").as_deref(),
            Ok("1") | Ok("full")
        )
}

/// Logs an error to the configured logger or `stderr` if not yet configured.
///
/// Prefer [`appstats_log::error`](crate::error) whenever possible. This function is intended for
/// startup, where errors may need to be reported before the logger has been initialized.
///
/// # Example
///
/// ```
/// if let Err(error) = std::env::var("FOO") {
///     appstats_log::ensure_error(&error);
/// }
/// ```
pub fn ensure_error<E: AsRef<dyn Error>>(error: E) {
    if tracing::event_enabled!(tracing::Level::ERROR) {
        tracing::error!("{}", LogError(error.as_ref()));
    } else {
        #[allow(clippy::print_stderr)]
        {
            eprintln!("error: {}", LogError(error.as_ref()));
        }
    }
}

/// A wrapper around an error that prints its causes.
///
/// # Example
///
/// ```
/// use appstats_log::LogError;
///
/// if let Err(error) = std::env::var("FOO") {
///     appstats_log::error!("env failed: {}", LogError(&error));
/// }
/// ```
pub struct LogError<'a, E: Error + ?Sized>(pub &'a E);

impl<E: Error + ?Sized> fmt::Display for LogError<'_, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)?;

        let mut source = self.0.source();
        while let Some(s) = source {
            write!(f, "\n  caused by: {s}")?;
            source = s.source();
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Outer(std::io::Error);

    impl fmt::Display for Outer {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("could not write rollup")
        }
    }

    impl Error for Outer {
        fn source(&self) -> Option<&(dyn Error + 'static)> {
            Some(&self.0)
        }
    }

    #[test]
    fn test_log_error_prints_causes() {
        let error = Outer(std::io::Error::other("disk full"));
        assert_eq!(
            LogError(&error).to_string(),
            "could not write rollup\n  caused by: disk full"
        );
    }
}
