//! Wall-clock timing of layers and whole builds.

use std::time::{Duration, Instant};

/// Logs how long one unit of work took once finished.
pub struct Timer {
    what: String,
    start: Instant,
}

impl Timer {
    pub fn start(what: impl Into<String>) -> Self {
        let what = what.into();
        tracing::debug!("{} started", what);
        Self {
            what,
            start: Instant::now(),
        }
    }

    /// Log the elapsed time and return it.
    pub fn finish(self) -> Duration {
        let elapsed = self.start.elapsed();
        tracing::info!("{} finished in {}", self.what, format_elapsed(elapsed));
        elapsed
    }
}

/// `42.0s` below a minute, `3m 05s` above.
pub fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    if secs < 60 {
        format!("{:.1}s", elapsed.as_secs_f64())
    } else {
        format!("{}m {:02}s", secs / 60, secs % 60)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_elapsed() {
        assert_eq!(format_elapsed(Duration::from_millis(4200)), "4.2s");
        assert_eq!(format_elapsed(Duration::from_secs(185)), "3m 05s");
    }
}
