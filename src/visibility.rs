/// SQS rejects visibility timeouts of 12 hours or more, so any requested
/// value is kept strictly below this many seconds.
pub const SQS_MAX_VISIBILITY_TIMEOUT: u64 = 12 * 60 * 60;

/// Configured bounds for releasing a message back onto the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VisibilityBounds {
    /// Minimum visibility timeout allowed, in seconds.
    pub min: u64,

    /// Maximum visibility timeout allowed, in seconds.
    pub max: u64,
}

impl Default for VisibilityBounds {
    fn default() -> Self {
        VisibilityBounds {
            min: 10,
            max: SQS_MAX_VISIBILITY_TIMEOUT,
        }
    }
}

/// Clamps a requested visibility timeout.
///
/// The configured `[min, max]` bounds are applied first; the SQS ceiling is
/// applied last and always wins, so the result is never above
/// `SQS_MAX_VISIBILITY_TIMEOUT - 1` even when `max` is misconfigured.
pub fn clamp_visibility(requested: u64, bounds: VisibilityBounds) -> u64 {
    let mut secs = requested;

    if secs < bounds.min {
        secs = bounds.min;
    }

    if secs > bounds.max {
        secs = bounds.max;
    }

    if secs >= SQS_MAX_VISIBILITY_TIMEOUT {
        secs = SQS_MAX_VISIBILITY_TIMEOUT - 1;
    }

    secs
}
