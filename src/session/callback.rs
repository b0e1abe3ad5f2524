//! Dual result notification
//!
//! Every fallible session operation produces its outcome exactly once and
//! fans it out to two sinks: the optional legacy-style callback first, then
//! the returned future. Both always observe the same value.

use crate::error::SshError;

/// Legacy-style completion callback for an operation resolving to `T`.
///
/// Invoked exactly once, before the operation's future resolves, with a view
/// of the same outcome the future settles with.
pub type Callback<T> = Box<dyn FnOnce(Result<&T, &SshError>) + Send>;

/// Legacy-style connect callback. Receives the connect error, or `None` on
/// success, before the factory future resolves.
pub type ConnectCallback = Box<dyn FnOnce(Option<&SshError>) + Send>;

/// Notify the optional callback, then hand the outcome back for the future.
pub(crate) fn settle<T>(
    result: Result<T, SshError>,
    callback: Option<Callback<T>>,
) -> Result<T, SshError> {
    if let Some(cb) = callback {
        cb(result.as_ref());
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_callback_runs_before_result_returns() {
        let called = Arc::new(AtomicBool::new(false));
        let flag = called.clone();

        let result = settle(
            Ok::<_, SshError>("out".to_string()),
            Some(Box::new(move |r| {
                assert_eq!(r.unwrap(), "out");
                flag.store(true, Ordering::SeqCst);
            })),
        );

        // By the time the result is observable the callback has already run
        assert!(called.load(Ordering::SeqCst));
        assert_eq!(result.unwrap(), "out");
    }

    #[test]
    fn test_callback_sees_same_error() {
        let result = settle::<String>(
            Err(SshError::ChannelError("broken".into())),
            Some(Box::new(|r| {
                assert!(matches!(r, Err(SshError::ChannelError(_))));
            })),
        );
        assert!(matches!(result, Err(SshError::ChannelError(_))));
    }

    #[test]
    fn test_no_callback_is_fine() {
        let result = settle(Ok::<_, SshError>(42u32), None);
        assert_eq!(result.unwrap(), 42);
    }
}
