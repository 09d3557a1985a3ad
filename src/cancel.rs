use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
};

use crate::error::Error;

/// Flag to interrupt a running operation.
///
/// Clones share the same flag. Transfers check it between chunks, and
/// an interrupted operation does not commit anything to the index.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<Inner>);

#[derive(Debug, Default)]
struct Inner {
    cancelled: AtomicBool,
    parent: Option<CancelToken>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a token that is cancelled when either itself or this
    /// token is cancelled.
    pub fn child(&self) -> CancelToken {
        CancelToken(Arc::new(Inner {
            cancelled: AtomicBool::new(false),
            parent: Some(self.clone()),
        }))
    }

    pub fn cancel(&self) {
        self.0.cancelled.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.cancelled.load(Ordering::Relaxed)
            || self.0.parent.as_ref().is_some_and(|p| p.is_cancelled())
    }

    /// Return [`Error::Interrupted`] if the token is cancelled.
    pub fn check(&self) -> Result<(), Error> {
        if self.is_cancelled() {
            Err(Error::Interrupted)
        } else {
            Ok(())
        }
    }
}

/// Cancel the token if the thread panics while this instance is alive.
pub(crate) struct CancelOnPanic<'a>(pub &'a CancelToken);

impl Drop for CancelOnPanic<'_> {
    fn drop(&mut self) {
        if thread::panicking() {
            self.0.cancel();
        }
    }
}

#[test]
fn shared_flag() {
    let token = CancelToken::new();
    let clone = token.clone();

    assert!(token.check().is_ok());

    clone.cancel();
    assert!(token.is_cancelled());
    assert!(matches!(token.check(), Err(Error::Interrupted)));
}

#[test]
fn cancel_on_panic() {
    let token = CancelToken::new();

    drop(CancelOnPanic(&token));
    assert!(!token.is_cancelled());

    let result = thread::scope(|scope| {
        scope
            .spawn(|| {
                let _guard = CancelOnPanic(&token);
                panic!("worker failed");
            })
            .join()
    });

    assert!(result.is_err());
    assert!(token.is_cancelled());
}

#[test]
fn child_tokens() {
    let parent = CancelToken::new();
    let a = parent.child();
    let b = parent.child();

    a.cancel();
    assert!(a.is_cancelled());
    assert!(!b.is_cancelled());
    assert!(!parent.is_cancelled());

    parent.cancel();
    assert!(b.is_cancelled());
}
