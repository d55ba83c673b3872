//! Mirror fallback for network-dependent operations.
//!
//! Candidates are tried strictly in the order given. The first success wins
//! and no further endpoint is contacted; when every endpoint fails the error
//! of the *last* attempt is surfaced. Nothing about individual attempts is
//! persisted, so a retried step walks the whole list again from the top.

use anyhow::Result;
use thiserror::Error;

use crate::cancel::CancelToken;
use crate::events::{BuildEvent, EventSink};

#[derive(Debug, Error)]
pub enum MirrorError {
    #[error("no mirrors configured")]
    Empty,
    #[error("all {attempts} mirrors failed; last ({mirror}): {source:#}")]
    Exhausted {
        attempts: usize,
        mirror: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("mirror selection cancelled before trying {mirror}")]
    Cancelled { mirror: String },
}

/// Successful result together with the endpoint that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirrorSuccess<T> {
    pub mirror: String,
    pub value: T,
}

pub struct MirrorSelector<'a> {
    mirrors: Vec<String>,
    events: &'a dyn EventSink,
    cancel: Option<&'a CancelToken>,
}

impl<'a> MirrorSelector<'a> {
    pub fn new<I, S>(mirrors: I, events: &'a dyn EventSink) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            mirrors: mirrors.into_iter().map(Into::into).collect(),
            events,
            cancel: None,
        }
    }

    pub fn with_cancel(mut self, token: &'a CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn mirrors(&self) -> &[String] {
        &self.mirrors
    }

    /// Run `op` against each mirror until one succeeds.
    pub fn run<T, F>(&self, mut op: F) -> Result<MirrorSuccess<T>, MirrorError>
    where
        F: FnMut(&str) -> Result<T>,
    {
        let total = self.mirrors.len();
        let mut last: Option<(String, anyhow::Error)> = None;

        for (idx, mirror) in self.mirrors.iter().enumerate() {
            if self.cancel.is_some_and(CancelToken::is_cancelled) {
                return Err(MirrorError::Cancelled {
                    mirror: mirror.clone(),
                });
            }

            self.events.emit(BuildEvent::MirrorAttempt {
                mirror: mirror.clone(),
                attempt: idx + 1,
                total,
            });

            match op(mirror) {
                Ok(value) => {
                    return Ok(MirrorSuccess {
                        mirror: mirror.clone(),
                        value,
                    })
                }
                Err(err) => {
                    self.events.emit(BuildEvent::MirrorFailed {
                        mirror: mirror.clone(),
                        error: format!("{err:#}"),
                    });
                    last = Some((mirror.clone(), err));
                }
            }
        }

        match last {
            Some((mirror, source)) => Err(MirrorError::Exhausted {
                attempts: total,
                mirror,
                source,
            }),
            None => Err(MirrorError::Empty),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::bail;
    use std::cell::RefCell;

    struct NullSink;

    impl EventSink for NullSink {
        fn emit(&self, _event: BuildEvent) {}
    }

    #[test]
    fn test_first_success_stops_iteration() {
        let tried = RefCell::new(Vec::new());
        let selector = MirrorSelector::new(["a", "b", "c"], &NullSink);

        let result = selector
            .run(|m| {
                tried.borrow_mut().push(m.to_string());
                if m == "a" {
                    bail!("a is down");
                }
                Ok(format!("rootfs from {m}"))
            })
            .unwrap();

        assert_eq!(result.mirror, "b");
        assert_eq!(result.value, "rootfs from b");
        assert_eq!(*tried.borrow(), vec!["a", "b"]);
    }

    #[test]
    fn test_exhaustion_reports_last_error() {
        let selector = MirrorSelector::new(["a", "b"], &NullSink);
        let err = selector
            .run::<(), _>(|m| bail!("{m} unreachable"))
            .unwrap_err();

        match err {
            MirrorError::Exhausted {
                attempts,
                mirror,
                source,
            } => {
                assert_eq!(attempts, 2);
                assert_eq!(mirror, "b");
                assert_eq!(source.to_string(), "b unreachable");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_empty_list() {
        let selector = MirrorSelector::new(Vec::<String>::new(), &NullSink);
        assert!(matches!(
            selector.run(|_| Ok(())),
            Err(MirrorError::Empty)
        ));
    }

    #[test]
    fn test_events_follow_priority_order() {
        let events = RefCell::new(Vec::new());
        let sink = |e: &BuildEvent| events.borrow_mut().push(e.clone());
        let selector = MirrorSelector::new(["a", "b"], &sink);
        let _ = selector.run::<(), _>(|m| bail!("{m} down"));

        let attempts: Vec<_> = events
            .borrow()
            .iter()
            .filter_map(|e| match e {
                BuildEvent::MirrorAttempt { mirror, attempt, .. } => {
                    Some((mirror.clone(), *attempt))
                }
                _ => None,
            })
            .collect();
        assert_eq!(attempts, vec![("a".into(), 1), ("b".into(), 2)]);
    }

    #[test]
    fn test_cancel_stops_before_next_attempt() {
        let token = CancelToken::new();
        let selector = MirrorSelector::new(["a", "b"], &NullSink).with_cancel(&token);
        let err = selector
            .run::<(), _>(|m| {
                token.cancel();
                bail!("{m} down")
            })
            .unwrap_err();
        assert!(matches!(err, MirrorError::Cancelled { ref mirror } if mirror == "b"));
    }
}
