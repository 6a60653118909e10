//! One-shot completion signals for pending instructions.

use tokio::sync::watch;

use crate::error::{ConnectorError, Result};

type Outcome = Option<Result<()>>;

/// Awaitable side of a completion source. Cheap to clone; every clone observes
/// the same outcome.
#[derive(Clone, Debug)]
pub struct Completion {
    rx: watch::Receiver<Outcome>,
}

impl Completion {
    /// Resolves with the outcome, or `Cancelled` if the source went away first.
    pub async fn wait(&self) -> Result<()> {
        let mut rx = self.rx.clone();
        let outcome = match rx.wait_for(Option::is_some).await {
            Ok(outcome) => outcome.clone(),
            Err(_) => return Err(ConnectorError::Cancelled),
        };
        outcome.unwrap_or(Err(ConnectorError::Cancelled))
    }

    pub fn try_outcome(&self) -> Option<Result<()>> {
        self.rx.borrow().clone()
    }

    pub fn is_completed(&self) -> bool {
        self.rx.borrow().is_some()
    }
}

/// Completes after `count` signals; faults are collected and reported together.
#[derive(Debug)]
pub struct CountdownCompletionSource {
    count: usize,
    signalled: usize,
    errors: Vec<ConnectorError>,
    tx: watch::Sender<Outcome>,
}

impl CountdownCompletionSource {
    pub fn new(count: usize) -> Result<Self> {
        if count == 0 {
            return Err(ConnectorError::invalid_argument(
                "countdown must be greater than 0",
            ));
        }
        let (tx, _) = watch::channel(None);
        Ok(Self {
            count,
            signalled: 0,
            errors: Vec::new(),
            tx,
        })
    }

    pub fn completion(&self) -> Completion {
        Completion {
            rx: self.tx.subscribe(),
        }
    }

    pub fn is_completed(&self) -> bool {
        self.tx.borrow().is_some()
    }

    pub fn count(&self) -> usize {
        self.count
    }

    /// Returns `true` when this signal completed the countdown.
    pub fn signal_success(&mut self) -> bool {
        if self.is_completed() {
            return false;
        }
        self.signalled += 1;
        self.complete_if_done()
    }

    /// Records a fault; returns `true` when this signal completed the countdown.
    pub fn signal_fault(&mut self, error: ConnectorError) -> bool {
        if self.is_completed() {
            return false;
        }
        self.signalled += 1;
        self.errors.push(error);
        self.complete_if_done()
    }

    /// Completes immediately with `error`.
    pub fn fault(&mut self, error: ConnectorError) -> bool {
        if self.is_completed() {
            return false;
        }
        self.errors.push(error);
        self.finish();
        true
    }

    fn complete_if_done(&mut self) -> bool {
        if self.signalled < self.count {
            return false;
        }
        self.finish();
        true
    }

    fn finish(&mut self) {
        let outcome = match self.errors.len() {
            0 => Ok(()),
            1 => Err(self.errors.remove(0)),
            _ => Err(ConnectorError::Aggregate(std::mem::take(&mut self.errors))),
        };
        self.tx.send_replace(Some(outcome));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_count_is_rejected() {
        assert!(CountdownCompletionSource::new(0).is_err());
    }

    #[tokio::test]
    async fn completes_after_all_successes() {
        let mut source = CountdownCompletionSource::new(3).expect("source");
        let completion = source.completion();
        assert!(!source.signal_success());
        assert!(!source.signal_success());
        assert!(!completion.is_completed());
        assert!(source.signal_success());
        assert_eq!(completion.wait().await, Ok(()));
        assert!(!source.signal_success());
    }

    #[tokio::test]
    async fn aggregates_faults_at_the_end() {
        let mut source = CountdownCompletionSource::new(3).expect("source");
        let completion = source.completion();
        assert!(!source.signal_fault(ConnectorError::timeout("a")));
        assert!(!source.signal_success());
        assert!(source.signal_fault(ConnectorError::timeout("b")));
        match completion.wait().await {
            Err(ConnectorError::Aggregate(errors)) => assert_eq!(errors.len(), 2),
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[tokio::test]
    async fn fault_completes_immediately_once() {
        let mut source = CountdownCompletionSource::new(2).expect("source");
        let completion = source.completion();
        assert!(source.fault(ConnectorError::unavailable("down")));
        assert!(!source.fault(ConnectorError::unavailable("again")));
        assert!(!source.signal_success());
        assert_eq!(completion.wait().await, Err(ConnectorError::unavailable("down")));
    }

    #[tokio::test]
    async fn dropped_source_reports_cancellation() {
        let source = CountdownCompletionSource::new(1).expect("source");
        let completion = source.completion();
        drop(source);
        assert_eq!(completion.wait().await, Err(ConnectorError::Cancelled));
    }
}
