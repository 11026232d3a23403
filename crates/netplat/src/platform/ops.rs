//! Pending operation bookkeeping.

use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::netlink::error::{Error, Result, Status};
use crate::object::{PlatformObject, RequestAction};
use crate::transport::Token;

/// What [`Platform::apply`](super::Platform::apply) should achieve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum ApplyMode {
    /// Create the object, or bring an existing one in line with it.
    Add,
    /// Remove the object. Removing an absent object succeeds.
    Delete,
}

/// Final state of an operation.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum OperationOutcome {
    /// The kernel acked and the cache now holds this snapshot.
    Confirmed(PlatformObject),
    /// The cache already satisfied the request; nothing was sent.
    Unchanged(PlatformObject),
    /// The kernel acked the removal and the cache no longer holds it.
    Deleted,
    /// The object did not exist.
    AlreadyAbsent,
    /// The kernel acked but no matching notification arrived in time.
    /// The request is not rolled back.
    Unconfirmed,
    /// The owning interface disappeared while the request was in flight.
    Abandoned,
}

impl OperationOutcome {
    pub fn status(&self) -> Status {
        match self {
            OperationOutcome::Confirmed(_)
            | OperationOutcome::Unchanged(_)
            | OperationOutcome::Deleted
            | OperationOutcome::AlreadyAbsent => Status::Success,
            OperationOutcome::Unconfirmed => Status::Timeout,
            OperationOutcome::Abandoned => Status::NotFound,
        }
    }

    /// The cached snapshot for outcomes that carry one.
    pub fn object(&self) -> Option<&PlatformObject> {
        match self {
            OperationOutcome::Confirmed(o) | OperationOutcome::Unchanged(o) => Some(o),
            _ => None,
        }
    }
}

/// Identifies a submitted operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OpId(pub(crate) u64);

/// Caller side of a submitted operation.
///
/// The outcome is filled in while the platform is driven; see
/// [`Platform::wait`](super::Platform::wait).
#[derive(Debug)]
pub struct OpHandle {
    pub(crate) id: OpId,
    pub(crate) rx: oneshot::Receiver<Result<OperationOutcome>>,
}

impl OpHandle {
    pub fn id(&self) -> OpId {
        self.id
    }

    /// The outcome, if the operation has finished.
    pub fn try_outcome(&mut self) -> Option<Result<OperationOutcome>> {
        match self.rx.try_recv() {
            Ok(outcome) => Some(outcome),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Ok(OperationOutcome::Abandoned)),
        }
    }
}

/// One request of an operation's plan.
#[derive(Debug, Clone)]
pub(crate) struct Step {
    pub object: PlatformObject,
    pub action: RequestAction,
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum OpState {
    /// Next step is ready to go out.
    Queued,
    /// Waiting for the kernel to answer `token`.
    Submitted { token: Token, deadline: Instant },
    /// A transient failure; resend the step at `until`.
    Backoff { until: Instant },
    /// Every step acked; waiting for the cache to reflect the change.
    Acked { deadline: Instant },
}

#[derive(Debug)]
pub(crate) struct Op {
    pub id: OpId,
    pub desired: PlatformObject,
    pub mode: ApplyMode,
    /// Steps not yet acked, front first.
    pub steps: Vec<Step>,
    pub state: OpState,
    /// Retries spent on the current step.
    pub attempt: u32,
    tx: Option<oneshot::Sender<Result<OperationOutcome>>>,
}

impl Op {
    pub fn new(id: OpId, desired: PlatformObject, mode: ApplyMode, mut steps: Vec<Step>) -> (Self, OpHandle) {
        let (tx, rx) = oneshot::channel();
        steps.reverse();
        let op = Op {
            id,
            desired,
            mode,
            steps,
            state: OpState::Queued,
            attempt: 0,
            tx: Some(tx),
        };
        (op, OpHandle { id, rx })
    }

    /// A handle that is already finished.
    pub fn finished(id: OpId, outcome: Result<OperationOutcome>) -> OpHandle {
        let (tx, rx) = oneshot::channel();
        // The receiver is alive; a send cannot fail.
        let _ = tx.send(outcome);
        OpHandle { id, rx }
    }

    pub fn current(&self) -> Option<&Step> {
        self.steps.last()
    }

    /// Move past the acked step. Returns whether more steps remain.
    pub fn advance(&mut self) -> bool {
        self.steps.pop();
        self.attempt = 0;
        !self.steps.is_empty()
    }

    pub fn token(&self) -> Option<Token> {
        match self.state {
            OpState::Submitted { token, .. } => Some(token),
            _ => None,
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        match self.state {
            OpState::Queued => None,
            OpState::Submitted { deadline, .. } | OpState::Acked { deadline } => Some(deadline),
            OpState::Backoff { until } => Some(until),
        }
    }

    /// The interface the operation depends on, if it is not the link itself.
    pub fn target_ifindex(&self) -> Option<u32> {
        match &self.desired {
            PlatformObject::Link(_) => None,
            other => other.ifindex(),
        }
    }

    pub fn describe(&self) -> String {
        let verb = match self.mode {
            ApplyMode::Add => "add",
            ApplyMode::Delete => "delete",
        };
        format!("{} {}", verb, self.desired)
    }

    pub fn finish(mut self, outcome: Result<OperationOutcome>) {
        if let Some(tx) = self.tx.take() {
            // The caller may have dropped the handle.
            let _ = tx.send(outcome);
        }
    }

    pub fn fail(self, error: Error) {
        self.finish(Err(error))
    }
}
