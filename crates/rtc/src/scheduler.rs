//! The action scheduler driving a membership state machine.
//!
//! A single loop owns a time-sorted list of scheduled actions and a wakeup
//! channel. Each iteration picks the head action, sleeps until its
//! timestamp (racing a wakeup), dispatches it to the handler and merges the
//! returned update back into the list. The loop exits when the list runs
//! dry.

use tokio::sync::mpsc;
use tokio::time::Instant;

/// The kinds of actions the membership state machine schedules.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) enum ActionKind {
    SendDelayedEvent,
    SendJoinEvent,
    RestartDelayedEvent,
    UpdateExpiry,
    SendScheduledDelayedLeaveEvent,
    SendLeaveEvent,
}

impl ActionKind {
    /// A short name for logging.
    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            Self::SendDelayedEvent => "send delayed event",
            Self::SendJoinEvent => "send join event",
            Self::RestartDelayedEvent => "restart delayed event",
            Self::UpdateExpiry => "update expiry",
            Self::SendScheduledDelayedLeaveEvent => "send scheduled delayed leave event",
            Self::SendLeaveEvent => "send leave event",
        }
    }
}

/// An action to run at a given point in time.
#[derive(Clone, Copy, Debug)]
pub(crate) struct ScheduledAction {
    pub ts: Instant,
    pub kind: ActionKind,
}

impl ScheduledAction {
    /// An action due immediately.
    pub fn now(kind: ActionKind) -> Self {
        Self { ts: Instant::now(), kind }
    }

    /// An action due at the given time.
    pub fn at(ts: Instant, kind: ActionKind) -> Self {
        Self { ts, kind }
    }
}

/// What a dispatched handler (or an external wakeup) does to the pending
/// action list.
#[derive(Debug)]
pub(crate) enum ActionUpdate {
    /// Keep the pending actions as they are.
    Unchanged,
    /// Merge these actions additionally.
    Insert(Vec<ScheduledAction>),
    /// Discard all pending actions and substitute these.
    Replace(Vec<ScheduledAction>),
}

/// The pending actions, sorted by timestamp ascending.
///
/// The queue holds at most one action per kind, and `SendDelayedEvent` /
/// `SendJoinEvent` exclude each other: there is never more than one way
/// scheduled to (re)establish the membership.
#[derive(Debug, Default)]
pub(crate) struct ActionQueue {
    actions: Vec<ScheduledAction>,
}

impl ActionQueue {
    pub fn contains(&self, kind: ActionKind) -> bool {
        self.actions.iter().any(|action| action.kind == kind)
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn peek(&self) -> Option<&ScheduledAction> {
        self.actions.first()
    }

    fn pop_front(&mut self) -> Option<ScheduledAction> {
        if self.actions.is_empty() {
            None
        } else {
            Some(self.actions.remove(0))
        }
    }

    /// The pending actions, for handlers that rebuild the list.
    pub fn actions(&self) -> impl Iterator<Item = &ScheduledAction> {
        self.actions.iter()
    }

    fn insert(&mut self, action: ScheduledAction) {
        if self.contains(action.kind) {
            return;
        }
        let connecting = [ActionKind::SendDelayedEvent, ActionKind::SendJoinEvent];
        if connecting.contains(&action.kind)
            && connecting.iter().any(|kind| self.contains(*kind))
        {
            return;
        }

        let position = self
            .actions
            .iter()
            .position(|other| other.ts > action.ts)
            .unwrap_or(self.actions.len());
        self.actions.insert(position, action);
    }

    pub fn apply(&mut self, update: ActionUpdate) {
        match update {
            ActionUpdate::Unchanged => {}
            ActionUpdate::Insert(actions) => {
                for action in actions {
                    self.insert(action);
                }
            }
            ActionUpdate::Replace(actions) => {
                self.actions.clear();
                for action in actions {
                    self.insert(action);
                }
            }
        }
    }
}

/// The connection status derived from the pending action set.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum Status {
    /// The membership is being established.
    Connecting,
    /// The membership is published and kept alive.
    Connected,
    /// The membership is being torn down.
    Disconnecting,
    /// No membership is published and nothing is scheduled.
    Disconnected,
    /// The pending actions do not describe a known state.
    Unknown,
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let status = match self {
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnecting => "disconnecting",
            Self::Disconnected => "disconnected",
            Self::Unknown => "unknown",
        };
        f.write_str(status)
    }
}

/// Derives the externally observable status from the pending action set.
pub(crate) fn derive_status(
    queue: &ActionQueue,
    running: bool,
    has_member_state_event: bool,
) -> Status {
    if !running {
        return Status::Disconnected;
    }
    if queue.contains(ActionKind::SendScheduledDelayedLeaveEvent)
        || queue.contains(ActionKind::SendLeaveEvent)
    {
        return Status::Disconnecting;
    }
    if queue.contains(ActionKind::UpdateExpiry)
        && (queue.contains(ActionKind::RestartDelayedEvent)
            || (queue.contains(ActionKind::SendDelayedEvent) && has_member_state_event))
    {
        return Status::Connected;
    }
    if queue.contains(ActionKind::SendDelayedEvent) || queue.contains(ActionKind::SendJoinEvent) {
        return Status::Connecting;
    }

    error!("pending actions do not map to a known status");
    Status::Unknown
}

/// The state machine driven by the scheduler.
pub(crate) trait ActionHandler {
    /// Dispatch one due action. The dispatched action has already been
    /// removed from `queue`.
    async fn handle(&mut self, kind: ActionKind, queue: &ActionQueue) -> ActionUpdate;

    /// Called after every mutation of the queue, for status derivation.
    fn queue_updated(&mut self, queue: &ActionQueue);
}

/// Posts wakeups into a running scheduler.
#[derive(Clone, Debug)]
pub(crate) struct SchedulerHandle {
    tx: mpsc::UnboundedSender<ActionUpdate>,
}

impl SchedulerHandle {
    /// Restart the join sequence, discarding everything pending.
    pub fn initiate_join(&self) {
        self.post(ActionUpdate::Replace(vec![ScheduledAction::now(
            ActionKind::SendDelayedEvent,
        )]));
    }

    /// Start the leave sequence, discarding everything pending.
    pub fn initiate_leave(&self) {
        self.post(ActionUpdate::Replace(vec![ScheduledAction::now(
            ActionKind::SendScheduledDelayedLeaveEvent,
        )]));
    }

    /// Merge an update into the pending actions.
    pub fn post(&self, update: ActionUpdate) {
        // A closed channel means the loop already exited; the update would
        // not have been observed either way.
        let _ = self.tx.send(update);
    }
}

/// The scheduler loop: a sorted action list plus a wakeup channel.
pub(crate) struct ActionScheduler {
    queue: ActionQueue,
    wakeup: mpsc::UnboundedReceiver<ActionUpdate>,
}

impl ActionScheduler {
    pub fn new() -> (Self, SchedulerHandle) {
        let (tx, wakeup) = mpsc::unbounded_channel();
        (
            Self { queue: ActionQueue::default(), wakeup },
            SchedulerHandle { tx },
        )
    }

    /// Dispatches due actions until the list runs dry.
    ///
    /// The list is normally seeded through
    /// [`SchedulerHandle::initiate_join`] before the loop is entered.
    pub async fn run<H: ActionHandler>(mut self, handler: &mut H) {
        loop {
            // Wakeups posted before the loop started (or while an action
            // was dispatched) are level triggered; apply them first.
            while let Ok(update) = self.wakeup.try_recv() {
                self.queue.apply(update);
                handler.queue_updated(&self.queue);
            }

            let Some(head) = self.queue.peek().copied() else {
                break;
            };

            tokio::select! {
                // A pending wakeup is applied before the head action is
                // dispatched, and cannot be lost.
                biased;
                update = self.wakeup.recv() => {
                    match update {
                        Some(update) => self.queue.apply(update),
                        None => break,
                    }
                }
                _ = tokio::time::sleep_until(head.ts) => {
                    self.queue.pop_front();
                    let update = handler.handle(head.kind, &self.queue).await;
                    // A wakeup that arrived while the handler ran wins over
                    // the handler's own update.
                    match self.wakeup.try_recv() {
                        Ok(winner) => self.queue.apply(winner),
                        Err(_) => self.queue.apply(update),
                    }
                }
            }

            handler.queue_updated(&self.queue);
        }
    }
}
