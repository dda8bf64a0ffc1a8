//! The state machine dispatched by the action scheduler.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value as JsonValue;
use tokio::time::Instant;

use calliope_core::events::call::member::{CallMemberEventContent, LeaveReason};
use calliope_core::UnixMillis;

use crate::client::{RequestError, UpdateDelayedEventAction};
use crate::scheduler::{
    derive_status, ActionHandler, ActionKind, ActionQueue, ActionScheduler, ActionUpdate,
    ScheduledAction, Status,
};

use super::{Inner, MembershipError, MembershipEvent, OnMembershipError};

pub(super) struct MembershipWorker {
    inner: Arc<Inner>,
    on_error: Option<OnMembershipError>,

    delay_id: Option<String>,
    /// The configured delay, clamped down when the server rejects it.
    delayed_leave_delay: Duration,
    start_time: Instant,
    expire_update_iterations: u32,
    /// When the server will send the scheduled leave unless we restart it.
    expected_server_delay_leave: Option<Instant>,
    probably_left: bool,

    rate_limit_retries: HashMap<ActionKind, u32>,
    network_error_retries: HashMap<ActionKind, u32>,
    last_status: Status,
}

fn insert_now(kind: ActionKind) -> ActionUpdate {
    ActionUpdate::Insert(vec![ScheduledAction::now(kind)])
}

fn insert_at(ts: Instant, kind: ActionKind) -> ActionUpdate {
    ActionUpdate::Insert(vec![ScheduledAction::at(ts, kind)])
}

impl MembershipWorker {
    pub(super) fn new(inner: Arc<Inner>, on_error: Option<OnMembershipError>) -> Self {
        let delayed_leave_delay = inner.config.delayed_leave_event_delay;
        Self {
            inner,
            on_error,
            delay_id: None,
            delayed_leave_delay,
            start_time: Instant::now(),
            expire_update_iterations: 0,
            expected_server_delay_leave: None,
            probably_left: false,
            rate_limit_retries: HashMap::new(),
            network_error_retries: HashMap::new(),
            last_status: Status::Disconnected,
        }
    }

    pub(super) async fn run(mut self, scheduler: ActionScheduler) {
        scheduler.run(&mut self).await;
        self.finish();
    }

    fn finish(&mut self) {
        {
            let mut shared = self.inner.shared();
            shared.running = false;
            shared.activated = false;
        }
        *self
            .inner
            .scheduler
            .lock()
            .expect("scheduler handle poisoned") = None;
        self.emit_status(Status::Disconnected);
        debug!("membership manager stopped");
    }

    // ------------------------------------------------------------------
    // Action handlers

    /// Schedules the delayed leave event on the server, cancelling a stale
    /// handle first.
    async fn send_delayed_event(&mut self) -> Result<ActionUpdate, MembershipError> {
        if let Some(delay_id) = self.delay_id.clone() {
            return match self
                .inner
                .client
                .update_delayed_event(&delay_id, UpdateDelayedEventAction::Cancel)
                .await
            {
                Ok(()) => {
                    self.delay_id = None;
                    Ok(insert_now(ActionKind::SendDelayedEvent))
                }
                Err(RequestError::NotFound) => {
                    // Already gone, which is what we wanted.
                    self.delay_id = None;
                    Ok(insert_now(ActionKind::SendDelayedEvent))
                }
                Err(error @ RequestError::RateLimited { .. }) => {
                    self.retry_rate_limited(ActionKind::SendDelayedEvent, error)
                }
                Err(error) if error.is_transient() => self.retry_transient(
                    ActionKind::SendDelayedEvent,
                    error,
                    self.inner.config.network_error_retry,
                ),
                Err(source) => Err(MembershipError::Request {
                    action: "cancelling the stale delayed leave event",
                    source,
                }),
            };
        }

        let content = CallMemberEventContent::new_empty(Some(LeaveReason::LostConnection));
        let result = self
            .inner
            .client
            .send_delayed_state_event(
                &self.inner.room_id,
                self.delayed_leave_delay,
                CallMemberEventContent::TYPE,
                self.inner.state_key.as_str(),
                to_json(&content),
            )
            .await;

        match result {
            Ok(delay_id) => {
                debug!(%delay_id, "scheduled the delayed leave event");
                self.delay_id = Some(delay_id);
                self.expected_server_delay_leave =
                    Some(Instant::now() + self.delayed_leave_delay);
                self.reset_retries(ActionKind::SendDelayedEvent);

                if self.inner.shared().has_member_state_event {
                    Ok(insert_at(
                        Instant::now() + self.inner.config.delayed_leave_event_restart,
                        ActionKind::RestartDelayedEvent,
                    ))
                } else {
                    Ok(insert_now(ActionKind::SendJoinEvent))
                }
            }
            Err(RequestError::MaxDelayExceeded { max_delay: Some(max_delay) }) => {
                info!(
                    "the server only schedules delays up to {max_delay:?}, clamping from \
                     {:?}",
                    self.delayed_leave_delay
                );
                self.delayed_leave_delay = self.delayed_leave_delay.min(max_delay);
                Ok(insert_now(ActionKind::SendDelayedEvent))
            }
            Err(RequestError::UnsupportedEndpoint) => {
                warn!(
                    "delayed events are not supported by this server, joining without a \
                     delayed leave safety net"
                );
                Ok(insert_now(ActionKind::SendJoinEvent))
            }
            Err(error @ RequestError::RateLimited { .. }) => {
                self.retry_rate_limited(ActionKind::SendDelayedEvent, error)
            }
            Err(error) if error.is_transient() => self.retry_transient(
                ActionKind::SendDelayedEvent,
                error,
                self.inner.config.network_error_retry,
            ),
            Err(source) => Err(MembershipError::Request {
                action: ActionKind::SendDelayedEvent.as_str(),
                source,
            }),
        }
    }

    /// Publishes the membership fact.
    async fn send_join_event(
        &mut self,
        queue: &ActionQueue,
    ) -> Result<ActionUpdate, MembershipError> {
        let content = self.membership_content(None, self.inner.config.membership_event_expiry);
        let result = self
            .inner
            .client
            .send_state_event(
                &self.inner.room_id,
                CallMemberEventContent::TYPE,
                self.inner.state_key.as_str(),
                content,
            )
            .await;

        match result {
            Ok(_event_id) => {
                self.start_time = Instant::now();
                self.expire_update_iterations = 1;
                self.inner.shared().has_member_state_event = true;
                self.set_probably_left(false);
                self.reset_retries(ActionKind::SendJoinEvent);

                // Keep the yet-unreached actions, but restart the delayed
                // leave right away (the state send may have dropped it on
                // some servers) and start the expiry update chain over.
                let mut actions: Vec<ScheduledAction> = queue
                    .actions()
                    .filter(|action| {
                        !matches!(
                            action.kind,
                            ActionKind::SendJoinEvent
                                | ActionKind::UpdateExpiry
                                | ActionKind::RestartDelayedEvent
                        )
                    })
                    .copied()
                    .collect();
                actions.push(ScheduledAction::now(ActionKind::RestartDelayedEvent));
                actions.push(ScheduledAction::at(
                    self.next_expiry_action(1),
                    ActionKind::UpdateExpiry,
                ));
                Ok(ActionUpdate::Replace(actions))
            }
            Err(error @ RequestError::RateLimited { .. }) => {
                self.retry_rate_limited(ActionKind::SendJoinEvent, error)
            }
            Err(error) if error.is_transient() => self.retry_transient(
                ActionKind::SendJoinEvent,
                error,
                self.inner.config.network_error_retry,
            ),
            Err(source) => Err(MembershipError::Request {
                action: ActionKind::SendJoinEvent.as_str(),
                source,
            }),
        }
    }

    /// Resets the countdown of the delayed leave event.
    async fn restart_delayed_event(&mut self) -> Result<ActionUpdate, MembershipError> {
        let Some(delay_id) = self.delay_id.clone() else {
            // The handle is gone, recreate the delayed event.
            return Ok(insert_now(ActionKind::SendDelayedEvent));
        };

        // A restart that arrives after the server already sent our leave is
        // useless. Cap the local wait by the expected server-side deadline,
        // unless we already assume to have left.
        let mut local_timeout = self.inner.config.delayed_leave_event_restart_local_timeout;
        if !self.probably_left {
            if let Some(expected) = self.expected_server_delay_leave {
                local_timeout =
                    local_timeout.min(expected.saturating_duration_since(Instant::now()));
            }
        }

        let request = self
            .inner
            .client
            .update_delayed_event(&delay_id, UpdateDelayedEventAction::Restart);
        let result = tokio::time::timeout(local_timeout, request).await;

        match result {
            Err(_elapsed) => {
                if self
                    .expected_server_delay_leave
                    .is_some_and(|expected| expected <= Instant::now())
                {
                    self.set_probably_left(true);
                }
                self.retry_transient(
                    ActionKind::RestartDelayedEvent,
                    RequestError::LocalTimeout,
                    Duration::ZERO,
                )
            }
            Ok(Ok(())) => {
                self.expected_server_delay_leave =
                    Some(Instant::now() + self.delayed_leave_delay);
                self.set_probably_left(false);
                self.reset_retries(ActionKind::RestartDelayedEvent);
                Ok(insert_at(
                    Instant::now() + self.inner.config.delayed_leave_event_restart,
                    ActionKind::RestartDelayedEvent,
                ))
            }
            Ok(Err(RequestError::NotFound)) => {
                debug!("the server lost our delayed leave event, recreating it");
                self.delay_id = None;
                Ok(insert_now(ActionKind::SendDelayedEvent))
            }
            Ok(Err(RequestError::UnsupportedEndpoint)) => {
                debug!("restarting delayed events is not supported, giving up on it");
                Ok(ActionUpdate::Unchanged)
            }
            Ok(Err(error @ RequestError::RateLimited { .. })) => {
                self.retry_rate_limited(ActionKind::RestartDelayedEvent, error)
            }
            Ok(Err(error)) if error.is_transient() => self.retry_transient(
                ActionKind::RestartDelayedEvent,
                error,
                self.inner.config.network_error_retry,
            ),
            Ok(Err(source)) => Err(MembershipError::Request {
                action: ActionKind::RestartDelayedEvent.as_str(),
                source,
            }),
        }
    }

    /// Re-publishes the membership with a longer expiry.
    async fn update_expiry(&mut self) -> Result<ActionUpdate, MembershipError> {
        let expires =
            self.inner.config.membership_event_expiry * (self.expire_update_iterations + 1);
        let created_ts = self
            .inner
            .shared()
            .own_membership
            .as_ref()
            .and_then(|member| member.created_ts());
        let content = self.membership_content(created_ts, expires);

        let result = self
            .inner
            .client
            .send_state_event(
                &self.inner.room_id,
                CallMemberEventContent::TYPE,
                self.inner.state_key.as_str(),
                content,
            )
            .await;

        match result {
            Ok(_event_id) => {
                self.expire_update_iterations += 1;
                self.reset_retries(ActionKind::UpdateExpiry);
                Ok(insert_at(
                    self.next_expiry_action(self.expire_update_iterations),
                    ActionKind::UpdateExpiry,
                ))
            }
            Err(error @ RequestError::RateLimited { .. }) => {
                self.retry_rate_limited(ActionKind::UpdateExpiry, error)
            }
            Err(error) if error.is_transient() => self.retry_transient(
                ActionKind::UpdateExpiry,
                error,
                self.inner.config.network_error_retry,
            ),
            Err(source) => Err(MembershipError::Request {
                action: ActionKind::UpdateExpiry.as_str(),
                source,
            }),
        }
    }

    /// Asks the server to send the scheduled leave event right away.
    async fn send_scheduled_delayed_leave(&mut self) -> Result<ActionUpdate, MembershipError> {
        if !self.inner.shared().has_member_state_event {
            debug!("no membership is published, nothing to leave");
            return Ok(ActionUpdate::Replace(Vec::new()));
        }
        let Some(delay_id) = self.delay_id.clone() else {
            return Ok(insert_now(ActionKind::SendLeaveEvent));
        };

        match self
            .inner
            .client
            .update_delayed_event(&delay_id, UpdateDelayedEventAction::Send)
            .await
        {
            Ok(()) => {
                self.delay_id = None;
                self.inner.shared().has_member_state_event = false;
                Ok(ActionUpdate::Replace(Vec::new()))
            }
            Err(RequestError::NotFound) | Err(RequestError::UnsupportedEndpoint) => {
                self.delay_id = None;
                Ok(insert_now(ActionKind::SendLeaveEvent))
            }
            Err(error @ RequestError::RateLimited { .. }) => {
                self.retry_rate_limited(ActionKind::SendScheduledDelayedLeaveEvent, error)
            }
            Err(error) if error.is_transient() => self.retry_transient(
                ActionKind::SendScheduledDelayedLeaveEvent,
                error,
                self.inner.config.network_error_retry,
            ),
            Err(source) => Err(MembershipError::Request {
                action: ActionKind::SendScheduledDelayedLeaveEvent.as_str(),
                source,
            }),
        }
    }

    /// Publishes the empty leave state event directly.
    async fn send_leave_event(&mut self) -> Result<ActionUpdate, MembershipError> {
        let content = CallMemberEventContent::new_empty(None);
        let result = self
            .inner
            .client
            .send_state_event(
                &self.inner.room_id,
                CallMemberEventContent::TYPE,
                self.inner.state_key.as_str(),
                to_json(&content),
            )
            .await;

        match result {
            Ok(_event_id) => {
                self.inner.shared().has_member_state_event = false;
                Ok(ActionUpdate::Replace(Vec::new()))
            }
            Err(error @ RequestError::RateLimited { .. }) => {
                self.retry_rate_limited(ActionKind::SendLeaveEvent, error)
            }
            Err(error) if error.is_transient() => self.retry_transient(
                ActionKind::SendLeaveEvent,
                error,
                self.inner.config.network_error_retry,
            ),
            Err(source) => Err(MembershipError::Request {
                action: ActionKind::SendLeaveEvent.as_str(),
                source,
            }),
        }
    }

    // ------------------------------------------------------------------
    // Helpers

    fn membership_content(&self, created_ts: Option<UnixMillis>, expires: Duration) -> JsonValue {
        let shared = self.inner.shared();
        let mut content = CallMemberEventContent::new(
            self.inner.application.clone(),
            self.inner.device_id.clone(),
            shared.focus_active.clone(),
            shared.foci_preferred.clone(),
            created_ts,
            expires,
        );
        if let CallMemberEventContent::Session(session) = &mut content {
            session.intent = shared.intent.clone();
        }
        to_json(&content)
    }

    fn next_expiry_action(&self, iteration: u32) -> Instant {
        let period = self
            .inner
            .config
            .membership_event_expiry
            .min(self.inner.config.membership_sticky_duration);
        self.start_time + period * iteration - self.inner.config.membership_event_expiry_headroom
    }

    fn retry_rate_limited(
        &mut self,
        kind: ActionKind,
        error: RequestError,
    ) -> Result<ActionUpdate, MembershipError> {
        let count = self.rate_limit_retries.entry(kind).or_default();
        *count += 1;
        if *count > self.inner.config.maximum_rate_limit_retry_count {
            return Err(MembershipError::RetryLimitReached {
                action: kind.as_str(),
                retries: *count - 1,
                source: error,
            });
        }
        let backoff = error
            .retry_after()
            .unwrap_or(self.inner.config.rate_limit_default_retry);
        warn!(action = kind.as_str(), "rate limited, retrying in {backoff:?}");
        Ok(insert_at(Instant::now() + backoff, kind))
    }

    fn retry_transient(
        &mut self,
        kind: ActionKind,
        error: RequestError,
        backoff: Duration,
    ) -> Result<ActionUpdate, MembershipError> {
        let count = self.network_error_retries.entry(kind).or_default();
        *count += 1;
        if *count > self.inner.config.maximum_network_error_retry_count {
            return Err(MembershipError::RetryLimitReached {
                action: kind.as_str(),
                retries: *count - 1,
                source: error,
            });
        }
        warn!(
            action = kind.as_str(),
            "network error ({error}), retrying in {backoff:?}"
        );
        Ok(insert_at(Instant::now() + backoff, kind))
    }

    fn reset_retries(&mut self, kind: ActionKind) {
        self.rate_limit_retries.remove(&kind);
        self.network_error_retries.remove(&kind);
    }

    fn set_probably_left(&mut self, probably_left: bool) {
        if self.probably_left == probably_left {
            return;
        }
        if probably_left {
            warn!("the server has probably already published our scheduled leave");
        }
        self.probably_left = probably_left;
        self.inner.shared().probably_left = probably_left;
        let _ = self
            .inner
            .events_tx
            .send(MembershipEvent::ProbablyLeft(probably_left));
    }

    fn emit_status(&mut self, new: Status) {
        let old = self.last_status;
        if old == new {
            return;
        }
        self.last_status = new;
        debug!("membership status changed: {old} -> {new}");
        self.inner.status_tx.send_replace(new);
        let _ = self
            .inner
            .events_tx
            .send(MembershipEvent::StatusChanged { old, new });
    }

    fn fail(&mut self, error: MembershipError) -> ActionUpdate {
        error!("membership manager terminated: {error}");
        if let Some(on_error) = self.on_error.take() {
            on_error(error);
        }
        ActionUpdate::Replace(Vec::new())
    }
}

fn to_json<T: serde::Serialize>(content: &T) -> JsonValue {
    serde_json::to_value(content).expect("event content serializes")
}

impl ActionHandler for MembershipWorker {
    async fn handle(&mut self, kind: ActionKind, queue: &ActionQueue) -> ActionUpdate {
        trace!(action = kind.as_str(), "dispatching");
        let result = match kind {
            ActionKind::SendDelayedEvent => self.send_delayed_event().await,
            ActionKind::SendJoinEvent => self.send_join_event(queue).await,
            ActionKind::RestartDelayedEvent => self.restart_delayed_event().await,
            ActionKind::UpdateExpiry => self.update_expiry().await,
            ActionKind::SendScheduledDelayedLeaveEvent => {
                self.send_scheduled_delayed_leave().await
            }
            ActionKind::SendLeaveEvent => self.send_leave_event().await,
        };

        match result {
            Ok(update) => update,
            Err(error) => self.fail(error),
        }
    }

    fn queue_updated(&mut self, queue: &ActionQueue) {
        let (running, has_member_state_event) = {
            let shared = self.inner.shared();
            (shared.running, shared.has_member_state_event)
        };
        // An empty queue means the loop is about to exit; `finish` emits
        // the final disconnected status.
        if queue.is_empty() {
            return;
        }
        self.emit_status(derive_status(queue, running, has_member_state_event));
    }
}
