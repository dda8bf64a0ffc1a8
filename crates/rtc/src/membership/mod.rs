//! The membership manager.
//!
//! Publishes this device's participation in an RTC session as room state,
//! schedules a delayed leave event as a dead-man switch, keeps both alive,
//! and tears everything down on a voluntary leave.

mod worker;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{broadcast, watch};

use calliope_core::events::call::member::{
    room_version_supports_owned_state_keys, ActiveFocus, ActiveLivekitFocus, Application,
    CallIntent, CallMemberStateKey, Focus, FocusSelection,
};
use calliope_core::{OwnedDeviceId, OwnedRoomId, OwnedUserId};

use crate::client::{MatrixRtcClient, RequestError};
use crate::config::MembershipConfig;
use crate::participant::SessionMember;
use crate::scheduler::{ActionKind, ActionScheduler, ActionUpdate, ScheduledAction, SchedulerHandle, Status};

use self::worker::MembershipWorker;

/// Events emitted by the [`MembershipManager`].
#[derive(Clone, Debug)]
#[non_exhaustive]
pub enum MembershipEvent {
    /// The connection status changed.
    StatusChanged {
        /// The previous status.
        old: Status,
        /// The new status.
        new: Status,
    },

    /// Whether the server has probably already published our scheduled
    /// leave event because we could not restart its countdown in time.
    ///
    /// Clears on the next successful restart.
    ProbablyLeft(bool),
}

/// A fatal membership manager failure, surfaced through the `on_error`
/// callback passed to [`MembershipManager::join`].
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum MembershipError {
    /// A request failed with an error that is not retried.
    #[error("{action} failed: {source}")]
    Request {
        /// The action that failed.
        action: &'static str,
        /// The underlying request error.
        #[source]
        source: RequestError,
    },

    /// A request kept failing until its retry budget ran out.
    #[error("gave up on {action} after {retries} retries: {source}")]
    RetryLimitReached {
        /// The action that failed.
        action: &'static str,
        /// How many retries were attempted.
        retries: u32,
        /// The last request error.
        #[source]
        source: RequestError,
    },

    /// The manager is not in a state where the operation is possible.
    #[error("no join event is published for this device")]
    NotJoined,
}

/// The callback invoked when the manager terminates on a fatal error.
pub type OnMembershipError = Box<dyn FnOnce(MembershipError) + Send>;

/// State shared between the manager front and its worker task.
pub(crate) struct Shared {
    pub activated: bool,
    pub running: bool,
    pub has_member_state_event: bool,
    pub probably_left: bool,
    pub intent: Option<CallIntent>,
    pub focus_active: ActiveFocus,
    pub foci_preferred: Vec<Focus>,
    pub own_membership: Option<SessionMember>,
}

impl Default for Shared {
    fn default() -> Self {
        Self {
            activated: false,
            running: false,
            has_member_state_event: false,
            probably_left: false,
            intent: None,
            focus_active: ActiveFocus::Livekit(ActiveLivekitFocus::new()),
            foci_preferred: Vec::new(),
            own_membership: None,
        }
    }
}

pub(crate) struct Inner {
    pub(crate) client: Arc<dyn MatrixRtcClient>,
    pub(crate) config: MembershipConfig,
    pub(crate) room_id: OwnedRoomId,
    pub(crate) user_id: OwnedUserId,
    pub(crate) device_id: OwnedDeviceId,
    pub(crate) application: Application,
    pub(crate) state_key: CallMemberStateKey,
    pub(crate) shared: Mutex<Shared>,
    pub(crate) scheduler: Mutex<Option<SchedulerHandle>>,
    pub(crate) status_tx: watch::Sender<Status>,
    pub(crate) events_tx: broadcast::Sender<MembershipEvent>,
}

impl Inner {
    pub(crate) fn shared(&self) -> std::sync::MutexGuard<'_, Shared> {
        self.shared.lock().expect("shared state poisoned")
    }

    pub(crate) fn scheduler_handle(&self) -> Option<SchedulerHandle> {
        self.scheduler.lock().expect("scheduler handle poisoned").clone()
    }
}

/// Publishes and maintains this device's participation in a room-scoped RTC
/// session.
///
/// One manager instance covers one `(room, application, call id)` slot.
/// After [`join`](Self::join) a background task drives the state machine
/// until [`leave`](Self::leave) completes or a fatal error is surfaced
/// through the error callback.
pub struct MembershipManager {
    inner: Arc<Inner>,
}

impl MembershipManager {
    /// Creates a new manager for the given device and session slot.
    ///
    /// `room_version` decides whether the state key may start with the user
    /// id or needs the underscore prefix.
    pub fn new(
        client: Arc<dyn MatrixRtcClient>,
        room_id: OwnedRoomId,
        user_id: OwnedUserId,
        device_id: OwnedDeviceId,
        application: Application,
        room_version: &str,
        config: MembershipConfig,
    ) -> Self {
        let state_key = CallMemberStateKey::new(
            &user_id,
            &device_id,
            &application,
            !room_version_supports_owned_state_keys(room_version),
        );
        let (status_tx, _) = watch::channel(Status::Disconnected);
        let (events_tx, _) = broadcast::channel(64);

        Self {
            inner: Arc::new(Inner {
                client,
                config,
                room_id,
                user_id,
                device_id,
                application,
                state_key,
                shared: Mutex::new(Shared::default()),
                scheduler: Mutex::new(None),
                status_tx,
                events_tx,
            }),
        }
    }

    /// Joins the session: publishes the membership fact and keeps it alive.
    ///
    /// Idempotent; a second call while the manager is active logs and
    /// returns. Must be called within a tokio runtime.
    ///
    /// # Arguments
    ///
    /// * `foci_preferred` - The transports this device proposes to use.
    /// * `multi_sfu_focus` - Selects the `multi_sfu` focus selection policy
    ///   instead of `oldest_membership`.
    /// * `on_error` - Invoked once if the state machine terminates on a
    ///   fatal error.
    pub fn join(
        &self,
        foci_preferred: Vec<Focus>,
        multi_sfu_focus: bool,
        on_error: Option<OnMembershipError>,
    ) {
        {
            let mut shared = self.inner.shared();
            if shared.activated {
                debug!("already part of the session, ignoring join");
                return;
            }
            shared.activated = true;
            shared.running = true;
            shared.has_member_state_event = false;
            shared.probably_left = false;
            shared.intent = None;
            shared.foci_preferred = foci_preferred;
            shared.focus_active = ActiveFocus::Livekit(ActiveLivekitFocus {
                focus_selection: if multi_sfu_focus {
                    FocusSelection::MultiSfu
                } else {
                    FocusSelection::OldestMembership
                },
            });
        }

        let (scheduler, handle) = ActionScheduler::new();
        handle.initiate_join();
        *self.inner.scheduler.lock().expect("scheduler handle poisoned") = Some(handle);

        let worker = MembershipWorker::new(self.inner.clone(), on_error);
        tokio::spawn(worker.run(scheduler));
    }

    /// Requests a voluntary teardown of the membership.
    ///
    /// Resolves `true` once the leave sequence completed, `false` when the
    /// given timeout elapsed first. Calling this while not joined resolves
    /// `true` immediately.
    pub async fn leave(&self, timeout: Option<Duration>) -> bool {
        if !self.inner.shared().running {
            return true;
        }
        let Some(handle) = self.inner.scheduler_handle() else {
            return true;
        };
        handle.initiate_leave();

        let mut status = self.inner.status_tx.subscribe();
        let disconnected = status.wait_for(|status| *status == Status::Disconnected);
        match timeout {
            Some(timeout) => tokio::time::timeout(timeout, disconnected).await.is_ok(),
            None => {
                let _ = disconnected.await;
                true
            }
        }
    }

    /// Feeds the currently observed memberships of the session slot into
    /// the manager.
    ///
    /// When the local fact went missing (e.g. the server lost it in a
    /// restart, or another agent removed it), a fresh join sequence is
    /// scheduled unless one is already pending.
    pub fn on_rtc_session_member_update(&self, memberships: &[SessionMember]) {
        let recover = {
            let mut shared = self.inner.shared();
            shared.own_membership = memberships
                .iter()
                .find(|member| member.is_device(&self.inner.user_id, &self.inner.device_id))
                .cloned();

            if shared.activated && shared.running && shared.own_membership.is_none() {
                if shared.has_member_state_event {
                    warn!("own membership disappeared from room state, re-establishing");
                    shared.has_member_state_event = false;
                }
                true
            } else {
                false
            }
        };

        if recover {
            if let Some(handle) = self.inner.scheduler_handle() {
                // The queue drops this when a (re)join is already pending.
                handle.post(ActionUpdate::Insert(vec![ScheduledAction::now(
                    ActionKind::SendDelayedEvent,
                )]));
            }
        }
    }

    /// Updates the advertised call intent and republishes the join event.
    ///
    /// Only valid while joined and after the join event has been published.
    pub fn update_call_intent(&self, intent: CallIntent) -> Result<(), MembershipError> {
        {
            let mut shared = self.inner.shared();
            if !shared.activated || !shared.has_member_state_event {
                return Err(MembershipError::NotJoined);
            }
            shared.intent = Some(intent);
        }

        if let Some(handle) = self.inner.scheduler_handle() {
            handle.post(ActionUpdate::Insert(vec![ScheduledAction::now(
                ActionKind::SendJoinEvent,
            )]));
        }
        Ok(())
    }

    /// The current connection status.
    pub fn status(&self) -> Status {
        *self.inner.status_tx.borrow()
    }

    /// Subscribe to status updates.
    pub fn subscribe_status(&self) -> watch::Receiver<Status> {
        self.inner.status_tx.subscribe()
    }

    /// Subscribe to membership events.
    pub fn events(&self) -> broadcast::Receiver<MembershipEvent> {
        self.inner.events_tx.subscribe()
    }

    /// Whether the server has probably already published our delayed leave.
    pub fn probably_left(&self) -> bool {
        self.inner.shared().probably_left
    }
}
