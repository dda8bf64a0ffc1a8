//! A scripted Matrix client for driving the managers in tests.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value as JsonValue;

use calliope_core::events::call::member::{
    ActiveFocus, ActiveLivekitFocus, Application, CallApplicationContent, CallScope,
    SessionMembershipData,
};
use calliope_core::{OwnedEventId, RoomId, TransactionId, UnixMillis};
use calliope_rtc::client::{
    MatrixRtcClient, RequestError, ToDeviceMessages, UpdateDelayedEventAction,
};
use calliope_rtc::{MembershipConfig, SessionMember};

/// One request the mock client saw.
#[derive(Clone, Debug)]
pub enum Request {
    SendState {
        state_key: String,
        content: JsonValue,
    },
    SendDelayedState {
        delay: Duration,
        state_key: String,
        content: JsonValue,
    },
    UpdateDelayed {
        delay_id: String,
        action: &'static str,
    },
    SendToDevice {
        event_type: String,
        messages: JsonValue,
    },
    SendRoom {
        event_type: String,
        content: JsonValue,
    },
}

/// What a scripted endpoint does on its next call.
pub enum Scripted {
    Ok,
    Err(RequestError),
    /// Never respond; lets local timeouts elapse.
    Hang,
}

#[derive(Default)]
pub struct MockClient {
    pub requests: Mutex<Vec<Request>>,
    state_script: Mutex<VecDeque<Scripted>>,
    delayed_script: Mutex<VecDeque<Scripted>>,
    update_script: Mutex<VecDeque<Scripted>>,
    to_device_script: Mutex<VecDeque<Scripted>>,
    delay_counter: Mutex<u32>,
}

impl MockClient {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn script_state(&self, next: Scripted) {
        self.state_script.lock().unwrap().push_back(next);
    }

    pub fn script_delayed(&self, next: Scripted) {
        self.delayed_script.lock().unwrap().push_back(next);
    }

    pub fn script_update(&self, next: Scripted) {
        self.update_script.lock().unwrap().push_back(next);
    }

    pub fn script_to_device(&self, next: Scripted) {
        self.to_device_script.lock().unwrap().push_back(next);
    }

    pub fn requests(&self) -> Vec<Request> {
        self.requests.lock().unwrap().clone()
    }

    pub fn drain_requests(&self) -> Vec<Request> {
        std::mem::take(&mut *self.requests.lock().unwrap())
    }

    /// The contents of all observed plain state sends, in order.
    pub fn state_contents(&self) -> Vec<JsonValue> {
        self.requests()
            .into_iter()
            .filter_map(|request| match request {
                Request::SendState { content, .. } => Some(content),
                _ => None,
            })
            .collect()
    }

    /// The delays of all observed delayed state sends, in order.
    pub fn delayed_event_delays(&self) -> Vec<Duration> {
        self.requests()
            .into_iter()
            .filter_map(|request| match request {
                Request::SendDelayedState { delay, .. } => Some(delay),
                _ => None,
            })
            .collect()
    }

    /// All observed delayed event updates as `(delay_id, action)`, in
    /// order.
    pub fn delayed_event_updates(&self) -> Vec<(String, &'static str)> {
        self.requests()
            .into_iter()
            .filter_map(|request| match request {
                Request::UpdateDelayed { delay_id, action } => Some((delay_id, action)),
                _ => None,
            })
            .collect()
    }

    async fn run_script(queue: &Mutex<VecDeque<Scripted>>) -> Result<(), RequestError> {
        let next = queue.lock().unwrap().pop_front();
        match next {
            None | Some(Scripted::Ok) => Ok(()),
            Some(Scripted::Err(error)) => Err(error),
            Some(Scripted::Hang) => {
                std::future::pending::<()>().await;
                unreachable!()
            }
        }
    }
}

#[async_trait]
impl MatrixRtcClient for MockClient {
    async fn send_state_event(
        &self,
        _room_id: &RoomId,
        _event_type: &str,
        state_key: &str,
        content: JsonValue,
    ) -> Result<OwnedEventId, RequestError> {
        self.requests.lock().unwrap().push(Request::SendState {
            state_key: state_key.to_owned(),
            content,
        });
        Self::run_script(&self.state_script).await?;
        Ok("$event:hs".into())
    }

    async fn send_delayed_state_event(
        &self,
        _room_id: &RoomId,
        delay: Duration,
        _event_type: &str,
        state_key: &str,
        content: JsonValue,
    ) -> Result<String, RequestError> {
        self.requests.lock().unwrap().push(Request::SendDelayedState {
            delay,
            state_key: state_key.to_owned(),
            content,
        });
        Self::run_script(&self.delayed_script).await?;
        let mut counter = self.delay_counter.lock().unwrap();
        *counter += 1;
        Ok(format!("d{}", *counter))
    }

    async fn update_delayed_event(
        &self,
        delay_id: &str,
        action: UpdateDelayedEventAction,
    ) -> Result<(), RequestError> {
        self.requests.lock().unwrap().push(Request::UpdateDelayed {
            delay_id: delay_id.to_owned(),
            action: action.as_str(),
        });
        Self::run_script(&self.update_script).await
    }

    async fn send_to_device_event(
        &self,
        event_type: &str,
        _txn_id: &TransactionId,
        messages: ToDeviceMessages,
    ) -> Result<(), RequestError> {
        self.requests.lock().unwrap().push(Request::SendToDevice {
            event_type: event_type.to_owned(),
            messages: serde_json::to_value(&messages).unwrap(),
        });
        Self::run_script(&self.to_device_script).await
    }

    async fn send_room_event(
        &self,
        _room_id: &RoomId,
        event_type: &str,
        _txn_id: &TransactionId,
        content: JsonValue,
    ) -> Result<OwnedEventId, RequestError> {
        self.requests.lock().unwrap().push(Request::SendRoom {
            event_type: event_type.to_owned(),
            content,
        });
        Ok("$event:hs".into())
    }
}

/// The room-scoped call slot.
pub fn room_call() -> Application {
    Application::Call(CallApplicationContent::new(String::new(), CallScope::Room))
}

/// A membership config with an expiry short enough to step over in tests.
pub fn test_config() -> MembershipConfig {
    let mut config = MembershipConfig::default();
    config.membership_event_expiry = Duration::from_secs(30);
    config
}

/// An observed membership fact of the given device.
pub fn session_member(user_id: &str, device_id: &str, created_ts: u64) -> SessionMember {
    SessionMember {
        user_id: user_id.into(),
        membership: SessionMembershipData {
            application: room_call(),
            device_id: device_id.into(),
            foci_preferred: Vec::new(),
            focus_active: ActiveFocus::Livekit(ActiveLivekitFocus::new()),
            created_ts: Some(UnixMillis(created_ts)),
            expires: Duration::from_secs(4 * 60 * 60),
            intent: None,
        },
        origin_server_ts: None,
    }
}
