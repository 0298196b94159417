//! Scriptable in-process radio for unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver};

use crate::config::{CellularConfig, DispatcherMode};
use crate::device::CellularDevice;
use crate::event::{CellularEvent, StatusCallback};
use crate::ril::{
    AppState, CardState, CardStatus, DataCallResponse, GwSignalStrength, LteSignalStrength,
    RadioInterface, RadioState, RadioTransport, RequestKind, RilEnv, RilErrno, RilRequest,
    RilResponse, SignalStrength, SmsResponse, TokenId, Unsolicited,
};

type Reply = (RilErrno, RilResponse);

struct Held {
    token: TokenId,
    reply: Reply,
    power: Option<bool>,
}

#[derive(Default)]
struct FakeState {
    radio: Option<RadioState>,
    refuse_init: bool,
    hold: bool,
    held: Vec<Held>,
    sticky: HashMap<RequestKind, Reply>,
    once: HashMap<RequestKind, VecDeque<Reply>>,
    requests: Vec<RilRequest>,
    cancelled: Vec<TokenId>,
}

/// Answers inline unless told to hold. Replies come from, in order, a
/// one-shot queue, a sticky override, then a sensible default.
pub(crate) struct FakeRadio {
    env: Mutex<Option<Arc<dyn RilEnv>>>,
    state: Mutex<FakeState>,
}

impl FakeRadio {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            env: Mutex::new(None),
            state: Mutex::new(FakeState {
                radio: Some(RadioState::On),
                ..FakeState::default()
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    fn env(&self) -> Option<Arc<dyn RilEnv>> {
        self.env.lock().unwrap().clone()
    }

    pub fn refuse_init(&self, refuse: bool) {
        self.lock().refuse_init = refuse;
    }

    pub fn set_radio_state(&self, state: RadioState) {
        self.lock().radio = Some(state);
    }

    pub fn hold_completions(&self, hold: bool) {
        self.lock().hold = hold;
    }

    pub fn release_held(&self) {
        let held = std::mem::take(&mut self.lock().held);
        for h in held {
            self.deliver(h);
        }
    }

    pub fn respond(&self, kind: RequestKind, error: RilErrno, response: RilResponse) {
        self.lock().sticky.insert(kind, (error, response));
    }

    pub fn respond_once(&self, kind: RequestKind, error: RilErrno, response: RilResponse) {
        self.lock()
            .once
            .entry(kind)
            .or_default()
            .push_back((error, response));
    }

    pub fn push_unsolicited(&self, u: Unsolicited) {
        if let Some(env) = self.env() {
            env.on_unsolicited_response(u);
        }
    }

    pub fn request_count(&self) -> usize {
        self.lock().requests.len()
    }

    pub fn count_of(&self, kind: RequestKind) -> usize {
        self.lock().requests.iter().filter(|r| r.kind() == kind).count()
    }

    pub fn requests(&self) -> Vec<RilRequest> {
        self.lock().requests.clone()
    }

    pub fn cancelled(&self) -> Vec<TokenId> {
        self.lock().cancelled.clone()
    }

    fn deliver(&self, held: Held) {
        let (error, response) = held.reply;
        if let Some(on) = held.power {
            if error.is_success() {
                self.set_radio_state(if on { RadioState::On } else { RadioState::Off });
            }
        }
        if let Some(env) = self.env() {
            env.on_request_complete(held.token, error, response);
        }
    }
}

fn default_reply(request: &RilRequest) -> Reply {
    let response = match request {
        RilRequest::GetSimStatus => RilResponse::CardStatus(CardStatus {
            card_state: CardState::Present,
            app_state: AppState::Ready,
        }),
        RilRequest::DataRegistrationState => {
            RilResponse::Strings(registration_strings("1", "14"))
        }
        RilRequest::SignalStrength => RilResponse::SignalStrength(SignalStrength {
            gw: GwSignalStrength {
                signal_strength: 20,
                bit_error_rate: 0,
            },
            lte: LteSignalStrength {
                signal_strength: 20,
                ..Default::default()
            },
        }),
        RilRequest::SetupDataCall(_) => RilResponse::DataCall(up_call(0)),
        RilRequest::DataCallList => RilResponse::DataCallList(Vec::new()),
        RilRequest::QueryNetworkSelectionMode => RilResponse::Ints(vec![0]),
        RilRequest::BasebandVersion => RilResponse::Text("fake-ril 1.0".into()),
        RilRequest::GetImsi | RilRequest::GetImei => RilResponse::Text("001010000000001".into()),
        RilRequest::SendSms { .. } => RilResponse::Sms(SmsResponse {
            message_ref: 1,
            ack_pdu: None,
            error_code: -1,
        }),
        _ => RilResponse::Empty,
    };
    (RilErrno::Success, response)
}

impl RadioInterface for FakeRadio {
    fn init(&self, env: Arc<dyn RilEnv>) -> bool {
        if self.lock().refuse_init {
            return false;
        }
        *self.env.lock().unwrap() = Some(env);
        true
    }

    fn on_request(&self, token: TokenId, request: RilRequest) {
        let held = {
            let mut st = self.lock();
            st.requests.push(request.clone());
            let kind = request.kind();
            let once = st.once.get_mut(&kind).and_then(VecDeque::pop_front);
            let reply = match once {
                Some(reply) => reply,
                None => st
                    .sticky
                    .get(&kind)
                    .cloned()
                    .unwrap_or_else(|| default_reply(&request)),
            };
            let power = match request {
                RilRequest::RadioPower { on } => Some(on),
                _ => None,
            };
            let held = Held { token, reply, power };
            if st.hold {
                st.held.push(held);
                return;
            }
            held
        };
        self.deliver(held);
    }

    fn on_state_request(&self) -> RadioState {
        self.lock().radio.unwrap_or(RadioState::Unavailable)
    }

    fn on_cancel(&self, token: TokenId) {
        self.lock().cancelled.push(token);
    }

    fn version(&self) -> Option<String> {
        Some("fake-ril 1.0".into())
    }
}

/// Eleven-field `DATA_REGISTRATION_STATE` answer.
pub(crate) fn registration_strings(status: &str, technology: &str) -> Vec<Option<String>> {
    let mut fields = vec![None; 11];
    fields[0] = Some(status.to_string());
    fields[1] = Some("0x00FF".to_string());
    fields[2] = Some("0x0001".to_string());
    fields[3] = Some(technology.to_string());
    fields[5] = Some("1".to_string());
    fields
}

pub(crate) fn up_call(cid: i32) -> DataCallResponse {
    DataCallResponse {
        status: 0,
        suggested_retry_time: -1,
        cid,
        active: DataCallResponse::ACTIVE_UP,
        protocol: "IP".into(),
        ifname: format!("ifname{cid}"),
        addresses: format!("10.0.0.{}", cid + 1),
        dnses: "8.8.8.8".into(),
        gateways: "10.0.0.99".into(),
        pcscf: String::new(),
        mtu: 1500,
    }
}

/// Manual dispatch and budgets short enough for tests.
pub(crate) fn manual_config() -> CellularConfig {
    let mut config = CellularConfig::default();
    config.event_queue.dispatcher = DispatcherMode::Manual;
    config.device.request_timeout = Duration::from_secs(1);
    config.device.retry_timeouts = vec![Duration::from_millis(10)];
    let t = &mut config.context.timeouts;
    t.device = Duration::from_secs(1);
    t.sim = Duration::from_secs(1);
    t.registration = Duration::from_secs(1);
    t.attach = Duration::from_secs(1);
    t.connect = Duration::from_secs(1);
    config
}

pub(crate) fn fake_device(radio: &Arc<FakeRadio>, config: CellularConfig) -> Arc<CellularDevice> {
    let transport = Arc::new(RadioTransport::new(radio.clone()));
    transport.init_ril().unwrap();
    CellularDevice::new(transport, config).unwrap()
}

pub(crate) fn recorder() -> (StatusCallback, Receiver<CellularEvent>) {
    let (tx, rx) = unbounded();
    let cb: StatusCallback = Arc::new(move |e: &CellularEvent| {
        let _ = tx.send(e.clone());
    });
    (cb, rx)
}

pub(crate) fn record_events(device: &CellularDevice) -> Receiver<CellularEvent> {
    let (cb, rx) = recorder();
    device.attach(Some(cb));
    rx
}
