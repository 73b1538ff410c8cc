//! WASAPI binding.
//!
//! Every call initializes COM for the calling thread (multithreaded
//! apartment) and creates its own device enumerator, so the subsystem holds
//! no COM state and can be shared freely between threads. Session watches
//! outlive the call that creates them and hold their own reference on the
//! multithreaded apartment instead.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use windows::core::{implement, Interface, GUID, HSTRING, PCWSTR};
use windows::Win32::Foundation::{BOOL, RPC_E_CHANGED_MODE};
use windows::Win32::Media::Audio::Endpoints::IAudioMeterInformation;
use windows::Win32::Media::Audio::*;
use windows::Win32::System::Com::{
    CoCreateInstance, CoDecrementMTAUsage, CoIncrementMTAUsage, CoInitializeEx, CoTaskMemFree,
    CoUninitialize, CLSCTX_ALL, COINIT_MULTITHREADED, CO_MTA_USAGE_COOKIE, STGM_READ,
};
use windows::Win32::UI::Shell::PropertiesSystem::{IPropertyStore, PROPERTYKEY};

use crate::error::{DetectError, Result};
use crate::provider::{AudioSubsystem, SessionEventSink, SessionWatch};
use crate::types::{
    DeviceProperties, Direction, DisconnectReason, Endpoint, Session, SessionEvent, SessionState,
    UNKNOWN_DEVICE,
};

const fn device_key(fmtid: u128, pid: u32) -> PROPERTYKEY {
    PROPERTYKEY {
        fmtid: GUID::from_u128(fmtid),
        pid,
    }
}

const DEVICE_PROPERTIES: u128 = 0xa45c254e_df1c_4efd_8020_67d146a850e0;

const PKEY_DEVICE_DEVICE_DESC: PROPERTYKEY = device_key(DEVICE_PROPERTIES, 2);
const PKEY_DEVICE_HARDWARE_IDS: PROPERTYKEY = device_key(DEVICE_PROPERTIES, 3);
const PKEY_DEVICE_CLASS_GUID: PROPERTYKEY = device_key(DEVICE_PROPERTIES, 10);
const PKEY_DEVICE_FRIENDLY_NAME: PROPERTYKEY = device_key(DEVICE_PROPERTIES, 14);
const PKEY_DEVICE_BUS_TYPE_GUID: PROPERTYKEY = device_key(DEVICE_PROPERTIES, 21);
const PKEY_DEVICE_ENUMERATOR_NAME: PROPERTYKEY = device_key(DEVICE_PROPERTIES, 24);
const PKEY_DEVICE_INSTANCE_ID: PROPERTYKEY =
    device_key(0x78c34fc8_104a_4aca_9ea4_524d52996e57, 256);
const PKEY_DEVICE_PARENT: PROPERTYKEY = device_key(0x4340a6c5_93fa_4706_972c_7b648008a5a7, 8);

/// Keeps COM initialized on the current thread.
struct ComGuard {
    initialized: bool,
}

impl ComGuard {
    fn init() -> Result<Self> {
        let hr = unsafe { CoInitializeEx(None, COINIT_MULTITHREADED) };
        if hr == RPC_E_CHANGED_MODE {
            // Already initialized as an STA by the host; usable, but not ours to undo.
            return Ok(Self { initialized: false });
        }
        hr.ok().map_err(|e| DetectError::SubsystemUnavailable {
            code: Some(e.code().0),
            message: format!("Failed to initialize COM: {e}"),
        })?;
        Ok(Self { initialized: true })
    }
}

impl Drop for ComGuard {
    fn drop(&mut self) {
        if self.initialized {
            unsafe { CoUninitialize() };
        }
    }
}

/// Keeps the multithreaded apartment alive independently of any thread.
///
/// A watch's interfaces are created on the registering thread but released
/// from whichever thread stops the watch, and the OS keeps calling into the
/// shims in between. The apartment must outlive all of that even when the
/// registering thread uninitializes COM on return.
struct MtaUsage {
    cookie: CO_MTA_USAGE_COOKIE,
}

impl MtaUsage {
    fn acquire() -> Result<Self> {
        let cookie = unsafe { CoIncrementMTAUsage() }.map_err(|e| {
            DetectError::SubsystemUnavailable {
                code: Some(e.code().0),
                message: format!("Failed to hold the multithreaded apartment: {e}"),
            }
        })?;
        Ok(Self { cookie })
    }
}

impl Drop for MtaUsage {
    fn drop(&mut self) {
        if let Err(e) = unsafe { CoDecrementMTAUsage(self.cookie) } {
            tracing::debug!(error = %e, "mta_release_failed");
        }
    }
}

fn enumerator() -> windows::core::Result<IMMDeviceEnumerator> {
    unsafe { CoCreateInstance(&MMDeviceEnumerator, None, CLSCTX_ALL) }
}

fn data_flow(direction: Direction) -> EDataFlow {
    match direction {
        Direction::Capture => eCapture,
        Direction::Render => eRender,
    }
}

fn open_device(endpoint: &Endpoint) -> windows::core::Result<IMMDevice> {
    let id = HSTRING::from(endpoint.id.as_str());
    unsafe { enumerator()?.GetDevice(PCWSTR(id.as_ptr())) }
}

fn device_id(device: &IMMDevice) -> Option<String> {
    unsafe {
        let raw = device.GetId().ok()?;
        let id = raw.to_string().ok();
        CoTaskMemFree(Some(raw.0 as *const _));
        id
    }
}

fn read_string(store: &IPropertyStore, key: &PROPERTYKEY) -> Option<String> {
    let value = unsafe { store.GetValue(key) }.ok()?;
    let text = value.to_string();
    let text = text.trim();
    (!text.is_empty()).then(|| text.to_string())
}

fn read_properties(device: &IMMDevice) -> DeviceProperties {
    let Ok(store) = (unsafe { device.OpenPropertyStore(STGM_READ) }) else {
        return DeviceProperties::default();
    };

    // Multi-string values render as "a; b; c".
    let hardware_ids = read_string(&store, &PKEY_DEVICE_HARDWARE_IDS)
        .map(|ids| {
            ids.split(';')
                .map(str::trim)
                .filter(|id| !id.is_empty())
                .map(String::from)
                .collect()
        })
        .unwrap_or_default();

    DeviceProperties {
        instance_id: read_string(&store, &PKEY_DEVICE_INSTANCE_ID),
        hardware_ids,
        parent_id: read_string(&store, &PKEY_DEVICE_PARENT),
        enumerator_name: read_string(&store, &PKEY_DEVICE_ENUMERATOR_NAME),
        class_guid: read_string(&store, &PKEY_DEVICE_CLASS_GUID),
        bus_type_guid: read_string(&store, &PKEY_DEVICE_BUS_TYPE_GUID),
        friendly_name: read_string(&store, &PKEY_DEVICE_FRIENDLY_NAME),
        description: read_string(&store, &PKEY_DEVICE_DEVICE_DESC),
    }
}

fn session_state(state: AudioSessionState) -> SessionState {
    match state {
        AudioSessionStateActive => SessionState::Active,
        AudioSessionStateExpired => SessionState::Expired,
        _ => SessionState::Inactive,
    }
}

fn disconnect_reason(reason: AudioSessionDisconnectReason) -> DisconnectReason {
    match reason {
        DisconnectReasonDeviceRemoval => DisconnectReason::DeviceRemoved,
        DisconnectReasonServerShutdown => DisconnectReason::ServerShutdown,
        DisconnectReasonFormatChanged => DisconnectReason::FormatChanged,
        DisconnectReasonSessionLogoff => DisconnectReason::SessionLogoff,
        DisconnectReasonSessionDisconnected => DisconnectReason::SessionDisconnected,
        DisconnectReasonExclusiveModeOverride => DisconnectReason::ExclusiveModeOverride,
        _ => DisconnectReason::Other,
    }
}

fn process_id(control: &IAudioSessionControl) -> u32 {
    control
        .cast::<IAudioSessionControl2>()
        .and_then(|c| unsafe { c.GetProcessId() })
        .unwrap_or(0)
}

fn inspect_session(control: &IAudioSessionControl, endpoint: &Endpoint) -> Result<Session> {
    let inspection = |e: windows::core::Error| DetectError::PerSessionInspectionFailed {
        endpoint: endpoint.id.clone(),
        message: e.to_string(),
    };

    let state = unsafe { control.GetState() }.map_err(inspection)?;
    let pid = control
        .cast::<IAudioSessionControl2>()
        .and_then(|c| unsafe { c.GetProcessId() })
        .map_err(inspection)?;

    // Sessions without a readable volume interface stay listed but never
    // count as audible.
    let (volume, muted) = match control.cast::<ISimpleAudioVolume>() {
        Ok(simple) => unsafe {
            match (simple.GetMasterVolume(), simple.GetMute()) {
                (Ok(volume), Ok(muted)) => (Some(volume), muted.as_bool()),
                _ => (None, false),
            }
        },
        Err(_) => (None, false),
    };

    Ok(Session {
        process_id: pid,
        state: session_state(state),
        muted,
        volume,
    })
}

fn session_manager(device: &IMMDevice) -> windows::core::Result<IAudioSessionManager2> {
    unsafe { device.Activate(CLSCTX_ALL, None) }
}

fn session_controls(manager: &IAudioSessionManager2) -> windows::core::Result<Vec<IAudioSessionControl>> {
    unsafe {
        let sessions = manager.GetSessionEnumerator()?;
        let count = sessions.GetCount()?;
        Ok((0..count).filter_map(|i| sessions.GetSession(i).ok()).collect())
    }
}

/// [`AudioSubsystem`] over the Windows Core Audio APIs.
#[derive(Debug, Default, Clone, Copy)]
pub struct WasapiSubsystem;

impl WasapiSubsystem {
    pub fn new() -> Self {
        Self
    }
}

impl AudioSubsystem for WasapiSubsystem {
    fn active_endpoints(&self, direction: Direction) -> Result<Vec<Endpoint>> {
        let _com = ComGuard::init()?;
        let enumerator = enumerator().map_err(|e| DetectError::SubsystemUnavailable {
            code: Some(e.code().0),
            message: format!("Failed to create device enumerator: {e}"),
        })?;

        let collection = unsafe { enumerator.EnumAudioEndpoints(data_flow(direction), DEVICE_STATE_ACTIVE) }
            .map_err(|e| DetectError::EndpointEnumerationFailed {
                code: Some(e.code().0),
                message: format!("Failed to enumerate audio endpoints: {e}"),
            })?;
        let count = unsafe { collection.GetCount() }.map_err(|e| {
            DetectError::EndpointEnumerationFailed {
                code: Some(e.code().0),
                message: format!("Failed to count audio endpoints: {e}"),
            }
        })?;

        let mut endpoints = Vec::with_capacity(count as usize);
        for i in 0..count {
            let Ok(device) = (unsafe { collection.Item(i) }) else {
                continue;
            };
            let Some(id) = device_id(&device) else {
                continue;
            };
            let name = read_properties(&device)
                .friendly_name
                .unwrap_or_else(|| UNKNOWN_DEVICE.to_string());
            endpoints.push(Endpoint::new(id, name, direction));
        }
        Ok(endpoints)
    }

    fn device_properties(&self, endpoint: &Endpoint) -> DeviceProperties {
        let Ok(_com) = ComGuard::init() else {
            return DeviceProperties::default();
        };
        match open_device(endpoint) {
            Ok(device) => read_properties(&device),
            Err(e) => {
                tracing::debug!(endpoint = %endpoint.id, error = %e, "device_lookup_failed");
                DeviceProperties::default()
            }
        }
    }

    fn peak_level(&self, endpoint: &Endpoint) -> Option<f32> {
        let _com = ComGuard::init().ok()?;
        let device = open_device(endpoint).ok()?;
        unsafe {
            let meter: IAudioMeterInformation = device.Activate(CLSCTX_ALL, None).ok()?;
            meter.GetPeakValue().ok()
        }
    }

    fn current_padding(&self, endpoint: &Endpoint) -> Option<u32> {
        let _com = ComGuard::init().ok()?;
        let device = open_device(endpoint).ok()?;
        unsafe {
            let client: IAudioClient = device.Activate(CLSCTX_ALL, None).ok()?;
            client.GetCurrentPadding().ok()
        }
    }

    fn sessions(&self, endpoint: &Endpoint) -> Result<Vec<Result<Session>>> {
        let _com = ComGuard::init()?;
        let unreachable = |e: windows::core::Error| DetectError::PerSessionInspectionFailed {
            endpoint: endpoint.id.clone(),
            message: format!("session list unavailable: {e}"),
        };

        let device = open_device(endpoint).map_err(unreachable)?;
        let manager = session_manager(&device).map_err(unreachable)?;
        let controls = session_controls(&manager).map_err(unreachable)?;

        Ok(controls
            .iter()
            .map(|control| inspect_session(control, endpoint))
            .collect())
    }

    fn watch_sessions(
        &self,
        endpoint: &Endpoint,
        sink: SessionEventSink,
    ) -> Result<Box<dyn SessionWatch>> {
        let mta = MtaUsage::acquire()?;
        let _com = ComGuard::init()?;
        let refused = |e: windows::core::Error| DetectError::RegistrationFailed {
            endpoint: endpoint.id.clone(),
            message: e.to_string(),
        };

        let device = open_device(endpoint).map_err(refused)?;
        let manager = session_manager(&device).map_err(refused)?;

        let shared = Arc::new(WatchShared {
            endpoint: endpoint.clone(),
            sink,
            registrations: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        });

        // Enumerating first also arms OnSessionCreated delivery.
        for control in session_controls(&manager).map_err(refused)? {
            let pid = process_id(&control);
            shared.register(control, pid);
        }

        let notification: IAudioSessionNotification = SessionCreatedShim {
            shared: Arc::clone(&shared),
        }
        .into();
        if let Err(e) = unsafe { manager.RegisterSessionNotification(&notification) } {
            shared.release();
            return Err(refused(e));
        }

        tracing::debug!(endpoint = %endpoint.id, sessions = shared.len(), "session_watch_registered");
        Ok(Box::new(WasapiWatch {
            manager,
            notification,
            shared,
            registered: true,
            _mta: mta,
        }))
    }
}

struct Registration {
    control: IAudioSessionControl,
    events: IAudioSessionEvents,
}

/// State reachable from the native callbacks of one endpoint watch.
struct WatchShared {
    endpoint: Endpoint,
    sink: SessionEventSink,
    registrations: Mutex<Vec<Registration>>,
    closed: AtomicBool,
}

// SAFETY: the COM objects held here are created in the multithreaded
// apartment and are only touched under the registrations lock.
unsafe impl Send for WatchShared {}
unsafe impl Sync for WatchShared {}

impl WatchShared {
    fn register(&self, control: IAudioSessionControl, process_id: u32) {
        let mut registrations = self.registrations.lock().unwrap_or_else(|e| e.into_inner());
        if self.closed.load(Ordering::SeqCst) {
            return;
        }

        let events: IAudioSessionEvents = SessionEventsShim {
            endpoint: self.endpoint.clone(),
            process_id,
            sink: Arc::clone(&self.sink),
        }
        .into();

        match unsafe { control.RegisterAudioSessionNotification(&events) } {
            Ok(()) => registrations.push(Registration { control, events }),
            Err(e) => {
                tracing::debug!(endpoint = %self.endpoint.id, pid = process_id, error = %e, "session_events_refused");
            }
        }
    }

    fn release(&self) {
        let mut registrations = self.registrations.lock().unwrap_or_else(|e| e.into_inner());
        self.closed.store(true, Ordering::SeqCst);
        for registration in registrations.drain(..) {
            let _ = unsafe {
                registration
                    .control
                    .UnregisterAudioSessionNotification(&registration.events)
            };
        }
    }

    fn len(&self) -> usize {
        self.registrations.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

struct WasapiWatch {
    manager: IAudioSessionManager2,
    notification: IAudioSessionNotification,
    shared: Arc<WatchShared>,
    registered: bool,
    // Declared last: released only after the interfaces above.
    _mta: MtaUsage,
}

// SAFETY: see `WatchShared`; the manager and notification are MTA objects
// only used from `unregister`, and `_mta` keeps that apartment alive.
unsafe impl Send for WasapiWatch {}

impl SessionWatch for WasapiWatch {
    fn endpoint(&self) -> &Endpoint {
        &self.shared.endpoint
    }

    fn unregister(&mut self) {
        if !std::mem::take(&mut self.registered) {
            return;
        }
        let _com = ComGuard::init();
        if let Err(e) = unsafe { self.manager.UnregisterSessionNotification(&self.notification) } {
            tracing::debug!(endpoint = %self.shared.endpoint.id, error = %e, "session_unregister_failed");
        }
        self.shared.release();
    }
}

impl Drop for WasapiWatch {
    fn drop(&mut self) {
        self.unregister();
    }
}

#[implement(IAudioSessionNotification)]
struct SessionCreatedShim {
    shared: Arc<WatchShared>,
}

impl IAudioSessionNotification_Impl for SessionCreatedShim_Impl {
    fn OnSessionCreated(&self, newsession: Option<&IAudioSessionControl>) -> windows::core::Result<()> {
        let Some(control) = newsession else {
            return Ok(());
        };
        let pid = process_id(control);
        self.shared.register(control.clone(), pid);
        (self.shared.sink)(SessionEvent::SessionCreated {
            endpoint: self.shared.endpoint.clone(),
            process_id: pid,
        });
        Ok(())
    }
}

#[implement(IAudioSessionEvents)]
struct SessionEventsShim {
    endpoint: Endpoint,
    process_id: u32,
    sink: SessionEventSink,
}

impl IAudioSessionEvents_Impl for SessionEventsShim_Impl {
    fn OnDisplayNameChanged(&self, _name: &PCWSTR, _context: *const GUID) -> windows::core::Result<()> {
        Ok(())
    }

    fn OnIconPathChanged(&self, _path: &PCWSTR, _context: *const GUID) -> windows::core::Result<()> {
        Ok(())
    }

    fn OnSimpleVolumeChanged(
        &self,
        _volume: f32,
        _mute: BOOL,
        _context: *const GUID,
    ) -> windows::core::Result<()> {
        Ok(())
    }

    fn OnChannelVolumeChanged(
        &self,
        _count: u32,
        _volumes: *const f32,
        _changed: u32,
        _context: *const GUID,
    ) -> windows::core::Result<()> {
        Ok(())
    }

    fn OnGroupingParamChanged(&self, _param: *const GUID, _context: *const GUID) -> windows::core::Result<()> {
        Ok(())
    }

    fn OnStateChanged(&self, newstate: AudioSessionState) -> windows::core::Result<()> {
        (self.sink)(SessionEvent::StateChanged {
            endpoint: self.endpoint.clone(),
            process_id: self.process_id,
            state: session_state(newstate),
        });
        Ok(())
    }

    fn OnSessionDisconnected(&self, reason: AudioSessionDisconnectReason) -> windows::core::Result<()> {
        (self.sink)(SessionEvent::Disconnected {
            endpoint: self.endpoint.clone(),
            process_id: self.process_id,
            reason: disconnect_reason(reason),
        });
        Ok(())
    }
}
