//! Endpoint hot-plug notifications using IMMNotificationClient.
//!
//! The notification client lives on its own MTA thread for as long as the
//! [`EndpointNotifier`] is alive and forwards every endpoint change as a
//! [`TopologyEvent`].

use std::sync::mpsc;
use std::thread::JoinHandle;

use tokio::sync::broadcast;
use tracing::{debug, warn};
use windows::core::{implement, PCWSTR};
use windows::Win32::Media::Audio::{
    EDataFlow, ERole, IMMDeviceEnumerator, IMMNotificationClient, IMMNotificationClient_Impl,
    MMDeviceEnumerator, DEVICE_STATE,
};
use windows::Win32::System::Com::{
    CoCreateInstance, CoInitializeEx, CoUninitialize, CLSCTX_ALL, COINIT_MULTITHREADED,
};
// The implement macro expects windows_core in scope
#[allow(unused_imports)]
use windows_core;

use crate::media::host::{HostError, TopologyEvent};

/// Uninitializes COM for the current thread on drop.
struct ComGuard;

impl ComGuard {
    fn new() -> Result<Self, HostError> {
        unsafe {
            CoInitializeEx(None, COINIT_MULTITHREADED)
                .ok()
                .map_err(|e| HostError::Other(format!("COM init failed: {e}")))?;
        }
        Ok(Self)
    }
}

impl Drop for ComGuard {
    fn drop(&mut self) {
        unsafe {
            CoUninitialize();
        }
    }
}

#[implement(IMMNotificationClient)]
struct EndpointClient {
    sender: broadcast::Sender<TopologyEvent>,
}

impl EndpointClient {
    fn forward(&self, event: TopologyEvent) {
        debug!(?event, "endpoint notification");
        let _ = self.sender.send(event);
    }
}

fn device_id(id: &PCWSTR) -> Option<String> {
    if id.is_null() {
        return None;
    }
    unsafe { id.to_string().ok() }
}

impl IMMNotificationClient_Impl for EndpointClient_Impl {
    fn OnDeviceStateChanged(
        &self,
        pwstrdeviceid: &PCWSTR,
        _dwnewstate: DEVICE_STATE,
    ) -> windows::core::Result<()> {
        if let Some(device_id) = device_id(pwstrdeviceid) {
            self.forward(TopologyEvent::DeviceStateChanged { device_id });
        }
        Ok(())
    }

    fn OnDeviceAdded(&self, pwstrdeviceid: &PCWSTR) -> windows::core::Result<()> {
        if let Some(device_id) = device_id(pwstrdeviceid) {
            self.forward(TopologyEvent::DeviceAdded { device_id });
        }
        Ok(())
    }

    fn OnDeviceRemoved(&self, pwstrdeviceid: &PCWSTR) -> windows::core::Result<()> {
        if let Some(device_id) = device_id(pwstrdeviceid) {
            self.forward(TopologyEvent::DeviceRemoved { device_id });
        }
        Ok(())
    }

    fn OnDefaultDeviceChanged(
        &self,
        _flow: EDataFlow,
        _role: ERole,
        _pwstrdefaultdeviceid: &PCWSTR,
    ) -> windows::core::Result<()> {
        self.forward(TopologyEvent::DefaultDeviceChanged);
        Ok(())
    }

    fn OnPropertyValueChanged(
        &self,
        _pwstrdeviceid: &PCWSTR,
        _key: &windows::Win32::UI::Shell::PropertiesSystem::PROPERTYKEY,
    ) -> windows::core::Result<()> {
        Ok(())
    }
}

/// Registration of an endpoint notification client. Dropping it unregisters.
pub struct EndpointNotifier {
    stop: Option<mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl EndpointNotifier {
    /// Register for endpoint changes of every data flow.
    pub fn register(sender: broadcast::Sender<TopologyEvent>) -> Result<Self, HostError> {
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let (ready_tx, ready_rx) = mpsc::channel::<Result<(), HostError>>();

        let thread = std::thread::Builder::new()
            .name("endpoint-notifier".to_string())
            .spawn(move || {
                let registration = ComGuard::new().and_then(|com| {
                    let enumerator: IMMDeviceEnumerator = unsafe {
                        CoCreateInstance(&MMDeviceEnumerator, None, CLSCTX_ALL)
                            .map_err(|e| HostError::Other(e.to_string()))?
                    };
                    let client: IMMNotificationClient = EndpointClient { sender }.into();
                    unsafe {
                        enumerator
                            .RegisterEndpointNotificationCallback(&client)
                            .map_err(|e| HostError::Other(e.to_string()))?;
                    }
                    Ok((com, enumerator, client))
                });

                let (_com, enumerator, client) = match registration {
                    Ok(registered) => {
                        let _ = ready_tx.send(Ok(()));
                        registered
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };

                // Block until the notifier is dropped
                let _ = stop_rx.recv();
                unsafe {
                    if let Err(e) = enumerator.UnregisterEndpointNotificationCallback(&client) {
                        warn!(error = %e, "failed to unregister endpoint notifications");
                    }
                }
            })
            .map_err(|e| HostError::Other(e.to_string()))?;

        ready_rx
            .recv()
            .map_err(|_| HostError::Other("notifier thread exited".to_string()))??;
        debug!("endpoint notifications registered");

        Ok(Self {
            stop: Some(stop_tx),
            thread: Some(thread),
        })
    }
}

impl Drop for EndpointNotifier {
    fn drop(&mut self) {
        drop(self.stop.take());
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}
