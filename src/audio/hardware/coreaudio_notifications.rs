// CoreAudio default device change notifications
//
// Registers property listeners on the system object for the default input and output
// device selectors. The listener runs on a CoreAudio notification thread and only pushes
// a `Direction` into a channel; all interpretation happens on the subscriber's task.

use std::ffi::c_void;

use coreaudio_sys::{
    kAudioHardwarePropertyDefaultInputDevice, kAudioHardwarePropertyDefaultOutputDevice,
    kAudioObjectPropertyElementMaster, kAudioObjectPropertyScopeGlobal, kAudioObjectSystemObject,
    AudioObjectAddPropertyListener, AudioObjectID, AudioObjectPropertyAddress,
    AudioObjectRemovePropertyListener, OSStatus,
};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::NativeSubscription;
use crate::audio::error::HardwareError;
use crate::audio::types::Direction;

struct ListenerContext {
    sender: mpsc::UnboundedSender<Direction>,
}

/// Registered listeners; unregistered and freed on drop
struct DefaultDeviceListeners {
    context: *mut ListenerContext,
    registered: Vec<AudioObjectPropertyAddress>,
}

// The context is only read from the notification thread and freed after the listeners
// are removed.
unsafe impl Send for DefaultDeviceListeners {}
unsafe impl Sync for DefaultDeviceListeners {}

fn default_device_address(selector: u32) -> AudioObjectPropertyAddress {
    AudioObjectPropertyAddress {
        mSelector: selector,
        mScope: kAudioObjectPropertyScopeGlobal,
        mElement: kAudioObjectPropertyElementMaster,
    }
}

/// Subscribe to default input/output device changes
pub fn subscribe() -> Result<NativeSubscription, HardwareError> {
    let (sender, receiver) = mpsc::unbounded_channel();
    let context = Box::into_raw(Box::new(ListenerContext { sender }));
    let mut listeners = DefaultDeviceListeners {
        context,
        registered: Vec::new(),
    };

    for selector in [
        kAudioHardwarePropertyDefaultInputDevice,
        kAudioHardwarePropertyDefaultOutputDevice,
    ] {
        let address = default_device_address(selector);
        let status = unsafe {
            AudioObjectAddPropertyListener(
                kAudioObjectSystemObject,
                &address,
                Some(default_device_listener),
                context as *mut c_void,
            )
        };

        if status != 0 {
            // `listeners` drops here and removes whatever was registered so far
            return Err(HardwareError::subscription_unavailable(format!(
                "AudioObjectAddPropertyListener failed with status {}",
                status
            )));
        }
        listeners.registered.push(address);
    }

    debug!("✅ Registered CoreAudio default device listeners");
    Ok(NativeSubscription::new(receiver, Some(Box::new(listeners))))
}

unsafe extern "C" fn default_device_listener(
    _in_object_id: AudioObjectID,
    in_number_addresses: u32,
    in_addresses: *const AudioObjectPropertyAddress,
    in_client_data: *mut c_void,
) -> OSStatus {
    if in_client_data.is_null() || in_addresses.is_null() {
        return 0;
    }

    let context = &*(in_client_data as *const ListenerContext);
    let addresses = std::slice::from_raw_parts(in_addresses, in_number_addresses as usize);

    for address in addresses {
        let direction = if address.mSelector == kAudioHardwarePropertyDefaultInputDevice {
            Direction::Input
        } else if address.mSelector == kAudioHardwarePropertyDefaultOutputDevice {
            Direction::Output
        } else {
            continue;
        };
        let _ = context.sender.send(direction);
    }
    0
}

impl Drop for DefaultDeviceListeners {
    fn drop(&mut self) {
        for address in &self.registered {
            let status = unsafe {
                AudioObjectRemovePropertyListener(
                    kAudioObjectSystemObject,
                    address,
                    Some(default_device_listener),
                    self.context as *mut c_void,
                )
            };
            if status != 0 {
                warn!("⚠️ Failed to remove CoreAudio listener: {}", status);
            }
        }
        unsafe {
            drop(Box::from_raw(self.context));
        }
        debug!("✅ Unregistered CoreAudio default device listeners");
    }
}
