use async_trait::async_trait;
use btleplug::{
    api::{
        BDAddr, Central, CentralEvent, CentralState, Manager as _, Peripheral as _,
        PeripheralProperties, ScanFilter,
    },
    platform::{Adapter, Manager, Peripheral, PeripheralId},
};
use futures::stream::StreamExt;
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::{sync::Mutex, task::JoinHandle, time::interval};
use tracing::{debug, info, trace, warn};

use crate::{
    error::{LeashError, Result},
    radio::{EventSink, Radio, RadioEvent},
    types::{Advertisement, Rssi, Target, TargetFilter, WatcherConfig},
};

/// [`Radio`] backed by the system Bluetooth stack through btleplug
///
/// Uses the first adapter the platform reports.
#[derive(Default)]
pub struct BtleplugRadio {
    session: Mutex<Option<Session>>,
}

struct Session {
    _manager: Manager,
    central: Adapter,
    tracking: Arc<Mutex<Tracking>>,
    events: EventSink,
    rssi_interval: Duration,
    _pump: TaskGuard,
    sampler: Option<TaskGuard>,
}

/// Background task that is aborted when its guard is dropped
struct TaskGuard(JoinHandle<()>);

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

impl Session {
    async fn release_link(&mut self) {
        self.sampler = None;

        let linked = self.tracking.lock().await.linked.take();
        if let Some(peripheral) = linked {
            debug!("Disconnecting {}", peripheral.address());
            if let Err(e) = peripheral.disconnect().await {
                debug!("Disconnect failed: {}", e);
            }
        }
    }
}

/// Discovery bookkeeping shared with the adapter event pump
struct Tracking {
    filter: TargetFilter,
    scanning: bool,
    reported: bool,
    peripherals: HashMap<BDAddr, Peripheral>,
    linked: Option<Peripheral>,
}

impl BtleplugRadio {
    /// Create a radio; the adapter is opened on activation
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Radio for BtleplugRadio {
    async fn request_activation(&self, events: EventSink, config: &WatcherConfig) -> Result<()> {
        let mut slot = self.session.lock().await;
        if let Some(mut previous) = slot.take() {
            previous.release_link().await;
        }

        info!("Opening Bluetooth adapter");
        let manager = Manager::new().await?;
        let adapters = manager.adapters().await?;
        let central = adapters
            .into_iter()
            .next()
            .ok_or(LeashError::AdapterNotFound)?;

        let tracking = Arc::new(Mutex::new(Tracking {
            filter: config.target.clone(),
            scanning: false,
            reported: false,
            peripherals: HashMap::new(),
            linked: None,
        }));

        let stream = central.events().await?;
        let pump = TaskGuard(tokio::spawn(pump_events(
            central.clone(),
            stream,
            tracking.clone(),
            events.clone(),
        )));

        // Stored before the next await so a cancelled activation leaves nothing running.
        *slot = Some(Session {
            _manager: manager,
            central: central.clone(),
            tracking,
            events: events.clone(),
            rssi_interval: config.rssi_interval(),
            _pump: pump,
            sampler: None,
        });

        match central.adapter_state().await? {
            CentralState::PoweredOn => {
                events.emit(RadioEvent::Ready);
            }
            CentralState::PoweredOff => {
                events.emit(RadioEvent::PoweredOff);
            }
            state => debug!("Adapter state {:?}, waiting for update", state),
        }
        Ok(())
    }

    async fn request_deactivation(&self) -> Result<()> {
        let Some(mut session) = self.session.lock().await.take() else {
            return Ok(());
        };

        session.release_link().await;

        let was_scanning = std::mem::take(&mut session.tracking.lock().await.scanning);
        if was_scanning {
            session.central.stop_scan().await?;
        }

        info!("Bluetooth adapter released");
        Ok(())
    }

    async fn scan(&self) -> Result<()> {
        let mut slot = self.session.lock().await;
        let session = slot.as_mut().ok_or(LeashError::NotActive)?;
        session.release_link().await;

        let services = {
            let mut tracking = session.tracking.lock().await;
            tracking.scanning = true;
            tracking.reported = false;
            tracking.filter.services.clone()
        };

        session.central.start_scan(ScanFilter { services }).await?;
        debug!("Scan started");
        Ok(())
    }

    async fn stop_scan(&self) -> Result<()> {
        let slot = self.session.lock().await;
        let session = slot.as_ref().ok_or(LeashError::NotActive)?;

        session.tracking.lock().await.scanning = false;
        session.central.stop_scan().await?;
        debug!("Scan stopped");
        Ok(())
    }

    async fn connect(&self, target: &Target) -> Result<()> {
        let (central, tracking) = {
            let slot = self.session.lock().await;
            let session = slot.as_ref().ok_or(LeashError::NotActive)?;
            (session.central.clone(), session.tracking.clone())
        };

        let peripheral = find_peripheral(&central, &tracking, target.address).await?;
        peripheral.connect().await.map_err(|e| match e {
            btleplug::Error::PermissionDenied => LeashError::Unauthorized,
            e => LeashError::ConnectionFailed(e.to_string()),
        })?;
        info!("Linked with {}", target);

        // The session may have ended while the link came up.
        let mut slot = self.session.lock().await;
        let Some(session) = slot.as_mut() else {
            let _ = peripheral.disconnect().await;
            return Err(LeashError::NotActive);
        };

        session.tracking.lock().await.linked = Some(peripheral.clone());
        session.sampler = Some(TaskGuard(tokio::spawn(sample_signal(
            peripheral,
            session.tracking.clone(),
            session.events.clone(),
            session.rssi_interval,
        ))));
        Ok(())
    }
}

async fn find_peripheral(
    central: &Adapter,
    tracking: &Mutex<Tracking>,
    address: BDAddr,
) -> Result<Peripheral> {
    if let Some(peripheral) = tracking.lock().await.peripherals.get(&address) {
        return Ok(peripheral.clone());
    }

    central
        .peripherals()
        .await?
        .into_iter()
        .find(|p| p.address() == address)
        .ok_or_else(|| LeashError::TargetUnknown(address.to_string()))
}

/// Forward adapter events until the stream ends or the task is aborted
async fn pump_events(
    central: Adapter,
    mut stream: std::pin::Pin<Box<dyn futures::Stream<Item = CentralEvent> + Send>>,
    tracking: Arc<Mutex<Tracking>>,
    events: EventSink,
) {
    while let Some(event) = stream.next().await {
        let delivered = match event {
            CentralEvent::StateUpdate(state) => radio_state_event(state).is_none_or(|e| events.emit(e)),
            CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => {
                match discover(&central, &tracking, &id).await {
                    Some(target) => {
                        info!("Found {}", target);
                        events.emit(RadioEvent::TargetFound(target))
                    }
                    None => true,
                }
            }
            CentralEvent::DeviceDisconnected(id) => {
                let mut tracking = tracking.lock().await;
                if tracking.linked.as_ref().is_some_and(|p| p.id() == id) {
                    tracking.linked = None;
                    warn!("Link lost");
                    events.emit(RadioEvent::LinkLost)
                } else {
                    true
                }
            }
            other => {
                trace!("Adapter event: {:?}", other);
                true
            }
        };

        if !delivered {
            break;
        }
    }
    debug!("Adapter event stream closed");
}

/// Match a discovered peripheral against the filter, at most once per scan
async fn discover(central: &Adapter, tracking: &Mutex<Tracking>, id: &PeripheralId) -> Option<Target> {
    {
        let tracking = tracking.lock().await;
        if !tracking.scanning || tracking.reported {
            return None;
        }
    }

    let peripheral = central.peripheral(id).await.ok()?;
    let properties = peripheral.properties().await.ok()??;

    let mut tracking = tracking.lock().await;
    if !tracking.scanning || tracking.reported {
        return None;
    }
    let target = match_properties(&tracking.filter, &properties)?;
    tracking.reported = true;
    tracking.peripherals.insert(target.address, peripheral);
    Some(target)
}

fn match_properties(filter: &TargetFilter, properties: &PeripheralProperties) -> Option<Target> {
    let manufacturer_ids: Vec<u16> = properties.manufacturer_data.keys().copied().collect();
    let advertisement = Advertisement {
        address: Some(properties.address),
        local_name: properties.local_name.as_deref(),
        services: &properties.services,
        manufacturer_ids: &manufacturer_ids,
    };

    filter.matches(&advertisement).then(|| Target {
        address: properties.address,
        name: properties.local_name.clone(),
        rssi: properties.rssi.map(Rssi),
    })
}

const fn radio_state_event(state: CentralState) -> Option<RadioEvent> {
    match state {
        CentralState::PoweredOn => Some(RadioEvent::Ready),
        CentralState::PoweredOff => Some(RadioEvent::PoweredOff),
        _ => None,
    }
}

/// Report signal strength of a linked peripheral until the link drops
async fn sample_signal(
    peripheral: Peripheral,
    tracking: Arc<Mutex<Tracking>>,
    events: EventSink,
    period: Duration,
) {
    let mut ticker = interval(period);

    loop {
        ticker.tick().await;

        if !peripheral.is_connected().await.unwrap_or(false) {
            let mut tracking = tracking.lock().await;
            if tracking.linked.as_ref().is_some_and(|p| p.id() == peripheral.id()) {
                tracking.linked = None;
                warn!("Link to {} dropped", peripheral.address());
                events.emit(RadioEvent::LinkLost);
            }
            break;
        }

        match peripheral.properties().await {
            Ok(Some(properties)) => {
                if let Some(rssi) = properties.rssi {
                    if !events.emit(RadioEvent::SignalSample(Rssi(rssi))) {
                        break;
                    }
                }
            }
            Ok(None) => {}
            Err(e) => debug!("Failed to read signal strength: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PEBBLE_MANUFACTURER_ID;

    fn properties(name: Option<&str>, manufacturer_id: Option<u16>) -> PeripheralProperties {
        let mut properties = PeripheralProperties::default();
        properties.address = BDAddr::from([0x00, 0x17, 0xE9, 0x10, 0x20, 0x30]);
        properties.local_name = name.map(str::to_string);
        properties.rssi = Some(-71);
        if let Some(id) = manufacturer_id {
            properties.manufacturer_data.insert(id, vec![0x01]);
        }
        properties
    }

    #[tokio::test]
    async fn test_radio_requires_activation() {
        let radio = BtleplugRadio::new();
        assert!(matches!(radio.scan().await, Err(LeashError::NotActive)));
        assert!(matches!(radio.stop_scan().await, Err(LeashError::NotActive)));
        assert!(radio.request_deactivation().await.is_ok());
    }

    #[tokio::test]
    async fn test_task_guard_aborts_on_drop() {
        let (sender, receiver) = tokio::sync::oneshot::channel::<()>();
        let guard = TaskGuard(tokio::spawn(async move {
            std::future::pending::<()>().await;
            drop(sender);
        }));

        drop(guard);
        // The sender is dropped with the aborted task, never sent on.
        assert!(receiver.await.is_err());
    }

    #[test]
    fn test_match_by_name() {
        let filter = TargetFilter::default();
        let target = match_properties(&filter, &properties(Some("Pebble Time 3C4A"), None))
            .expect("name prefix matches");

        assert_eq!(target.name.as_deref(), Some("Pebble Time 3C4A"));
        assert_eq!(target.rssi, Some(Rssi(-71)));
        assert_eq!(target.address, BDAddr::from([0x00, 0x17, 0xE9, 0x10, 0x20, 0x30]));
    }

    #[test]
    fn test_match_by_manufacturer() {
        let filter = TargetFilter::default();
        assert!(match_properties(&filter, &properties(None, Some(PEBBLE_MANUFACTURER_ID))).is_some());
        assert!(match_properties(&filter, &properties(Some("Fitbit"), Some(0x004C))).is_none());
    }

    #[test]
    fn test_radio_state_events() {
        assert_eq!(radio_state_event(CentralState::PoweredOn), Some(RadioEvent::Ready));
        assert_eq!(radio_state_event(CentralState::PoweredOff), Some(RadioEvent::PoweredOff));
        assert_eq!(radio_state_event(CentralState::Unknown), None);
    }
}
