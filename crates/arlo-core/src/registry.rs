// ── Device registry and packet dispatch ──
//
// Devices are registered once per (id, kind) at enumeration. Inbound
// packets are resolved to zero or more routes, each naming one device;
// the device's kind decides how the properties land in the state store.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use arlo_api::{DeviceInfo, NotifyTarget, Packet, PacketHandler};
use chrono::Utc;
use dashmap::DashMap;
use serde_json::{Map, Value};
use strum::{AsRefStr, Display, EnumIter};
use tokio::sync::broadcast;
use tracing::{debug, trace};

use crate::store::StateStore;

/// Capacity of the change broadcast; slow subscribers see `Lagged`.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Resource types owned by base stations and routed by the sender id.
const BASE_RESOURCES: &[&str] = &[
    "modes",
    "activeAutomations",
    "states",
    "basestation",
    "subscriptions",
];

/// Model of the all-in-one camera that is its own base station and
/// carries ambient sensors.
pub(crate) const SELF_HOSTED_MODEL: &str = "ABC1000";
/// Model prefix of the doorbell-camera that is its own base station.
const WIRE_FREE_DOORBELL_PREFIX: &str = "AVD1001";

/// The closed set of device kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Display, AsRefStr, EnumIter)]
#[strum(serialize_all = "snake_case")]
pub enum DeviceKind {
    BaseStation,
    Camera,
    Doorbell,
    Light,
}

impl DeviceKind {
    /// Kinds a listed device registers under. Empty for unsupported types.
    pub fn classify(info: &DeviceInfo) -> Vec<Self> {
        let device_type = info.device_type.as_str();
        let model = info.model_id.as_str();
        let doorbell_cam = model.starts_with(WIRE_FREE_DOORBELL_PREFIX);

        let mut kinds = Vec::new();
        if matches!(device_type, "basestation" | "arlobridge" | "arloq" | "arloqs")
            || model == SELF_HOSTED_MODEL
            || doorbell_cam
        {
            kinds.push(Self::BaseStation);
        }
        if matches!(device_type, "camera" | "arloq" | "arloqs") || doorbell_cam {
            kinds.push(Self::Camera);
        }
        if device_type == "doorbell" {
            kinds.push(Self::Doorbell);
        }
        if device_type == "lights" {
            kinds.push(Self::Light);
        }
        kinds
    }

    /// Push-channel collection name, for kinds that have one.
    pub fn collection(self) -> Option<&'static str> {
        match self {
            Self::BaseStation => None,
            Self::Camera => Some("cameras"),
            Self::Doorbell => Some("doorbells"),
            Self::Light => Some("lights"),
        }
    }

    fn from_collection(resource_type: &str) -> Option<Self> {
        match resource_type {
            "cameras" => Some(Self::Camera),
            "doorbells" => Some(Self::Doorbell),
            "lights" => Some(Self::Light),
            _ => None,
        }
    }
}

// ── Device ───────────────────────────────────────────────────────────

/// One registered device. Attributes live in the [`StateStore`] under
/// `[id, attr]`; this record carries only identity and metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct Device {
    pub id: String,
    pub kind: DeviceKind,
    pub name: String,
    pub device_type: String,
    pub model_id: String,
    pub parent_id: Option<String>,
    pub xcloud_id: Option<String>,
    pub unique_id: Option<String>,
    pub user_id: Option<String>,
    pub firmware_version: Option<String>,
    pub hw_version: Option<String>,
}

impl Device {
    pub fn from_info(info: &DeviceInfo, kind: DeviceKind) -> Self {
        Self {
            id: info.device_id.clone(),
            kind,
            name: info.device_name.clone(),
            device_type: info.device_type.clone(),
            model_id: info.model_id.clone(),
            parent_id: info.parent_id.clone(),
            xcloud_id: info.xcloud_id.clone(),
            unique_id: info.unique_id.clone(),
            user_id: info.user_id.clone(),
            firmware_version: info.firmware_version.clone(),
            hw_version: info.hw_version.clone(),
        }
    }

    /// Address this device as the target of a command.
    pub fn notify_target(&self) -> NotifyTarget<'_> {
        NotifyTarget {
            device_id: &self.id,
            xcloud_id: self.xcloud_id.as_deref().unwrap_or_default(),
        }
    }

    pub fn has_ambient_sensors(&self) -> bool {
        self.kind == DeviceKind::Camera && self.model_id.starts_with(SELF_HOSTED_MODEL)
    }

    /// Stored attribute of this device.
    pub fn attribute(&self, store: &StateStore, attr: &str) -> Option<Value> {
        store.get_value(&[self.id.as_str(), attr])
    }

    /// Whether motion or a button press was seen within `window`.
    pub fn recent_activity(&self, store: &StateStore, window: Duration) -> bool {
        let last: i64 = store.get(&[self.id.as_str(), "lastActivity"], 0);
        if last == 0 {
            return false;
        }
        let window_ms = i64::try_from(window.as_millis()).unwrap_or(i64::MAX);
        Utc::now().timestamp_millis().saturating_sub(last) <= window_ms
    }
}

/// Published after a dispatch changed at least one stored attribute.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceEvent {
    pub device_id: String,
    pub kind: DeviceKind,
    /// Attribute names whose stored value changed.
    pub changed: Vec<String>,
}

// ── Routing ──────────────────────────────────────────────────────────

#[derive(Debug, PartialEq)]
struct Route<'a> {
    id: &'a str,
    kind: DeviceKind,
    /// Resource type for base-station routes, sub-resource for device routes.
    topic: Option<&'a str>,
    properties: &'a Value,
}

fn routes(packet: &Packet) -> Vec<Route<'_>> {
    let resource_type = packet.resource_type();

    if let Some(kind) = DeviceKind::from_collection(resource_type) {
        if let Some(id) = packet.resource_id() {
            return vec![Route {
                id,
                kind,
                topic: packet.sub_resource(),
                properties: &packet.properties,
            }];
        }
        let Some(items) = packet.properties.as_array() else {
            return Vec::new();
        };
        return items
            .iter()
            .filter_map(|item| {
                let id = item.get("serialNumber").and_then(Value::as_str)?;
                Some(Route {
                    id,
                    kind,
                    topic: None,
                    properties: item,
                })
            })
            .collect();
    }

    if BASE_RESOURCES.contains(&resource_type) {
        return packet
            .from
            .as_deref()
            .map(|id| Route {
                id,
                kind: DeviceKind::BaseStation,
                topic: Some(resource_type),
                properties: &packet.properties,
            })
            .into_iter()
            .collect();
    }

    Vec::new()
}

// ── Registry ─────────────────────────────────────────────────────────

/// All known devices, keyed by `(device id, kind)`.
pub struct DeviceRegistry {
    devices: DashMap<(String, DeviceKind), Arc<Device>>,
    store: Arc<StateStore>,
    events: broadcast::Sender<DeviceEvent>,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

impl DeviceRegistry {
    pub fn new(store: Arc<StateStore>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            devices: DashMap::new(),
            store,
            events,
            delivered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Add a device. An existing `(id, kind)` keeps its original record;
    /// returns whether the device was new.
    pub fn register(&self, device: Device) -> bool {
        let key = (device.id.clone(), device.kind);
        let mut is_new = false;
        self.devices.entry(key).or_insert_with(|| {
            is_new = true;
            debug!(id = %device.id, kind = %device.kind, name = %device.name, "device registered");
            Arc::new(device)
        });
        is_new
    }

    /// Register every supported kind of a listed device. Returns the
    /// number of new registrations.
    pub fn register_info(&self, info: &DeviceInfo) -> usize {
        DeviceKind::classify(info)
            .into_iter()
            .filter(|kind| self.register(Device::from_info(info, *kind)))
            .count()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DeviceEvent> {
        self.events.subscribe()
    }

    // ── Lookups ──────────────────────────────────────────────────────

    pub fn get(&self, id: &str, kind: DeviceKind) -> Option<Arc<Device>> {
        self.devices
            .get(&(id.to_owned(), kind))
            .map(|d| Arc::clone(d.value()))
    }

    pub fn by_name(&self, name: &str, kind: DeviceKind) -> Option<Arc<Device>> {
        self.devices
            .iter()
            .find(|entry| entry.key().1 == kind && entry.value().name == name)
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Devices of one kind, ordered by id.
    pub fn of_kind(&self, kind: DeviceKind) -> Vec<Arc<Device>> {
        let mut found: Vec<_> = self
            .devices
            .iter()
            .filter(|entry| entry.key().1 == kind)
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        found.sort_by(|a, b| a.id.cmp(&b.id));
        found
    }

    pub fn count(&self, kind: DeviceKind) -> usize {
        self.devices.iter().filter(|e| e.key().1 == kind).count()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Routes delivered to a registered device.
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    /// Packets (or collection items) that matched no registered device.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    // ── Dispatch ─────────────────────────────────────────────────────

    /// Deliver `packet` to the devices it names. Returns how many
    /// devices received it.
    pub fn dispatch(&self, packet: &Packet) -> usize {
        let routes = routes(packet);
        if routes.is_empty() {
            debug!(resource = %packet.resource, action = %packet.action, "unroutable packet dropped");
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return 0;
        }

        let mut delivered = 0;
        for route in routes {
            let Some(device) = self.get(route.id, route.kind) else {
                debug!(id = route.id, kind = %route.kind, resource = %packet.resource, "packet for unknown device dropped");
                self.dropped.fetch_add(1, Ordering::Relaxed);
                continue;
            };

            let changed = self.apply(&device, route.topic, route.properties);
            delivered += 1;
            self.delivered.fetch_add(1, Ordering::Relaxed);

            trace!(id = %device.id, kind = %device.kind, changed = changed.len(), "packet applied");
            if !changed.is_empty() {
                // No subscribers is fine.
                let _ = self.events.send(DeviceEvent {
                    device_id: device.id.clone(),
                    kind: device.kind,
                    changed,
                });
            }
        }
        delivered
    }

    fn apply(&self, device: &Device, topic: Option<&str>, props: &Value) -> Vec<String> {
        match device.kind {
            DeviceKind::BaseStation => self.apply_base(device, topic, props),
            DeviceKind::Camera | DeviceKind::Doorbell => self.apply_camera(device, topic, props),
            DeviceKind::Light => self.apply_properties(device, props),
        }
    }

    fn apply_properties(&self, device: &Device, props: &Value) -> Vec<String> {
        let Some(obj) = props.as_object() else {
            return Vec::new();
        };
        self.store.set_many(&[device.id.as_str()], clone_entries(obj))
    }

    fn apply_camera(&self, device: &Device, topic: Option<&str>, props: &Value) -> Vec<String> {
        match topic {
            None => {
                let mut changed = self.apply_properties(device, props);
                let triggered = changed.iter().any(|key| {
                    matches!(key.as_str(), "motionDetected" | "buttonPressed")
                        && props.get(key) == Some(&Value::Bool(true))
                });
                if triggered {
                    let now = Utc::now().timestamp_millis();
                    if self.store.set(&[device.id.as_str(), "lastActivity"], now) {
                        changed.push("lastActivity".into());
                    }
                }
                changed
            }
            Some("ambientSensors/history") => {
                self.set_one(device, "ambientSensors", props.clone())
            }
            Some(other) => {
                trace!(id = %device.id, sub = other, "sub-resource not handled");
                Vec::new()
            }
        }
    }

    fn apply_base(&self, device: &Device, topic: Option<&str>, props: &Value) -> Vec<String> {
        match topic {
            Some("modes") => {
                let mut changed = self.set_one(device, "modes", props.clone());
                if let Some(active) = props.get("active").and_then(Value::as_str) {
                    changed.extend(self.set_one(device, "activeMode", active));
                }
                changed
            }
            Some("activeAutomations") => {
                let modes = props
                    .get("activeModes")
                    .cloned()
                    .unwrap_or_else(|| props.clone());
                let mut changed = self.set_one(device, "activeModes", modes.clone());
                if let Some(first) = modes.as_array().and_then(|m| m.first()).and_then(Value::as_str) {
                    changed.extend(self.set_one(device, "activeMode", first));
                }
                changed
            }
            Some("subscriptions") => Vec::new(),
            _ => self.apply_properties(device, props),
        }
    }

    fn set_one(&self, device: &Device, attr: &str, value: impl Into<Value>) -> Vec<String> {
        if self.store.set(&[device.id.as_str(), attr], value) {
            vec![attr.to_owned()]
        } else {
            Vec::new()
        }
    }
}

fn clone_entries(obj: &Map<String, Value>) -> impl Iterator<Item = (String, Value)> + '_ {
    obj.iter().map(|(k, v)| (k.clone(), v.clone()))
}

impl PacketHandler for DeviceRegistry {
    fn handle(&self, packet: Packet) {
        self.dispatch(&packet);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    fn info(value: Value) -> DeviceInfo {
        serde_json::from_value(value).unwrap()
    }

    fn registry_with(devices: &[Value]) -> (Arc<StateStore>, DeviceRegistry) {
        let store = Arc::new(StateStore::in_memory());
        let registry = DeviceRegistry::new(Arc::clone(&store));
        for d in devices {
            registry.register_info(&info(d.clone()));
        }
        (store, registry)
    }

    fn cam_and_doorbell() -> (Arc<StateStore>, DeviceRegistry) {
        registry_with(&[
            json!({ "deviceId": "CAM1", "deviceType": "camera", "deviceName": "Porch", "state": "provisioned" }),
            json!({ "deviceId": "DB1", "deviceType": "doorbell", "deviceName": "Door", "state": "provisioned" }),
        ])
    }

    #[test]
    fn classification_rules() {
        let kinds = |t: &str, m: &str| {
            DeviceKind::classify(&info(json!({ "deviceId": "X", "deviceType": t, "modelId": m })))
        };
        assert_eq!(kinds("basestation", "VMB4000"), vec![DeviceKind::BaseStation]);
        assert_eq!(kinds("arlobridge", "ABB1000"), vec![DeviceKind::BaseStation]);
        assert_eq!(kinds("arloq", "VMC3040"), vec![DeviceKind::BaseStation, DeviceKind::Camera]);
        assert_eq!(kinds("camera", "ABC1000"), vec![DeviceKind::BaseStation, DeviceKind::Camera]);
        assert_eq!(kinds("doorbell", "AVD1001A"), vec![
            DeviceKind::BaseStation,
            DeviceKind::Camera,
            DeviceKind::Doorbell
        ]);
        assert_eq!(kinds("lights", "ALS1101"), vec![DeviceKind::Light]);
        assert!(kinds("siren", "SH1001").is_empty());
        assert_eq!(DeviceKind::BaseStation.to_string(), "base_station");
    }

    #[test]
    fn packet_reaches_only_named_device() {
        let (store, registry) = cam_and_doorbell();
        let mut events = registry.subscribe();

        let pkt = Packet::new("is", "cameras/CAM1", json!({ "batteryLevel": 80 }));
        assert_eq!(registry.dispatch(&pkt), 1);

        assert_eq!(store.get(&["CAM1", "batteryLevel"], 0_u32), 80);
        assert_eq!(store.get_value(&["DB1"]), None);

        let event = events.try_recv().unwrap();
        assert_eq!(event.device_id, "CAM1");
        assert_eq!(event.changed, vec!["batteryLevel"]);
    }

    #[test]
    fn unknown_device_causes_no_mutation() {
        let (store, registry) = cam_and_doorbell();

        for pkt in [
            Packet::new("is", "cameras/NOPE", json!({ "batteryLevel": 10 })),
            Packet::new("is", "doorbells/CAM1", json!({ "batteryLevel": 10 })),
            Packet::new("is", "modes", json!({ "active": "mode1" })).with_from("BASE9"),
            Packet::new("is", "sirens/S1", json!({ "on": true })),
            Packet::new("is", "modes", json!({ "active": "mode1" })),
        ] {
            assert_eq!(registry.dispatch(&pkt), 0, "{}", pkt.resource);
        }

        assert!(!store.is_dirty());
        assert_eq!(registry.dropped(), 5);
    }

    #[test]
    fn collection_response_splits_by_serial_number() {
        let (store, registry) = cam_and_doorbell();
        let pkt = Packet::new(
            "get",
            "cameras",
            json!([
                { "serialNumber": "CAM1", "signalStrength": 3 },
                { "serialNumber": "CAM9", "signalStrength": 1 },
                { "signalStrength": 2 }
            ]),
        );

        assert_eq!(registry.dispatch(&pkt), 1);
        assert_eq!(store.get(&["CAM1", "signalStrength"], 0_u32), 3);
        assert_eq!(store.get_value(&["CAM9"]), None);
    }

    #[test]
    fn motion_stamps_last_activity_on_rising_edge() {
        let (store, registry) = cam_and_doorbell();
        let cam = registry.get("CAM1", DeviceKind::Camera).unwrap();
        assert!(!cam.recent_activity(&store, Duration::from_secs(600)));

        registry.dispatch(&Packet::new("is", "cameras/CAM1", json!({ "motionDetected": true })));
        let first: i64 = store.get(&["CAM1", "lastActivity"], 0);
        assert!(first > 0);
        assert!(cam.recent_activity(&store, Duration::from_secs(600)));

        // Still true: no new stamp.
        registry.dispatch(&Packet::new("is", "cameras/CAM1", json!({ "motionDetected": true })));
        assert_eq!(store.get(&["CAM1", "lastActivity"], 0_i64), first);
    }

    #[test]
    fn doorbell_press_stamps_last_activity() {
        let (store, registry) = cam_and_doorbell();
        registry.dispatch(&Packet::new("is", "doorbells/DB1", json!({ "buttonPressed": true })));
        assert!(store.get(&["DB1", "lastActivity"], 0_i64) > 0);
    }

    #[test]
    fn ambient_history_is_filed_under_camera() {
        let (store, registry) = registry_with(&[json!({
            "deviceId": "CAM2", "deviceType": "camera", "modelId": "ABC1000", "state": "provisioned"
        })]);
        let cam = registry.get("CAM2", DeviceKind::Camera).unwrap();
        assert!(cam.has_ambient_sensors());

        let history = json!({ "temperature": [21.5], "humidity": [40] });
        let pkt = Packet::new("is", "cameras/CAM2/ambientSensors/history", history.clone());
        assert_eq!(registry.dispatch(&pkt), 1);
        assert_eq!(store.get_value(&["CAM2", "ambientSensors"]), Some(history));
        assert_eq!(store.get_value(&["CAM2", "temperature"]), None);
    }

    #[test]
    fn base_station_modes() {
        let (store, registry) = registry_with(&[json!({
            "deviceId": "BASE1", "deviceType": "basestation", "deviceName": "Hub", "state": "provisioned"
        })]);

        let pkt = Packet::new("is", "modes", json!({ "active": "mode1", "items": [] })).with_from("BASE1");
        assert_eq!(registry.dispatch(&pkt), 1);
        assert_eq!(store.get(&["BASE1", "activeMode"], String::new()), "mode1");

        let pkt = Packet::new("is", "activeAutomations", json!({ "activeModes": ["mode2"] }))
            .with_from("BASE1");
        registry.dispatch(&pkt);
        assert_eq!(store.get_value(&["BASE1", "activeModes"]), Some(json!(["mode2"])));
        assert_eq!(store.get(&["BASE1", "activeMode"], String::new()), "mode2");
    }

    #[test]
    fn reregistering_keeps_original_record() {
        let (_, registry) = cam_and_doorbell();
        let renamed = info(json!({ "deviceId": "CAM1", "deviceType": "camera", "deviceName": "Renamed" }));
        assert_eq!(registry.register_info(&renamed), 0);
        assert_eq!(registry.get("CAM1", DeviceKind::Camera).unwrap().name, "Porch");
        assert_eq!(registry.by_name("Door", DeviceKind::Doorbell).unwrap().id, "DB1");
        assert!(registry.by_name("Door", DeviceKind::Camera).is_none());
        assert_eq!(registry.count(DeviceKind::Camera), 1);
        assert_eq!(registry.len(), 2);
    }
}
