//! Simulated vehicle state.
//!
//! The orchestrator reads a snapshot of this when building decision
//! context; the vehicle-control and music agents mutate it. Everything is
//! plain data behind one mutex — the real vehicle bus lives outside the
//! core.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::event::epoch_millis;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HvacState {
    pub power: bool,
    pub temperature_c: f32,
}

impl Default for HvacState {
    fn default() -> Self {
        Self {
            power: false,
            temperature_c: 22.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct WindowState {
    /// 0 = closed, 100 = fully open.
    pub driver_open_pct: u8,
    pub passenger_open_pct: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MediaState {
    pub playing: bool,
    pub track: Option<String>,
    pub volume_pct: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NavigationState {
    pub destination: Option<String>,
    pub navigating: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct VehicleState {
    pub hvac: HvacState,
    pub windows: WindowState,
    pub media: MediaState,
    pub navigation: NavigationState,
}

/// One typed slice of the world, as handed to the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub kind: String,
    pub data: Value,
    pub timestamp_ms: u64,
}

#[derive(Default)]
pub struct WorldState {
    vehicle: Mutex<VehicleState>,
}

impl WorldState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn vehicle(&self) -> VehicleState {
        self.vehicle.lock().clone()
    }

    /// Apply a mutation under the lock.
    pub fn update<R>(&self, f: impl FnOnce(&mut VehicleState) -> R) -> R {
        f(&mut self.vehicle.lock())
    }

    /// Per-subsystem snapshots for the decision context.
    pub fn snapshot(&self) -> Vec<StateSnapshot> {
        let vehicle = self.vehicle.lock().clone();
        let now = epoch_millis();
        let slice = |kind: &str, value: Value| StateSnapshot {
            kind: kind.into(),
            data: value,
            timestamp_ms: now,
        };
        vec![
            slice("hvac", serde_json::to_value(&vehicle.hvac).unwrap_or_default()),
            slice(
                "windows",
                serde_json::to_value(&vehicle.windows).unwrap_or_default(),
            ),
            slice(
                "media",
                serde_json::to_value(&vehicle.media).unwrap_or_default(),
            ),
            slice(
                "navigation",
                serde_json::to_value(&vehicle.navigation).unwrap_or_default(),
            ),
        ]
    }
}
