// Copyright 2024 The NativeLink Authors. All rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//    http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Port over the vendor management library. The daemon acquires the
//! underlying handle per operation, never as process-global state, so an
//! implementation must be safe to call from any task at any time.

use core::time::Duration;
use std::collections::HashMap;
use std::sync::Mutex;

use vgpu_error::{make_err, Code, Error};

use crate::node::LinkType;

/// Static description of one physical device.
#[derive(Debug, Clone, Default)]
pub struct CardInfo {
    pub minor: usize,
    pub bus_id: String,
    pub uuid: String,
    pub name: String,
    pub total_memory: u64,
    /// CUDA compute capability, `(major, minor)`.
    pub capability: (u32, u32),
}

/// Everything needed to build the topology tree in one probe round-trip.
#[derive(Debug, Clone, Default)]
pub struct ProbeSnapshot {
    pub cards: Vec<CardInfo>,
    /// Common-ancestor level for every unordered device pair `(a, b)`,
    /// `a < b`. Multi-GPU boards are already promoted to `Single`.
    pub links: Vec<(usize, usize, LinkType)>,
    pub driver_version: (u32, u32),
}

/// Live per-card sample over one sampling window.
#[derive(Debug, Clone, Default)]
pub struct CardSample {
    pub pids: Vec<u32>,
    pub used_memory: u64,
    pub utilization: u32,
}

pub trait DeviceProbe: Send + Sync {
    /// Enumerates devices and their pairwise topology. An error here puts
    /// the tree into textual-fallback mode for its whole lifetime.
    fn describe(&self) -> Result<ProbeSnapshot, Error>;

    /// Samples processes, memory and utilization for one device.
    fn sample(&self, index: usize, period: Duration) -> Result<CardSample, Error>;

    /// Reports MIG state. Implementations must answer `true` when the
    /// state cannot be determined; MIG devices are unsafe to share.
    fn mig_enabled(&self, index: usize) -> bool;

    /// Restores compute mode to default and clears ECC counters where
    /// the device supports them.
    fn reset(&self, index: usize) -> Result<(), Error>;
}

/// Probe used when no vendor library is linked in. `describe` fails so
/// the tree initializes from the textual matrix and stays passive.
#[derive(Debug, Default)]
pub struct UnavailableProbe;

impl DeviceProbe for UnavailableProbe {
    fn describe(&self) -> Result<ProbeSnapshot, Error> {
        Err(make_err!(
            Code::Unavailable,
            "no device management library available"
        ))
    }

    fn sample(&self, index: usize, _period: Duration) -> Result<CardSample, Error> {
        Err(make_err!(Code::Unavailable, "can't sample device {index}"))
    }

    fn mig_enabled(&self, _index: usize) -> bool {
        true
    }

    fn reset(&self, index: usize) -> Result<(), Error> {
        Err(make_err!(Code::Unavailable, "can't reset device {index}"))
    }
}

/// In-memory probe for tests. State is interior-mutable so tests can
/// change samples or inject reset failures mid-scenario.
#[derive(Debug, Default)]
pub struct FakeProbe {
    snapshot: ProbeSnapshot,
    state: Mutex<FakeProbeState>,
}

#[derive(Debug, Default)]
struct FakeProbeState {
    samples: HashMap<usize, CardSample>,
    mig: HashMap<usize, bool>,
    failing_resets: HashMap<usize, usize>,
    resets: Vec<usize>,
}

impl FakeProbe {
    pub fn new(snapshot: ProbeSnapshot) -> Self {
        Self {
            snapshot,
            state: Mutex::new(FakeProbeState::default()),
        }
    }

    /// A uniform machine of `count` cards with `memory` bytes each, all
    /// pairs at the given level.
    pub fn uniform(count: usize, memory: u64, level: LinkType) -> Self {
        let cards = (0..count)
            .map(|index| CardInfo {
                minor: index,
                bus_id: format!("0000:{:02x}:00.0", index + 1),
                uuid: format!("GPU-{index:08}"),
                name: format!("NVIDIA A100-SXM4-{}GB", memory >> 30),
                total_memory: memory,
                capability: (8, 0),
            })
            .collect();
        let mut links = Vec::new();
        for a in 0..count {
            for b in (a + 1)..count {
                links.push((a, b, level));
            }
        }
        Self::new(ProbeSnapshot {
            cards,
            links,
            driver_version: (470, 57),
        })
    }

    pub fn set_sample(&self, index: usize, sample: CardSample) {
        self.state.lock().unwrap().samples.insert(index, sample);
    }

    pub fn set_mig(&self, index: usize, enabled: bool) {
        self.state.lock().unwrap().mig.insert(index, enabled);
    }

    /// The next `count` resets of `index` will fail.
    pub fn fail_resets(&self, index: usize, count: usize) {
        self.state
            .lock()
            .unwrap()
            .failing_resets
            .insert(index, count);
    }

    pub fn reset_count(&self, index: usize) -> usize {
        self.state
            .lock()
            .unwrap()
            .resets
            .iter()
            .filter(|i| **i == index)
            .count()
    }
}

impl DeviceProbe for FakeProbe {
    fn describe(&self) -> Result<ProbeSnapshot, Error> {
        Ok(self.snapshot.clone())
    }

    fn sample(&self, index: usize, _period: Duration) -> Result<CardSample, Error> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .samples
            .get(&index)
            .cloned()
            .unwrap_or_default())
    }

    fn mig_enabled(&self, index: usize) -> bool {
        self.state
            .lock()
            .unwrap()
            .mig
            .get(&index)
            .copied()
            .unwrap_or(false)
    }

    fn reset(&self, index: usize) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        if let Some(remaining) = state.failing_resets.get_mut(&index) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(make_err!(Code::Internal, "injected reset failure"));
            }
        }
        state.resets.push(index);
        Ok(())
    }
}
