// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/

//! A tenant slice: a controller endpoint, a rate budget, and the
//! virtual switches presented to that controller.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::types::SliceId;
use crate::virtual_switch::VirtualSwitch;

pub struct Slice {
    pub id: SliceId,
    pub controller_host: String,
    pub controller_port: u16,
    /// Packet rate budget, enforced by the per-slice drop meter on each
    /// physical switch.
    pub max_rate_pps: u32,
    started: AtomicBool,
    pub switches: Vec<Arc<VirtualSwitch>>,
}

impl Slice {
    pub fn new(
        id: SliceId,
        controller_host: String,
        controller_port: u16,
        max_rate_pps: u32,
        switches: Vec<Arc<VirtualSwitch>>,
    ) -> Slice {
        Slice {
            id,
            controller_host,
            controller_port,
            max_rate_pps,
            started: AtomicBool::new(false),
            switches,
        }
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Relaxed)
    }

    pub fn set_started(&self, started: bool) {
        self.started.store(started, Ordering::Relaxed);
    }
}
