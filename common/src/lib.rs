// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/

//! Types and helpers shared by every crate in the hypervisor workspace.

pub mod logging;
pub mod network;

/// The TCP port on which the hypervisor accepts OpenFlow connections from
/// physical switches, per the IANA assignment for OpenFlow.
pub const DEFAULT_LISTEN_PORT: u16 = 6653;

/// Return the current wall-clock time in milliseconds since the epoch.
pub fn timestamp_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
