// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Serialize};
use sha2::{digest::Output, Digest, Sha384};

/// The event type for dstack runtime events.
/// This code is not defined in the TCG specification.
/// See https://trustedcomputinggroup.org/wp-content/uploads/PC-ClientSpecific_Platform_Profile_for_TPM_2p0_Systems_v51.pdf
pub const DSTACK_RUNTIME_EVENT_TYPE: u32 = 0x08000001;

/// Event that terminates the application-info section of the runtime log.
pub const SYSTEM_READY_EVENT: &str = "system-ready";

/// Abstraction of cross-platform runtime events.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeEvent {
    /// Event name
    pub event: String,
    /// Event payload
    #[serde(with = "hex")]
    pub payload: Vec<u8>,
}

impl RuntimeEvent {
    pub fn new(event: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            event: event.into(),
            payload: payload.into(),
        }
    }

    pub fn sha384_digest(&self) -> [u8; 48] {
        let mut out = [0u8; 48];
        out.copy_from_slice(&self.digest::<Sha384>());
        out
    }

    /// Compute the digest of the event.
    ///
    /// `H(event_type_le || ":" || event || ":" || payload)`. The event type is
    /// written little-endian, which is what a TDX guest produces natively.
    pub fn digest<H: Digest>(&self) -> Output<H> {
        H::new()
            .chain_update(DSTACK_RUNTIME_EVENT_TYPE.to_le_bytes())
            .chain_update(b":")
            .chain_update(self.event.as_bytes())
            .chain_update(b":")
            .chain_update(&self.payload)
            .finalize()
    }
}

/// Replay event logs
///
/// Starts from an all-zero register and extends it with each event digest,
/// stopping after `to_event` if given.
pub fn replay_events<H: Digest>(eventlog: &[RuntimeEvent], to_event: Option<&str>) -> Vec<u8> {
    let mut mr = vec![0u8; <H as Digest>::output_size()];
    for event in eventlog.iter() {
        mr = H::new()
            .chain_update(&mr)
            .chain_update(event.digest::<H>())
            .finalize()
            .to_vec();
        if let Some(to_event) = to_event {
            if event.event == to_event {
                break;
            }
        }
    }
    mr
}

/// Find the payload of the first event named `name` that precedes `system-ready`.
pub fn find_event_payload<'a>(eventlog: &'a [RuntimeEvent], name: &str) -> Option<&'a [u8]> {
    for event in eventlog {
        if event.event == SYSTEM_READY_EVENT {
            break;
        }
        if event.event == name {
            return Some(&event.payload);
        }
    }
    None
}
