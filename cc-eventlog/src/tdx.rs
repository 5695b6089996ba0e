// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Serialize};

use crate::runtime_events::{RuntimeEvent, DSTACK_RUNTIME_EVENT_TYPE};

/// This is the TDX event log format that is used to store the event log in the TDX guest.
/// It is a simplified version of the TCG event log format, containing only a single digest
/// and the raw event data. The IMR index is zero-based, unlike the TCG event log format
/// which is one-based.
///
/// As for RTMR3, the digest extended is calculated as `sha384(event_type.to_le_bytes() || b":" || event || b":" || event_payload)`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TdxEvent {
    /// IMR index, starts from 0
    pub imr: u32,
    /// Event type
    pub event_type: u32,
    /// Digest
    #[serde(with = "hex", default)]
    pub digest: Vec<u8>,
    /// Event name
    #[serde(default)]
    pub event: String,
    /// Event payload
    #[serde(with = "hex", default)]
    pub event_payload: Vec<u8>,
}

impl TdxEvent {
    /// The digest extended into the IMR. Runtime events are recomputed from
    /// their payload so a forged `digest` field is never trusted.
    pub fn digest(&self) -> Vec<u8> {
        if let Some(runtime_event) = self.to_runtime_event() {
            return runtime_event.sha384_digest().to_vec();
        }
        self.digest.clone()
    }

    pub fn is_runtime_event(&self) -> bool {
        self.event_type == DSTACK_RUNTIME_EVENT_TYPE
    }

    pub fn to_runtime_event(&self) -> Option<RuntimeEvent> {
        self.is_runtime_event().then(|| RuntimeEvent {
            event: self.event.clone(),
            payload: self.event_payload.clone(),
        })
    }
}

impl From<RuntimeEvent> for TdxEvent {
    fn from(value: RuntimeEvent) -> Self {
        TdxEvent {
            imr: 3,
            event_type: DSTACK_RUNTIME_EVENT_TYPE,
            digest: value.sha384_digest().to_vec(),
            event: value.event,
            event_payload: value.payload,
        }
    }
}

/// Collect the runtime (RTMR3) events of a TDX event log, in order.
pub fn runtime_events(event_log: &[TdxEvent]) -> Vec<RuntimeEvent> {
    event_log
        .iter()
        .filter(|event| event.imr == 3)
        .filter_map(TdxEvent::to_runtime_event)
        .collect()
}
