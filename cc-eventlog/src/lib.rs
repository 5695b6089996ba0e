// SPDX-FileCopyrightText: © 2024 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Confidential-computing event logs: dstack runtime events and the TDX
//! event-log entries that carry them.

pub use runtime_events::{
    find_event_payload, replay_events, RuntimeEvent, DSTACK_RUNTIME_EVENT_TYPE,
    SYSTEM_READY_EVENT,
};
pub use tdx::TdxEvent;

mod runtime_events;
pub mod tdx;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_event_log_json() {
        let log = r#"[
            {"imr":0,"event_type":1,"digest":"aabb","event":"","event_payload":""},
            {"imr":3,"event_type":134217729,"digest":"","event":"app-id","event_payload":"0102"},
            {"imr":3,"event_type":134217729,"event":"instance-id","event_payload":"0304"}
        ]"#;
        let events: Vec<TdxEvent> = serde_json::from_str(log).unwrap();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].digest(), vec![0xaa, 0xbb]);

        let runtime = tdx::runtime_events(&events);
        assert_eq!(
            runtime,
            vec![
                RuntimeEvent::new("app-id", vec![1, 2]),
                RuntimeEvent::new("instance-id", vec![3, 4]),
            ]
        );
        // Runtime digests are recomputed, never read from the log.
        assert_eq!(events[1].digest(), runtime[0].sha384_digest().to_vec());
    }

    #[test]
    fn runtime_event_json_shape() {
        let event = RuntimeEvent::new("compose-hash", vec![0xde, 0xad]);
        insta::assert_snapshot!(
            serde_json::to_string(&event).unwrap(),
            @r#"{"event":"compose-hash","payload":"dead"}"#
        );
    }
}
