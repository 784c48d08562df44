//! 状態機械のプロパティテスト
//!
//! ホストイベントとプラグインステータスの任意の並びに対して、
//! 同時呼び出しは高々1つ・フェーズは単調増加・終端状態ではバッファが空、
//! の3つが常に成り立つことを確認します。

use proptest::prelude::*;

use veil_dso::dso::PluginStatus;
use veil_dso::http::{
    Action, Buffer, Direction, HeaderMap, Next, Outcome, ProcessorState, WatermarkEvent,
};

#[derive(Debug, Clone)]
enum Event {
    Headers { end_stream: bool },
    Data { len: usize, end_stream: bool },
    Trailers,
    /// Raw status for the outstanding call (6 is outside the ABI)
    Status(u64),
    LocalReply,
}

fn arb_event() -> impl Strategy<Value = Event> {
    prop_oneof![
        1 => any::<bool>().prop_map(|end_stream| Event::Headers { end_stream }),
        2 => (0usize..48, any::<bool>()).prop_map(|(len, end_stream)| Event::Data { len, end_stream }),
        1 => Just(Event::Trailers),
        3 => (0u64..7).prop_map(Event::Status),
        1 => Just(Event::LocalReply),
    ]
}

fn arb_direction() -> impl Strategy<Value = Direction> {
    prop_oneof![Just(Direction::Decode), Just(Direction::Encode)]
}

/// Filter shell reduced to its effect on the state machine
struct Model {
    state: ProcessorState,
    calls_started: usize,
}

impl Model {
    fn call_started(&mut self, was_in_plugin: bool) {
        assert!(!was_in_plugin, "call started while another was outstanding");
        self.calls_started += 1;
    }

    fn action(&mut self, action: Action, was_in_plugin: bool) {
        match action {
            Action::Call(_) => self.call_started(was_in_plugin),
            Action::Buffered(WatermarkEvent::AboveHigh)
                if self.state.state() == veil_dso::http::FilterState::WaitingAllData =>
            {
                self.state.enter_local_reply();
            }
            _ => {}
        }
    }

    fn drain_pending(&mut self) {
        let was_in_plugin = self.state.in_plugin();
        match self.state.next_pending() {
            Next::Call(_) => self.call_started(was_in_plugin),
            Next::Overflow => {
                self.state.enter_local_reply();
            }
            Next::Idle => {}
        }
    }

    fn apply(&mut self, event: &Event) {
        let was_in_plugin = self.state.in_plugin();
        match event {
            Event::Headers { end_stream } => {
                let headers = HeaderMap::from_pairs([("host", "example.com")]).into_shared();
                let action = self.state.on_headers(headers, *end_stream);
                self.action(action, was_in_plugin);
            }
            Event::Data { len, end_stream } => {
                let mut data = Buffer::from_slice(&vec![b'd'; *len]);
                let action = self.state.on_data(&mut data, *end_stream);
                self.action(action, was_in_plugin);
            }
            Event::Trailers => {
                let trailers = HeaderMap::from_pairs([("x-trailer", "1")]).into_shared();
                let action = self.state.on_trailers(trailers);
                self.action(action, was_in_plugin);
            }
            Event::Status(raw) => match self.state.handle_status(PluginStatus::from_raw(*raw)) {
                Outcome::Unexpected if was_in_plugin => {
                    self.state.enter_local_reply();
                }
                Outcome::Done(_) | Outcome::Stopped => self.drain_pending(),
                _ => {}
            },
            Event::LocalReply => {
                self.state.enter_local_reply();
            }
        }
    }
}

proptest! {
    #[test]
    fn state_machine_invariants(
        direction in arb_direction(),
        limit in prop_oneof![Just(0u32), 8u32..64],
        events in proptest::collection::vec(arb_event(), 1..40),
    ) {
        let mut model = Model {
            state: ProcessorState::new(direction, limit),
            calls_started: 0,
        };
        let mut last_phase = model.state.phase();

        for event in &events {
            model.apply(event);

            let s = &model.state;
            prop_assert!(s.phase() >= last_phase, "phase went back on {:?}", event);
            last_phase = s.phase();

            if s.state().is_terminal() {
                prop_assert_eq!(s.buffered_len(), 0);
                prop_assert_eq!(s.do_data_len(), 0);
            }
            if s.in_plugin() {
                prop_assert!(s.state().is_processing());
            }
            prop_assert_eq!(s.plugin_calls() as usize, model.calls_started);
        }
    }

    #[test]
    fn buffered_body_is_delivered_whole(chunks in proptest::collection::vec(1usize..32, 1..8)) {
        let mut s = ProcessorState::new(Direction::Decode, 0);
        s.on_headers(HeaderMap::from_pairs([("host", "a")]).into_shared(), false);
        s.handle_status(Some(PluginStatus::StopAndBuffer));

        let total: usize = chunks.iter().sum();
        let last = chunks.len() - 1;
        for (i, len) in chunks.iter().enumerate() {
            let mut data = Buffer::from_slice(&vec![b'x'; *len]);
            let action = s.on_data(&mut data, i == last);
            if i < last {
                prop_assert_eq!(action, Action::Buffered(WatermarkEvent::None));
            } else {
                match action {
                    Action::Call(veil_dso::http::PluginCall::Data { length, end_stream, .. }) => {
                        prop_assert_eq!(length as usize, total);
                        prop_assert!(end_stream);
                    }
                    other => prop_assert!(false, "expected a data call, got {:?}", other),
                }
            }
        }
        prop_assert_eq!(s.plugin_calls(), 2);
    }
}
