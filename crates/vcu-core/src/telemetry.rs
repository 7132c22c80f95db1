use vcu_proto::VcuMessage;

/// Outbound MAVLink messages from the controllers.
///
/// Implementations must not block: the session drops messages while the
/// link is down.
pub trait TelemetrySink: Send + Sync {
    fn send(&self, msg: VcuMessage);

    /// Bypasses the normal lane (status text, file transfer).
    fn send_priority(&self, msg: VcuMessage) {
        self.send(msg)
    }
}

/// Sink for running without a link.
pub struct NullSink;

impl TelemetrySink for NullSink {
    fn send(&self, _msg: VcuMessage) {}
}

pub mod testing {
    use std::sync::Mutex;

    use vcu_proto::mavlink::common::{MavMessage, MavResult};
    use vcu_proto::{LfsMessage, VcuMessage};

    use super::TelemetrySink;

    /// Records every message in send order.
    #[derive(Default)]
    pub struct RecordingSink {
        sent: Mutex<Vec<(bool, VcuMessage)>>,
    }

    impl RecordingSink {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn messages(&self) -> Vec<VcuMessage> {
            self.lock().iter().map(|(_, m)| m.clone()).collect()
        }

        pub fn priority_messages(&self) -> Vec<VcuMessage> {
            self.lock().iter().filter(|(p, _)| *p).map(|(_, m)| m.clone()).collect()
        }

        pub fn clear(&self) {
            self.lock().clear();
        }

        pub fn lfs(&self) -> Vec<LfsMessage> {
            self.messages()
                .into_iter()
                .filter_map(|m| match m {
                    VcuMessage::Lfs(l) => Some(l),
                    _ => None,
                })
                .collect()
        }

        pub fn count(&self, name: &str) -> usize {
            self.lock().iter().filter(|(_, m)| m.message_name() == name).count()
        }

        /// Results of every COMMAND_ACK in order.
        pub fn acks(&self) -> Vec<MavResult> {
            self.messages()
                .into_iter()
                .filter_map(|m| match m {
                    VcuMessage::Common(MavMessage::COMMAND_ACK(a)) => Some(a.result),
                    _ => None,
                })
                .collect()
        }

        fn lock(&self) -> std::sync::MutexGuard<'_, Vec<(bool, VcuMessage)>> {
            self.sent.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
        }
    }

    impl TelemetrySink for RecordingSink {
        fn send(&self, msg: VcuMessage) {
            self.lock().push((false, msg));
        }

        fn send_priority(&self, msg: VcuMessage) {
            self.lock().push((true, msg));
        }
    }
}
