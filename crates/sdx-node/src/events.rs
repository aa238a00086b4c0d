use std::sync::mpsc::{Receiver, Sender};
use std::sync::Arc;

use sdx_core::{PeerId, SchemaId};

/// A record that has landed in the local store.
///
/// Emitted by the fetcher and the exchange push path; consumed by the
/// subscription delivery pump. The event channel is one-way on purpose: it
/// breaks the cycle back into the announcement bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordEnvelope {
    pub cid: String,
    pub schema: SchemaId,
    pub publisher: PeerId,
    pub received_at: i64,
    pub bytes: Vec<u8>,
}

/// One arrival notification.
pub type RecordArrived = Arc<RecordEnvelope>;

pub type ArrivedSender = Sender<RecordArrived>;
pub type ArrivedReceiver = Receiver<RecordArrived>;

#[cfg(test)]
mod tests {
    use super::RecordEnvelope;
    use sdx_core::{PeerId, SchemaId};
    use std::sync::mpsc::channel;
    use std::sync::Arc;

    #[test]
    fn arrivals_flow_through_the_channel() {
        let (tx, rx) = channel();
        let envelope = Arc::new(RecordEnvelope {
            cid: "bcid".to_string(),
            schema: SchemaId::from("OMM"),
            publisher: PeerId([1; 32]),
            received_at: 1_000,
            bytes: vec![1, 2, 3],
        });
        tx.send(Arc::clone(&envelope)).expect("send should succeed");
        let got = rx.recv().expect("recv should succeed");
        assert_eq!(got, envelope);
    }
}
