use std::{sync::Arc, thread::JoinHandle};

use crossbeam::{
    channel::{Receiver, Sender},
    select,
};

use crate::{
    group::{GroupContext, OpKind, Slot},
    signal::CancelSignal,
};

/// A communicator asking for the channels of its next collective step.
pub struct Request<T> {
    pub group: Arc<GroupContext<T>>,
    pub rank: usize,
    pub step: u64,
    /// Position of this call among the group's broker-mediated collectives,
    /// present only when collective verification is enabled.
    pub sequence: Option<u64>,
    pub reply: Sender<Reply<T>>,
}

pub enum Reply<T> {
    Slot(Slot<T>),
    /// Another member issued a different collective at this position.
    Mismatch { expected: OpKind, sequence: u64 },
}

/// The sending side of the broker's three request streams.
pub struct BrokerHandle<T> {
    requests: [Sender<Request<T>>; OpKind::COUNT],
}

impl<T> Clone for BrokerHandle<T> {
    fn clone(&self) -> Self {
        Self {
            requests: self.requests.clone(),
        }
    }
}

impl<T> BrokerHandle<T> {
    pub fn sender(&self, op: OpKind) -> &Sender<Request<T>> {
        &self.requests[op.index()]
    }
}

/// The single thread that assigns step slots.
///
/// Serving every request from one thread serializes all step table updates:
/// a slot is allocated exactly once by its first claimant and removed exactly
/// once after its last.
pub struct Broker<T> {
    requests: [Receiver<Request<T>>; OpKind::COUNT],
    cancel: Arc<CancelSignal>,
    groups: Vec<Arc<GroupContext<T>>>,
}

/// Creates the request streams. The broker half is completed with
/// [`Broker::new`] once all groups exist.
pub fn channel<T>() -> (BrokerHandle<T>, [Receiver<Request<T>>; OpKind::COUNT]) {
    let (broadcast_sender, broadcast_receiver) = crossbeam::channel::unbounded();
    let (scatter_sender, scatter_receiver) = crossbeam::channel::unbounded();
    let (gather_sender, gather_receiver) = crossbeam::channel::unbounded();
    (
        BrokerHandle {
            requests: [broadcast_sender, scatter_sender, gather_sender],
        },
        [broadcast_receiver, scatter_receiver, gather_receiver],
    )
}

impl<T: Send + 'static> Broker<T> {
    pub fn new(
        requests: [Receiver<Request<T>>; OpKind::COUNT],
        cancel: Arc<CancelSignal>,
        groups: Vec<Arc<GroupContext<T>>>,
    ) -> Self {
        Self {
            requests,
            cancel,
            groups,
        }
    }

    pub fn spawn(self, name: String) -> std::io::Result<JoinHandle<()>> {
        std::thread::Builder::new()
            .name(name)
            .spawn(move || self.run())
    }

    fn run(self) {
        tracing::debug!(groups = self.groups.len(), "broker started");

        let [broadcast, scatter, gather] = &self.requests;
        loop {
            let (op, request) = select! {
                recv(broadcast) -> request => (OpKind::Broadcast, request),
                recv(scatter) -> request => (OpKind::Scatter, request),
                recv(gather) -> request => (OpKind::Gather, request),
                recv(self.cancel.observe()) -> _ => break,
            };

            // Every communicator is gone, so no request can arrive anymore.
            let Ok(request) = request else {
                break;
            };

            if !self.serve(op, request) {
                break;
            }
        }

        self.teardown();
    }

    /// Answers one request. Returns false if the cohort was canceled while
    /// replying.
    fn serve(&self, op: OpKind, request: Request<T>) -> bool {
        let reply = self.claim(op, &request);
        select! {
            send(request.reply, reply) -> result => {
                if result.is_err() {
                    tracing::trace!(group = request.group.id(), rank = request.rank, "requester is gone");
                }
                true
            }
            recv(self.cancel.observe()) -> _ => false,
        }
    }

    fn claim(&self, op: OpKind, request: &Request<T>) -> Reply<T> {
        let group = &request.group;

        if let Some(sequence) = request.sequence {
            if let Some(expected) = group.verify_sequence(sequence, op) {
                tracing::error!(
                    group = group.id(),
                    rank = request.rank,
                    %op,
                    %expected,
                    sequence,
                    "collective order mismatch",
                );
                return Reply::Mismatch { expected, sequence };
            }
        }

        tracing::trace!(
            group = group.id(),
            rank = request.rank,
            %op,
            step = request.step,
            "claim step",
        );
        Reply::Slot(group.claim_step(op, request.step))
    }

    fn teardown(&self) {
        let pending: usize = self.groups.iter().map(|g| g.pending_steps()).sum();
        for group in &self.groups {
            group.clear_steps();
        }
        tracing::debug!(abandoned_steps = pending, "broker stopped");
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test::*;

    fn broker_for(size: usize) -> (BrokerHandle<u32>, Arc<GroupContext<u32>>, Arc<CancelSignal>, JoinHandle<()>) {
        let (handle, requests) = channel();
        let (group, _) = GroupContext::world(size);
        let group = Arc::new(group);
        let cancel = Arc::new(CancelSignal::new());
        let broker = Broker::new(requests, cancel.clone(), vec![group.clone()]);
        let thread = broker.spawn("test-broker".into()).unwrap();
        (handle, group, cancel, thread)
    }

    fn request(
        handle: &BrokerHandle<u32>,
        group: &Arc<GroupContext<u32>>,
        op: OpKind,
        rank: usize,
        step: u64,
        sequence: Option<u64>,
    ) -> Reply<u32> {
        let (reply, incoming) = crossbeam::channel::bounded(1);
        handle
            .sender(op)
            .send(Request {
                group: group.clone(),
                rank,
                step,
                sequence,
                reply,
            })
            .unwrap();
        incoming.recv().unwrap()
    }

    #[test]
    fn participants_share_one_slot() -> Result<()> {
        init_logger();

        let (handle, group, cancel, thread) = broker_for(3);

        let slots: Vec<_> = (0..3)
            .map(|rank| request(&handle, &group, OpKind::Gather, rank, 0, None))
            .collect();
        assert_eq!(group.pending_steps(), 0);

        let mut senders = vec![];
        let mut receivers = vec![];
        for slot in slots {
            let Reply::Slot(Slot::Gather { sender, receiver }) = slot else {
                panic!("expected a gather slot");
            };
            senders.push(sender);
            receivers.push(receiver);
        }
        senders[1].send((11, 1))?;
        senders[2].send((21, 2))?;
        assert_eq!(receivers[0].recv()?, (11, 1));
        assert_eq!(receivers[0].recv()?, (21, 2));

        cancel.cancel();
        thread.join().unwrap();
        Ok(())
    }

    #[test]
    fn teardown_clears_abandoned_steps() {
        let (handle, group, cancel, thread) = broker_for(4);

        request(&handle, &group, OpKind::Broadcast, 0, 0, None);
        request(&handle, &group, OpKind::Scatter, 0, 0, None);
        assert_eq!(group.pending_steps(), 2);

        cancel.cancel();
        thread.join().unwrap();
        assert_eq!(group.pending_steps(), 0);
    }

    #[test]
    fn exits_when_all_handles_are_dropped() {
        let (handle, group, _cancel, thread) = broker_for(2);
        request(&handle, &group, OpKind::Broadcast, 0, 0, None);
        drop(handle);
        thread.join().unwrap();
        assert_eq!(group.pending_steps(), 0);
    }

    #[test]
    fn mismatched_sequence_is_rejected() {
        let (handle, group, cancel, thread) = broker_for(2);

        let first = request(&handle, &group, OpKind::Broadcast, 0, 0, Some(0));
        assert!(matches!(first, Reply::Slot(Slot::Broadcast { .. })));

        let second = request(&handle, &group, OpKind::Gather, 1, 0, Some(0));
        assert!(matches!(
            second,
            Reply::Mismatch {
                expected: OpKind::Broadcast,
                sequence: 0
            }
        ));

        cancel.cancel();
        thread.join().unwrap();
    }
}
