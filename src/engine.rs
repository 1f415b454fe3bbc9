//! The URB transaction engine
//!
//! One [`UrbEngine`] exists per TCP connection. It owns the seqnum
//! counter and the in-flight transaction table, and it is the only
//! code which builds CMD_SUBMIT/CMD_UNLINK frames or routes RET_SUBMIT
//! completions. It holds no sockets: frames leave through a
//! [`FrameSink`], and completed frames arrive through
//! [`UrbEngine::on_submit_reply`], so the whole protocol state machine
//! can be driven from tests without any I/O.
//!
//! The owner is expected to wrap the engine in a mutex and hold the
//! lock across each call; seqnum order and frame-write order then agree
//! with caller invocation order.

use crate::error::Error;
use crate::wire::{CmdSubmit, CmdUnlink, RetSubmit, RetUnlink, UrbDirection};
use log::{debug, warn};
use std::collections::BTreeMap;
use tokio::sync::oneshot;

/// Where encoded frames go.
///
/// The TCP implementation queues onto the connection's single writer
/// task; unit tests substitute a recorder or a mock.
pub trait FrameSink {
    /// Hand one complete frame to the transport.
    ///
    /// # Errors
    ///
    /// `SendFailed` if the transport is gone.
    fn send_frame(&self, frame: &[u8]) -> Result<(), Error>;
}

/// How one transaction ended
#[derive(Debug, PartialEq, Eq)]
pub enum Completion {
    /// RET_SUBMIT with status 0; the payload is empty for OUT transfers
    Data(Vec<u8>),
    /// RET_SUBMIT with a non-zero URB status
    Failed(i32),
    /// Cancelled by [`UrbEngine::unlink`]
    Unlinked,
    /// The connection died underneath the transaction
    Disconnected,
}

/// The body of a submission
pub enum SubmitBody<'a> {
    /// IN transfer of up to this many bytes
    In(u32),
    /// OUT transfer of exactly these bytes
    Out(&'a [u8]),
}

struct InFlight {
    devid: u32,
    ep: u32,
    direction: UrbDirection,
    waiter: oneshot::Sender<Completion>,
}

pub struct UrbEngine {
    next_seqnum: u32,
    in_flight: BTreeMap<u32, InFlight>,
    /// Unlinked seqnums whose late RET_SUBMIT may still arrive; the
    /// direction is kept so the transport can frame such a reply
    unlinked: BTreeMap<u32, UrbDirection>,
    /// seqnum of each CMD_UNLINK we sent, mapped to its victim
    pending_unlinks: BTreeMap<u32, u32>,
}

impl Default for UrbEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl UrbEngine {
    #[must_use]
    pub fn new() -> Self {
        Self {
            next_seqnum: 1,
            in_flight: BTreeMap::new(),
            unlinked: BTreeMap::new(),
            pending_unlinks: BTreeMap::new(),
        }
    }

    /// Seqnums start at 1 and are never reused; the counter running out
    /// ends the connection.
    fn take_seqnum(&mut self) -> Result<u32, Error> {
        if self.next_seqnum == u32::MAX {
            return Err(Error::SeqnumExhausted);
        }
        let seqnum = self.next_seqnum;
        self.next_seqnum += 1;
        Ok(seqnum)
    }

    /// Submit one URB and return the rendezvous for its completion.
    ///
    /// The frame is handed to the sink before the transaction is
    /// recorded, under the caller's lock, so a completion can never
    /// race the bookkeeping. Dropping the receiver is fine: the
    /// completion is then discarded on arrival, which is exactly what a
    /// fire-and-forget OUT wants.
    pub fn submit<S: FrameSink>(
        &mut self,
        devid: u32,
        ep: u32,
        setup: [u8; 8],
        body: SubmitBody<'_>,
        sink: &S,
    ) -> Result<(u32, oneshot::Receiver<Completion>), Error> {
        let seqnum = self.take_seqnum()?;
        let (direction, transfer_buffer_length, payload) = match body {
            SubmitBody::In(length) => (UrbDirection::In, length, &[][..]),
            SubmitBody::Out(data) => {
                (UrbDirection::Out, data.len() as u32, data)
            }
        };
        let cmd = CmdSubmit {
            seqnum,
            devid,
            direction,
            ep,
            transfer_flags: 0,
            transfer_buffer_length,
            start_frame: 0,
            number_of_packets: 0,
            interval: 0,
            setup,
        };
        sink.send_frame(&cmd.encode_with_payload(payload))?;

        let (tx, rx) = oneshot::channel();
        self.in_flight.insert(
            seqnum,
            InFlight {
                devid,
                ep,
                direction,
                waiter: tx,
            },
        );
        debug!("submit seqnum {seqnum} devid {devid:#x} ep {ep}");
        Ok((seqnum, rx))
    }

    /// Cancel an in-flight transaction.
    ///
    /// Emits CMD_UNLINK, removes the transaction from the table, and
    /// wakes its waiter with [`Completion::Unlinked`]. Unknown seqnums
    /// (already completed) are a no-op.
    pub fn unlink<S: FrameSink>(
        &mut self,
        seqnum: u32,
        sink: &S,
    ) -> Result<(), Error> {
        let Some(entry) = self.in_flight.remove(&seqnum) else {
            return Ok(());
        };
        let unlink_seqnum = self.take_seqnum()?;
        let cmd = CmdUnlink {
            seqnum: unlink_seqnum,
            devid: entry.devid,
            direction: entry.direction,
            ep: entry.ep,
            unlink_seqnum: seqnum,
        };
        self.unlinked.insert(seqnum, entry.direction);
        self.pending_unlinks.insert(unlink_seqnum, seqnum);
        let _ = entry.waiter.send(Completion::Unlinked);
        debug!("unlink seqnum {seqnum} as {unlink_seqnum}");
        sink.send_frame(&cmd.encode())
    }

    /// Direction of the URB a RET_SUBMIT refers to, so the transport
    /// can size its trailing payload. Covers both live and unlinked
    /// transactions; `None` means the seqnum is unknown.
    #[must_use]
    pub fn direction_of(&self, seqnum: u32) -> Option<UrbDirection> {
        self.in_flight
            .get(&seqnum)
            .map(|e| e.direction)
            .or_else(|| self.unlinked.get(&seqnum).copied())
    }

    /// Route one RET_SUBMIT to its waiter.
    ///
    /// Replies for unlinked transactions are dropped quietly; replies
    /// for unknown seqnums are logged as spurious and dropped. Neither
    /// is fatal.
    pub fn on_submit_reply(&mut self, reply: RetSubmit, payload: Vec<u8>) {
        let seqnum = reply.seqnum;
        if let Some(entry) = self.in_flight.remove(&seqnum) {
            let completion = if reply.status != 0 {
                Completion::Failed(reply.status)
            } else {
                Completion::Data(payload)
            };
            let _ = entry.waiter.send(completion);
        } else if self.unlinked.remove(&seqnum).is_some() {
            debug!("late reply for unlinked seqnum {seqnum} dropped");
        } else {
            warn!("spurious response: unknown seqnum {seqnum}");
        }
    }

    /// Consume one RET_UNLINK acknowledgement
    pub fn on_unlink_reply(&mut self, reply: RetUnlink) {
        if let Some(victim) = self.pending_unlinks.remove(&reply.seqnum) {
            self.unlinked.remove(&victim);
            debug!(
                "unlink of seqnum {victim} acknowledged, status {}",
                reply.status
            );
        } else {
            warn!(
                "spurious response: unknown unlink seqnum {}",
                reply.seqnum
            );
        }
    }

    /// Wake every waiter with [`Completion::Disconnected`]; called when
    /// the socket dies.
    pub fn fault_all(&mut self) {
        for (_, entry) in std::mem::take(&mut self.in_flight) {
            let _ = entry.waiter.send(Completion::Disconnected);
        }
        self.unlinked.clear();
        self.pending_unlinks.clear();
    }

    #[must_use]
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{decode_command, CommandFrame};
    use mockall::mock;
    use std::cell::RefCell;

    #[derive(Default)]
    struct FakeSink {
        frames: RefCell<Vec<Vec<u8>>>,
        failing: bool,
    }

    impl FakeSink {
        fn frame(&self, n: usize) -> CommandFrame {
            decode_command(&self.frames.borrow()[n]).unwrap()
        }

        fn payload_of(&self, n: usize) -> Vec<u8> {
            self.frames.borrow()[n][48..].to_vec()
        }

        fn count(&self) -> usize {
            self.frames.borrow().len()
        }
    }

    impl FrameSink for FakeSink {
        fn send_frame(&self, frame: &[u8]) -> Result<(), Error> {
            if self.failing {
                return Err(Error::SendFailed);
            }
            self.frames.borrow_mut().push(frame.to_vec());
            Ok(())
        }
    }

    mock! {
        Sink {}

        impl FrameSink for Sink {
            fn send_frame(&self, frame: &[u8]) -> Result<(), Error>;
        }
    }

    fn reply_for(seqnum: u32, status: i32, data: &[u8]) -> RetSubmit {
        RetSubmit {
            seqnum,
            devid: 0,
            direction: UrbDirection::Out,
            ep: 0,
            status,
            actual_length: data.len() as i32,
            start_frame: 0,
            number_of_packets: 0,
            error_count: 0,
        }
    }

    #[test]
    fn seqnums_start_at_one_and_increase() {
        let sink = FakeSink::default();
        let mut e = UrbEngine::new();
        let (s1, _rx1) = e
            .submit(0x10002, 2, [0u8; 8], SubmitBody::Out(b"a"), &sink)
            .unwrap();
        let (s2, _rx2) = e
            .submit(0x10002, 1, [0u8; 8], SubmitBody::In(64), &sink)
            .unwrap();
        let (s3, _rx3) = e
            .submit(0x10002, 2, [0u8; 8], SubmitBody::Out(b"b"), &sink)
            .unwrap();
        assert_eq!((s1, s2, s3), (1, 2, 3));
    }

    #[test]
    fn frames_written_in_submission_order() {
        let sink = FakeSink::default();
        let mut e = UrbEngine::new();
        e.submit(0x10002, 2, [0u8; 8], SubmitBody::Out(b"first"), &sink)
            .unwrap();
        e.submit(0x10002, 2, [0u8; 8], SubmitBody::Out(b"second"), &sink)
            .unwrap();
        assert_eq!(sink.count(), 2);
        assert_eq!(sink.payload_of(0), b"first");
        assert_eq!(sink.payload_of(1), b"second");
        let CommandFrame::Submit(cmd) = sink.frame(0) else {
            panic!("not a submit");
        };
        assert_eq!(cmd.seqnum, 1);
        assert_eq!(cmd.direction, UrbDirection::Out);
        assert_eq!(cmd.transfer_buffer_length, 5);
    }

    #[test]
    fn in_submission_carries_length_not_payload() {
        let sink = FakeSink::default();
        let mut e = UrbEngine::new();
        e.submit(0x10002, 1, [0u8; 8], SubmitBody::In(512), &sink)
            .unwrap();
        let CommandFrame::Submit(cmd) = sink.frame(0) else {
            panic!("not a submit");
        };
        assert_eq!(cmd.direction, UrbDirection::In);
        assert_eq!(cmd.transfer_buffer_length, 512);
        assert!(sink.payload_of(0).is_empty());
    }

    #[test]
    fn reply_reaches_matching_waiter() {
        let sink = FakeSink::default();
        let mut e = UrbEngine::new();
        let (s1, mut rx1) = e
            .submit(0x10002, 1, [0u8; 8], SubmitBody::In(64), &sink)
            .unwrap();
        let (s2, mut rx2) = e
            .submit(0x10002, 1, [0u8; 8], SubmitBody::In(64), &sink)
            .unwrap();

        // out-of-order delivery still lands on the right waiter
        e.on_submit_reply(reply_for(s2, 0, b"two"), b"two".to_vec());
        e.on_submit_reply(reply_for(s1, 0, b"one"), b"one".to_vec());

        assert_eq!(rx1.try_recv().unwrap(), Completion::Data(b"one".to_vec()));
        assert_eq!(rx2.try_recv().unwrap(), Completion::Data(b"two".to_vec()));
        assert_eq!(e.in_flight_count(), 0);
    }

    #[test]
    fn failed_urb_reports_status() {
        let sink = FakeSink::default();
        let mut e = UrbEngine::new();
        let (s, mut rx) = e
            .submit(0x10002, 1, [0u8; 8], SubmitBody::In(64), &sink)
            .unwrap();
        e.on_submit_reply(reply_for(s, -32, b""), Vec::new());
        assert_eq!(rx.try_recv().unwrap(), Completion::Failed(-32));
    }

    #[test]
    fn spurious_reply_is_dropped() {
        let sink = FakeSink::default();
        let mut e = UrbEngine::new();
        e.on_submit_reply(reply_for(99, 0, b"x"), b"x".to_vec());
        assert_eq!(e.in_flight_count(), 0);
    }

    #[test]
    fn unlink_wakes_waiter_and_emits_frame() {
        let sink = FakeSink::default();
        let mut e = UrbEngine::new();
        let (s, mut rx) = e
            .submit(0x10002, 1, [0u8; 8], SubmitBody::In(64), &sink)
            .unwrap();
        e.unlink(s, &sink).unwrap();

        assert_eq!(rx.try_recv().unwrap(), Completion::Unlinked);
        assert_eq!(e.in_flight_count(), 0);

        let CommandFrame::Unlink(cmd) = sink.frame(1) else {
            panic!("not an unlink");
        };
        assert_eq!(cmd.unlink_seqnum, s);
        // the unlink consumes a fresh seqnum of its own
        assert_eq!(cmd.seqnum, 2);
    }

    #[test]
    fn unlink_of_completed_transaction_is_noop() {
        let sink = FakeSink::default();
        let mut e = UrbEngine::new();
        let (s, mut rx) = e
            .submit(0x10002, 1, [0u8; 8], SubmitBody::In(64), &sink)
            .unwrap();
        e.on_submit_reply(reply_for(s, 0, b"ok"), b"ok".to_vec());
        e.unlink(s, &sink).unwrap();
        assert_eq!(sink.count(), 1); // no CMD_UNLINK emitted
        assert_eq!(rx.try_recv().unwrap(), Completion::Data(b"ok".to_vec()));
    }

    #[test]
    fn late_reply_after_unlink_is_dropped() {
        let sink = FakeSink::default();
        let mut e = UrbEngine::new();
        let (s, _rx) = e
            .submit(0x10002, 1, [0u8; 8], SubmitBody::In(64), &sink)
            .unwrap();
        e.unlink(s, &sink).unwrap();

        // the transport can still frame the late reply
        assert_eq!(e.direction_of(s), Some(UrbDirection::In));
        e.on_submit_reply(reply_for(s, 0, b"late"), b"late".to_vec());
        assert_eq!(e.direction_of(s), None);
    }

    #[test]
    fn unlink_reply_clears_ghost() {
        let sink = FakeSink::default();
        let mut e = UrbEngine::new();
        let (s, _rx) = e
            .submit(0x10002, 1, [0u8; 8], SubmitBody::In(64), &sink)
            .unwrap();
        e.unlink(s, &sink).unwrap();
        let CommandFrame::Unlink(cmd) = sink.frame(1) else {
            panic!("not an unlink");
        };

        e.on_unlink_reply(RetUnlink {
            seqnum: cmd.seqnum,
            devid: 0,
            direction: UrbDirection::Out,
            ep: 0,
            status: -104,
        });
        assert_eq!(e.direction_of(s), None);
    }

    #[test]
    fn fault_all_wakes_every_waiter() {
        let sink = FakeSink::default();
        let mut e = UrbEngine::new();
        let (_s1, mut rx1) = e
            .submit(0x10002, 1, [0u8; 8], SubmitBody::In(64), &sink)
            .unwrap();
        let (_s2, mut rx2) = e
            .submit(0x10003, 1, [0u8; 8], SubmitBody::In(64), &sink)
            .unwrap();
        e.fault_all();
        assert_eq!(rx1.try_recv().unwrap(), Completion::Disconnected);
        assert_eq!(rx2.try_recv().unwrap(), Completion::Disconnected);
        assert_eq!(e.in_flight_count(), 0);
    }

    #[test]
    fn seqnum_exhaustion_is_an_error() {
        let sink = FakeSink::default();
        let mut e = UrbEngine::new();
        e.next_seqnum = u32::MAX;
        let r = e.submit(0x10002, 1, [0u8; 8], SubmitBody::In(64), &sink);
        assert!(matches!(r, Err(Error::SeqnumExhausted)));
        assert_eq!(sink.count(), 0);
    }

    #[test]
    fn send_failure_leaves_no_transaction_behind() {
        let sink = FakeSink {
            failing: true,
            ..Default::default()
        };
        let mut e = UrbEngine::new();
        let r = e.submit(0x10002, 2, [0u8; 8], SubmitBody::Out(b"x"), &sink);
        assert!(matches!(r, Err(Error::SendFailed)));
        assert_eq!(e.in_flight_count(), 0);
    }

    #[test]
    fn submit_hands_exactly_one_frame_to_the_sink() {
        let mut sink = MockSink::new();
        sink.expect_send_frame()
            .withf(|frame| frame.len() == 48 + 4 && &frame[48..] == b"PING")
            .once()
            .returning(|_| Ok(()));
        let mut e = UrbEngine::new();
        e.submit(0x10002, 2, [0u8; 8], SubmitBody::Out(b"PING"), &sink)
            .unwrap();
    }
}
