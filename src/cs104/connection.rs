//! APCI connection engine: sequence numbers, window bookkeeping and the
//! t1/t2/t3 timer discipline shared by the client and server workers.
//!
//! The engine is pure state: it consumes decoded APDUs and clock readings
//! and produces frames to transmit plus deliveries for the role on top.
//! All socket IO stays in the owning worker.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::asdu::Asdu;
use crate::common::ApciParameters;
use crate::cs104::apci::{next_seq, seq_distance, Apdu, UFrame};
use crate::error::{Iec60870Error, Iec60870Result};

/// What the engine wants done after processing one incoming APDU.
#[derive(Debug, Default)]
pub struct Reaction {
    /// Frames to transmit, in order
    pub send: Vec<Apdu>,
    /// An ASDU to hand to the role layer
    pub deliver: Option<Asdu>,
    /// A STARTDT/STOPDT request that the role must arbitrate (server side)
    pub u_request: Option<UFrame>,
    /// A confirmation the role was waiting for (client side)
    pub u_confirmed: Option<UFrame>,
}

/// Sliding-window state for one CS104 connection.
#[derive(Debug)]
pub struct ApciEngine {
    params: ApciParameters,
    /// N(S) of the next outgoing I-frame
    send_seq: u16,
    /// Next expected incoming N(S), i.e. our N(R)
    recv_seq: u16,
    /// The N(R) value most recently transmitted to the peer
    last_sent_ack: u16,
    /// Outstanding (unacknowledged) sent I-frames: sequence and send time
    sent_unacked: VecDeque<(u16, Instant)>,
    /// First unacknowledged receive, starts the t2 clock
    first_unacked_rx: Option<Instant>,
    /// STARTDT/STOPDT ACT awaiting its CON, with send time (t1)
    pending_u: Option<(UFrame, Instant)>,
    /// TESTFR ACT awaiting its CON, with send time (t1)
    pending_test: Option<Instant>,
    /// Last time anything arrived from the peer (t3 idle clock)
    last_rx: Instant,
    /// Data transfer active: I-frames may be sent
    started: bool,
}

impl ApciEngine {
    pub fn new(params: ApciParameters, now: Instant) -> Self {
        Self {
            params,
            send_seq: 0,
            recv_seq: 0,
            last_sent_ack: 0,
            sent_unacked: VecDeque::new(),
            first_unacked_rx: None,
            pending_u: None,
            pending_test: None,
            last_rx: now,
            started: false,
        }
    }

    pub fn started(&self) -> bool {
        self.started
    }

    pub fn set_started(&mut self, started: bool) {
        self.started = started;
    }

    pub fn send_seq(&self) -> u16 {
        self.send_seq
    }

    pub fn recv_seq(&self) -> u16 {
        self.recv_seq
    }

    /// Outstanding sent I-frames.
    pub fn unacked(&self) -> usize {
        self.sent_unacked.len()
    }

    /// True when the k-window has room and data transfer is active.
    pub fn can_send_i(&self) -> bool {
        self.started && self.sent_unacked.len() < self.params.k as usize
    }

    /// Build the I-frame for `asdu` and account for it in the window.
    ///
    /// Callers must check [`can_send_i`](Self::can_send_i) first; sending
    /// past the window is a programming error on our own side.
    pub fn make_i_frame(&mut self, asdu: Asdu, now: Instant) -> Iec60870Result<Apdu> {
        if self.sent_unacked.len() >= self.params.k as usize {
            return Err(Iec60870Error::Protocol(format!(
                "k window exhausted ({} outstanding)",
                self.sent_unacked.len()
            )));
        }
        let apdu = Apdu::i_frame(self.send_seq, self.recv_seq, asdu);
        self.sent_unacked.push_back((self.send_seq, now));
        self.send_seq = next_seq(self.send_seq);
        self.note_ack_sent();
        Ok(apdu)
    }

    /// Build a supervisory frame acknowledging everything received.
    pub fn make_s_frame(&mut self) -> Apdu {
        let apdu = Apdu::s_frame(self.recv_seq);
        self.note_ack_sent();
        apdu
    }

    /// Record a U-frame activation we are about to transmit.
    pub fn make_u_act(&mut self, function: UFrame, now: Instant) -> Iec60870Result<Apdu> {
        if self.pending_u.is_some() {
            return Err(Iec60870Error::Protocol(
                "a U-frame activation is already outstanding".to_string(),
            ));
        }
        self.pending_u = Some((function, now));
        Ok(Apdu::u_frame(function))
    }

    fn note_ack_sent(&mut self) {
        self.last_sent_ack = self.recv_seq;
        self.first_unacked_rx = None;
    }

    /// Handle one incoming APDU. Returns the frames to send back, the
    /// delivery for the role, and any U-frame signalling.
    pub fn handle(&mut self, apdu: Apdu, now: Instant) -> Iec60870Result<Reaction> {
        use crate::cs104::apci::{Apci, AsduSlot};
        self.last_rx = now;
        let mut reaction = Reaction::default();

        match apdu.apci {
            Apci::I { send_seq, recv_seq } => {
                if send_seq != self.recv_seq {
                    return Err(Iec60870Error::Protocol(format!(
                        "unexpected N(S) {send_seq}, expected {}",
                        self.recv_seq
                    )));
                }
                self.recv_seq = next_seq(self.recv_seq);
                if self.first_unacked_rx.is_none() {
                    self.first_unacked_rx = Some(now);
                }
                if seq_distance(self.recv_seq, self.last_sent_ack) > self.params.k {
                    return Err(Iec60870Error::Protocol(format!(
                        "peer exceeded the k window ({} unacknowledged)",
                        seq_distance(self.recv_seq, self.last_sent_ack)
                    )));
                }
                self.process_peer_ack(recv_seq)?;
                match apdu.asdu {
                    AsduSlot::Decoded(asdu) => reaction.deliver = Some(asdu),
                    AsduSlot::Undecodable { reason } => {
                        tracing::debug!(%reason, "acknowledging undecodable ASDU without dispatch");
                    }
                    AsduSlot::None => {}
                }
                if seq_distance(self.recv_seq, self.last_sent_ack) >= self.params.w {
                    reaction.send.push(self.make_s_frame());
                }
            }
            Apci::S { recv_seq } => {
                self.process_peer_ack(recv_seq)?;
            }
            Apci::U(function) => match function {
                UFrame::TestFrAct => {
                    reaction.send.push(Apdu::u_frame(UFrame::TestFrCon));
                }
                UFrame::TestFrCon => {
                    self.pending_test = None;
                }
                UFrame::StartDtAct | UFrame::StopDtAct => {
                    reaction.u_request = Some(function);
                }
                UFrame::StartDtCon | UFrame::StopDtCon => {
                    let expected = match function {
                        UFrame::StartDtCon => UFrame::StartDtAct,
                        _ => UFrame::StopDtAct,
                    };
                    match self.pending_u.take() {
                        Some((pending, _)) if pending == expected => {
                            self.started = function == UFrame::StartDtCon;
                            reaction.u_confirmed = Some(function);
                        }
                        other => {
                            self.pending_u = other;
                            return Err(Iec60870Error::Protocol(format!(
                                "unexpected {function:?} with no matching activation"
                            )));
                        }
                    }
                }
            },
        }
        Ok(reaction)
    }

    /// Apply the peer's N(R): drop every outstanding frame it covers.
    fn process_peer_ack(&mut self, peer_recv_seq: u16) -> Iec60870Result<()> {
        // N(R) must lie between the oldest outstanding frame and the next
        // N(S); anything else acknowledges frames never sent.
        let outstanding = self.sent_unacked.len() as u16;
        let oldest = self
            .sent_unacked
            .front()
            .map(|(seq, _)| *seq)
            .unwrap_or(self.send_seq);
        if seq_distance(peer_recv_seq, oldest) > outstanding {
            return Err(Iec60870Error::Protocol(format!(
                "N(R) {peer_recv_seq} outside the window [{oldest}, {}]",
                self.send_seq
            )));
        }
        while let Some((seq, _)) = self.sent_unacked.front() {
            if seq_distance(peer_recv_seq, *seq) >= 1
                && seq_distance(peer_recv_seq, *seq) <= outstanding
            {
                self.sent_unacked.pop_front();
            } else {
                break;
            }
        }
        Ok(())
    }

    /// Timer sweep. Returns frames that fell due, or the t1 diagnostic
    /// when the connection must be closed.
    pub fn poll_timers(&mut self, now: Instant) -> Iec60870Result<Vec<Apdu>> {
        let t1 = Duration::from_secs(self.params.t1 as u64);
        let t2 = Duration::from_secs(self.params.t2 as u64);
        let t3 = Duration::from_secs(self.params.t3 as u64);
        let mut due = Vec::new();

        if let Some((seq, sent_at)) = self.sent_unacked.front() {
            if now.duration_since(*sent_at) >= t1 {
                return Err(Iec60870Error::Timeout(format!(
                    "t1 expired waiting for acknowledgement of I-frame {seq}"
                )));
            }
        }
        if let Some((function, sent_at)) = &self.pending_u {
            if now.duration_since(*sent_at) >= t1 {
                return Err(Iec60870Error::Timeout(format!(
                    "t1 expired waiting for confirmation of {function:?}"
                )));
            }
        }
        if let Some(sent_at) = &self.pending_test {
            if now.duration_since(*sent_at) >= t1 {
                return Err(Iec60870Error::Timeout(
                    "t1 expired waiting for TESTFR confirmation".to_string(),
                ));
            }
        }

        if let Some(first) = self.first_unacked_rx {
            if now.duration_since(first) >= t2 {
                due.push(self.make_s_frame());
            }
        }

        if self.pending_test.is_none() && now.duration_since(self.last_rx) >= t3 {
            self.pending_test = Some(now);
            due.push(Apdu::u_frame(UFrame::TestFrAct));
        }

        Ok(due)
    }

    /// Frames received but not yet acknowledged towards the peer.
    pub fn unacked_received(&self) -> u16 {
        seq_distance(self.recv_seq, self.last_sent_ack)
    }

    /// The tightest deadline the worker's read timeout must respect.
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(100)
            .min(Duration::from_secs(self.params.t2 as u64))
            .min(Duration::from_secs(self.params.t1 as u64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{Cause, Quality};
    use crate::cs104::apci::{Apci, AsduSlot};
    use crate::information::InformationObject;
    use pretty_assertions::assert_eq;

    fn asdu(ioa: u32) -> Asdu {
        Asdu::new(
            Cause::Spontaneous,
            0,
            1,
            vec![InformationObject::SinglePoint {
                ioa,
                value: true,
                quality: Quality::GOOD,
            }],
        )
        .unwrap()
    }

    fn engine(k: u16, w: u16) -> (ApciEngine, Instant) {
        let now = Instant::now();
        let params = ApciParameters {
            k,
            w,
            ..Default::default()
        };
        let mut engine = ApciEngine::new(params, now);
        engine.set_started(true);
        (engine, now)
    }

    fn incoming_i(send_seq: u16, recv_seq: u16) -> Apdu {
        Apdu {
            apci: Apci::I { send_seq, recv_seq },
            asdu: AsduSlot::Decoded(asdu(1)),
        }
    }

    #[test]
    fn window_blocks_at_k() {
        let (mut engine, now) = engine(3, 2);
        for i in 0..3 {
            assert!(engine.can_send_i(), "frame {i}");
            engine.make_i_frame(asdu(i), now).unwrap();
        }
        assert!(!engine.can_send_i());
        assert_eq!(engine.unacked(), 3);
        assert!(engine.make_i_frame(asdu(9), now).is_err());
    }

    #[test]
    fn sent_sequence_numbers_are_contiguous() {
        let (mut engine, now) = engine(100, 8);
        for expected in 0..50u16 {
            let apdu = engine.make_i_frame(asdu(1), now).unwrap();
            match apdu.apci {
                Apci::I { send_seq, .. } => assert_eq!(send_seq, expected),
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    #[test]
    fn peer_ack_frees_the_window() {
        let (mut engine, now) = engine(2, 2);
        engine.make_i_frame(asdu(1), now).unwrap();
        engine.make_i_frame(asdu(2), now).unwrap();
        assert!(!engine.can_send_i());

        engine
            .handle(Apdu::s_frame(1), now)
            .expect("partial acknowledgement");
        assert_eq!(engine.unacked(), 1);
        assert!(engine.can_send_i());

        engine.handle(Apdu::s_frame(2), now).unwrap();
        assert_eq!(engine.unacked(), 0);
    }

    #[test]
    fn ack_of_unsent_frame_is_a_protocol_error() {
        let (mut engine, now) = engine(4, 2);
        engine.make_i_frame(asdu(1), now).unwrap();
        let err = engine.handle(Apdu::s_frame(5), now);
        assert!(matches!(err, Err(Iec60870Error::Protocol(_))));
    }

    #[test]
    fn receive_w_frames_triggers_supervisory_ack() {
        let (mut engine, now) = engine(12, 3);
        for i in 0..2 {
            let reaction = engine.handle(incoming_i(i, 0), now).unwrap();
            assert!(reaction.send.is_empty(), "frame {i} acked early");
            assert!(reaction.deliver.is_some());
        }
        let reaction = engine.handle(incoming_i(2, 0), now).unwrap();
        assert_eq!(reaction.send.len(), 1);
        match reaction.send[0].apci {
            Apci::S { recv_seq } => assert_eq!(recv_seq, 3),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(engine.unacked_received(), 0);
    }

    #[test]
    fn out_of_order_incoming_is_a_protocol_error() {
        let (mut engine, now) = engine(12, 8);
        engine.handle(incoming_i(0, 0), now).unwrap();
        let err = engine.handle(incoming_i(5, 0), now);
        assert!(matches!(err, Err(Iec60870Error::Protocol(_))));
    }

    #[test]
    fn i_frame_send_counts_as_acknowledgement() {
        let (mut engine, now) = engine(12, 2);
        engine.handle(incoming_i(0, 0), now).unwrap();
        assert_eq!(engine.unacked_received(), 1);
        // Sending our own I-frame carries N(R) = 1.
        let apdu = engine.make_i_frame(asdu(1), now).unwrap();
        match apdu.apci {
            Apci::I { recv_seq, .. } => assert_eq!(recv_seq, 1),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(engine.unacked_received(), 0);
        // The next incoming frame therefore does not reach w yet.
        let reaction = engine.handle(incoming_i(1, 1), now).unwrap();
        assert!(reaction.send.is_empty());
    }

    #[test]
    fn t2_expiry_forces_supervisory_ack() {
        let (mut engine, now) = engine(12, 8);
        engine.handle(incoming_i(0, 0), now).unwrap();
        let later = now + Duration::from_secs(11);
        let due = engine.poll_timers(later).unwrap();
        assert_eq!(due.len(), 1);
        assert!(matches!(due[0].apci, Apci::S { recv_seq: 1 }));
        // And only once.
        assert!(engine.poll_timers(later).unwrap().is_empty());
    }

    #[test]
    fn t1_expiry_on_unacked_i_frame() {
        let (mut engine, now) = engine(12, 8);
        engine.make_i_frame(asdu(1), now).unwrap();
        assert!(engine.poll_timers(now + Duration::from_secs(14)).is_ok());
        let err = engine.poll_timers(now + Duration::from_secs(15));
        assert!(matches!(err, Err(Iec60870Error::Timeout(_))));
    }

    #[test]
    fn idle_t3_sends_test_frame_and_t1_bounds_the_answer() {
        let (mut engine, now) = engine(12, 8);
        let idle = now + Duration::from_secs(20);
        let due = engine.poll_timers(idle).unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].apci, Apci::U(UFrame::TestFrAct));

        // Confirmation clears the pending test.
        engine
            .handle(Apdu::u_frame(UFrame::TestFrCon), idle + Duration::from_secs(1))
            .unwrap();
        assert!(engine
            .poll_timers(idle + Duration::from_secs(2))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn unanswered_test_frame_times_out() {
        let (mut engine, now) = engine(12, 8);
        let idle = now + Duration::from_secs(20);
        engine.poll_timers(idle).unwrap();
        let err = engine.poll_timers(idle + Duration::from_secs(15));
        assert!(matches!(err, Err(Iec60870Error::Timeout(_))));
    }

    #[test]
    fn test_frame_activation_is_answered() {
        let (mut engine, now) = engine(12, 8);
        let reaction = engine
            .handle(Apdu::u_frame(UFrame::TestFrAct), now)
            .unwrap();
        assert_eq!(reaction.send.len(), 1);
        assert_eq!(reaction.send[0].apci, Apci::U(UFrame::TestFrCon));
    }

    #[test]
    fn startdt_confirmation_flips_started() {
        let now = Instant::now();
        let mut engine = ApciEngine::new(ApciParameters::default(), now);
        assert!(!engine.started());
        engine.make_u_act(UFrame::StartDtAct, now).unwrap();
        // A second activation while one is outstanding is refused.
        assert!(engine.make_u_act(UFrame::StartDtAct, now).is_err());
        let reaction = engine
            .handle(Apdu::u_frame(UFrame::StartDtCon), now)
            .unwrap();
        assert_eq!(reaction.u_confirmed, Some(UFrame::StartDtCon));
        assert!(engine.started());
    }

    #[test]
    fn unexpected_confirmation_is_a_protocol_error() {
        let now = Instant::now();
        let mut engine = ApciEngine::new(ApciParameters::default(), now);
        let err = engine.handle(Apdu::u_frame(UFrame::StopDtCon), now);
        assert!(matches!(err, Err(Iec60870Error::Protocol(_))));
    }

    #[test]
    fn stopped_connection_still_acknowledges_and_delivers() {
        let (mut engine, now) = engine(12, 1);
        engine.set_started(false);
        assert!(!engine.can_send_i());
        let reaction = engine.handle(incoming_i(0, 0), now).unwrap();
        assert!(reaction.deliver.is_some());
        // w = 1: the supervisory acknowledgement still goes out.
        assert_eq!(reaction.send.len(), 1);
    }

    #[test]
    fn window_invariant_holds_through_a_long_exchange() {
        let (mut engine, start) = engine(5, 3);
        let mut now = start;
        let mut peer_recv: u16 = 0;
        for round in 0..200u16 {
            now += Duration::from_millis(10);
            if engine.can_send_i() {
                engine.make_i_frame(asdu(round as u32), now).unwrap();
            }
            assert!(engine.unacked() <= 5, "round {round}");
            // The peer acknowledges every other round.
            if round % 2 == 1 {
                peer_recv = engine.send_seq();
                engine.handle(Apdu::s_frame(peer_recv), now).unwrap();
                assert_eq!(engine.unacked(), 0);
            }
            assert!(engine.unacked_received() < 3);
        }
    }
}
