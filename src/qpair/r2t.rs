// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! R2T flow-control bookkeeping: validating an incoming R2T against the
//! request's in-flight data offset, and computing the next H2C_DATA
//! segment.

use crate::{
    error::TransportError,
    qpair::request::{R2tState, Request},
    wire::r2t::R2tHeader,
};

/// A ready-to-send H2C_DATA segment, plain data for the send path to
/// serialize; contains no header-framing concerns.
#[derive(Debug, Clone, Copy)]
pub struct H2cSegment {
    pub datao: u32,
    pub datal: u32,
    pub last: bool,
}

/// Validates an incoming R2T against `request`'s current offset and
/// admits it into the flow-control state, returning the immediate
/// H2C_DATA segment to send or `None` if the R2T had to be parked behind
/// an in-flight H2C (the subsequent-R2T limit).
pub fn admit_r2t(
    request: &mut Request,
    hdr: &R2tHeader,
    maxr2t: u32,
    maxh2cdata: u32,
    payload_size: u32,
) -> Result<Option<H2cSegment>, TransportError> {
    let r2to = hdr.r2to.get();
    let r2tl = hdr.r2tl.get();
    let ttag = hdr.ttag.get();

    if r2to != request.r2t.datao || r2to.saturating_add(r2tl) > payload_size {
        return Err(TransportError::UnexpectedPdu);
    }

    request.r2t.active_r2ts += 1;
    if request.r2t.active_r2ts > maxr2t + 1 {
        return Err(TransportError::UnexpectedPdu);
    }

    if request.r2t.active_r2ts > maxr2t || request.r2t.h2c_wait_ack {
        request.r2t.r2t_wait_h2c = true;
        request.r2t.ttag_next = Some(ttag);
        request.r2t.r2tl_remain_next = r2tl;
        return Ok(None);
    }

    request.r2t.r2tl_remain = r2tl;
    Ok(Some(next_h2c_segment(&mut request.r2t, maxh2cdata)))
}

/// Computes the next H2C_DATA segment from `state`, advancing `datao` and
/// decrementing `r2tl_remain`.
pub fn next_h2c_segment(state: &mut R2tState, maxh2cdata: u32) -> H2cSegment {
    let datal = state.r2tl_remain.min(maxh2cdata);
    let datao = state.datao;
    state.datao += datal;
    state.r2tl_remain -= datal;
    let last = state.r2tl_remain == 0;
    H2cSegment { datao, datal, last }
}

/// Called once the in-flight H2C_DATA has been ACKed: the R2T that segment
/// belonged to has now fully drained, so `active_r2ts` drops by one; if a
/// subsequent R2T was parked behind it, admit it now.
pub fn on_h2c_acked(state: &mut R2tState, maxh2cdata: u32) -> Option<H2cSegment> {
    state.h2c_wait_ack = false;
    state.active_r2ts = state.active_r2ts.saturating_sub(1);
    if state.r2t_wait_h2c {
        state.r2t_wait_h2c = false;
        state.r2tl_remain = state.r2tl_remain_next;
        state.ttag_next = None;
        Some(next_h2c_segment(state, maxh2cdata))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mk_r2t(r2to: u32, r2tl: u32, ttag: u16) -> R2tHeader {
        R2tHeader::new(0, ttag, r2to, r2tl)
    }

    #[test]
    fn admits_matching_r2t_and_emits_full_segment() {
        let mut req = blank_request();
        req.r2t.datao = 0;
        let hdr = mk_r2t(0, 4096, 1);
        let seg = admit_r2t(&mut req, &hdr, 4, 8192, 8192).expect("valid r2t").expect("immediate segment");
        assert_eq!(seg.datao, 0);
        assert_eq!(seg.datal, 4096);
        assert!(seg.last);
    }

    #[test]
    fn second_r2t_is_parked_then_released_once_the_first_h2c_is_acked() {
        let mut req = blank_request();
        req.r2t.datao = 0;

        let first = mk_r2t(0, 4096, 7);
        let seg1 = admit_r2t(&mut req, &first, 1, 8192, 6144).expect("valid r2t").expect("immediate segment");
        assert_eq!(seg1.datao, 0);
        assert_eq!(seg1.datal, 4096);
        assert!(seg1.last);

        // Still sending the first segment when the second R2T arrives.
        req.r2t.h2c_wait_ack = true;

        let second = mk_r2t(4096, 2048, 9);
        let parked = admit_r2t(&mut req, &second, 1, 8192, 6144).expect("valid r2t");
        assert!(parked.is_none(), "second R2T must park behind the first's outstanding ack");
        assert_eq!(req.r2t.ttag_next, Some(9));
        assert!(req.r2t.r2t_wait_h2c);

        let released = on_h2c_acked(&mut req.r2t, 8192).expect("parked segment releases once acked");
        assert_eq!(released.datao, 4096);
        assert_eq!(released.datal, 2048);
        assert!(released.last);
        assert!(!req.r2t.h2c_wait_ack);
        assert!(!req.r2t.r2t_wait_h2c);
    }

    #[test]
    fn third_r2t_beyond_the_parking_slack_is_rejected() {
        let mut req = blank_request();
        req.r2t.datao = 0;
        admit_r2t(&mut req, &mk_r2t(0, 100, 1), 1, 8192, 300).expect("valid r2t");
        req.r2t.h2c_wait_ack = true;
        admit_r2t(&mut req, &mk_r2t(100, 100, 2), 1, 8192, 300).expect("valid r2t");
        // Third R2T still targets the same unadvanced offset (the second
        // was parked, not admitted), but active_r2ts already sits at the
        // maxr2t+1 slack ceiling.
        assert!(admit_r2t(&mut req, &mk_r2t(100, 100, 3), 1, 8192, 300).is_err());
    }

    #[test]
    fn active_r2ts_drops_once_its_h2c_segment_is_acked_so_a_third_r2t_is_then_admitted() {
        let mut req = blank_request();
        req.r2t.datao = 0;
        admit_r2t(&mut req, &mk_r2t(0, 100, 1), 1, 8192, 300).expect("valid r2t");
        req.r2t.h2c_wait_ack = true;
        admit_r2t(&mut req, &mk_r2t(100, 100, 2), 1, 8192, 300).expect("valid r2t");
        assert_eq!(req.r2t.active_r2ts, 2);

        // Draining the first R2T's H2C_DATA releases the parked second one
        // and frees a slot in the active_r2ts ceiling.
        on_h2c_acked(&mut req.r2t, 8192).expect("parked segment releases");
        assert_eq!(req.r2t.active_r2ts, 1);

        req.r2t.h2c_wait_ack = true;
        let third = admit_r2t(&mut req, &mk_r2t(200, 100, 3), 1, 8192, 300).expect("valid r2t");
        assert!(third.is_none(), "third R2T parks behind the still-outstanding second H2C");
        assert_eq!(req.r2t.active_r2ts, 2);
    }

    #[test]
    fn rejects_offset_mismatch() {
        let mut req = blank_request();
        req.r2t.datao = 100;
        let hdr = mk_r2t(0, 4096, 1);
        assert!(admit_r2t(&mut req, &hdr, 4, 8192, 8192).is_err());
    }

    fn blank_request() -> Request {
        Request {
            cid: 0,
            opc: 0,
            nsid: 0,
            payload: crate::qpair::request::PayloadDescriptor::None,
            expected_datao: 0,
            send_acked: false,
            data_recv: false,
            sendmsg_idx: None,
            r2t: R2tState::default(),
            on_complete: None,
        }
    }
}
