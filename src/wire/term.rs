// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! H2C_TERM_REQ / C2H_TERM_REQ: the qpair's fatal-error signal.

use anyhow::{Result, anyhow, bail};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, U16};

use crate::wire::common::{CommonHeaderRaw, PduType};

pub const TERM_REQ_HDR_LEN: usize = 24;
/// "the first up to 152 bytes of the offending PDU header are embedded".
pub const MAX_TERM_REQ_DATA: usize = 152;

/// Fatal Error Status codes this transport can originate.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatalErrorStatus {
    InvalidPduHeader = 0x01,
    PduSequenceError = 0x02,
    HeaderDigestError = 0x03,
    DataTransferOutOfRange = 0x04,
    R2tLimitExceeded = 0x05,
    DataDigestError = 0x06,
    UnsupportedParameter = 0x07,
}

impl FatalErrorStatus {
    /// "out-of-range ordinals -> H2C_TERM_REQ with INVALID_HEADER_FIELD".
    pub const INVALID_HEADER_FIELD: Self = FatalErrorStatus::InvalidPduHeader;
}

/// `term_req_hdr := common(type in {0x02,0x03}), u16 fes, u8 fei[4],
/// error_data[<=152]`.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct TermReqHeader {
    pub common: CommonHeaderRaw,
    pub fes: U16<zerocopy::LittleEndian>,
    pub fei: [u8; 4],
    pub reserved: [u8; 10],
}

const _: () = assert!(core::mem::size_of::<TermReqHeader>() == TERM_REQ_HDR_LEN);

impl TermReqHeader {
    pub fn new(is_host_originated: bool, fes: FatalErrorStatus, error_offset: u32, diag_len: usize) -> Result<Self> {
        if diag_len > MAX_TERM_REQ_DATA {
            bail!("term-req diagnostic data too large: {diag_len} > {MAX_TERM_REQ_DATA}");
        }
        let ty = if is_host_originated {
            PduType::H2cTermReq
        } else {
            PduType::C2hTermReq
        };
        Ok(Self {
            common: CommonHeaderRaw {
                pdu_type: ty as u8,
                flags: 0,
                hlen: TERM_REQ_HDR_LEN as u8,
                pdo: 0,
                plen: zerocopy::U32::new((TERM_REQ_HDR_LEN + diag_len) as u32),
            },
            fes: U16::new(fes as u16),
            fei: error_offset.to_le_bytes(),
            reserved: [0u8; 10],
        })
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() != TERM_REQ_HDR_LEN {
            bail!("term-req hlen must be {TERM_REQ_HDR_LEN}, got {}", buf.len());
        }
        Self::read_from_bytes(buf).map_err(|e| anyhow!("failed to decode term-req: {e}"))
    }

    pub fn fatal_error_status(&self) -> u16 {
        self.fes.get()
    }

    pub fn error_offset(&self) -> u32 {
        u32::from_le_bytes(self.fei)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_originated_term_req_uses_h2c_type() {
        let hdr = TermReqHeader::new(true, FatalErrorStatus::HeaderDigestError, 0x10, 0)
            .expect("builds");
        assert_eq!(hdr.common.pdu_type().expect("known"), PduType::H2cTermReq);
        assert_eq!(hdr.fatal_error_status(), FatalErrorStatus::HeaderDigestError as u16);
        assert_eq!(hdr.error_offset(), 0x10);
    }

    #[test]
    fn target_originated_term_req_uses_c2h_type() {
        let hdr = TermReqHeader::new(false, FatalErrorStatus::PduSequenceError, 0, 0).expect("builds");
        assert_eq!(hdr.common.pdu_type().expect("known"), PduType::C2hTermReq);
    }

    #[test]
    fn rejects_oversized_diagnostic_data() {
        let err = TermReqHeader::new(true, FatalErrorStatus::InvalidPduHeader, 0, MAX_TERM_REQ_DATA + 1);
        assert!(err.is_err());
    }

    #[test]
    fn roundtrips_through_bytes() {
        let hdr = TermReqHeader::new(true, FatalErrorStatus::DataDigestError, 42, 0).expect("builds");
        let decoded = TermReqHeader::decode(hdr.as_bytes()).expect("decodes");
        assert_eq!(decoded, hdr);
    }
}
