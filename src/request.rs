//! In-memory request/response packets. There is no wire format: the
//! contract is the field set and the invariants documented on each
//! field, not a serialization scheme (see SPEC_FULL §6).

use crate::address::Address;
use smallvec::SmallVec;

/// Which queue a request belongs in and, downstream, what kind of
/// access it represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    Load,
    Rfo,
    Prefetch,
    Write,
    Translation,
}

impl RequestKind {
    /// Bit position used by `pref_activate_mask` (see [`crate::cache::CacheConfig`]).
    pub fn activate_bit(self) -> u8 {
        match self {
            RequestKind::Load => 0b0000_0001,
            RequestKind::Rfo => 0b0000_0010,
            RequestKind::Prefetch => 0b0000_0100,
            RequestKind::Write => 0b0000_1000,
            RequestKind::Translation => 0b0001_0000,
        }
    }
}

/// Inline capacity for the small sets threaded through a packet's
/// lifetime; almost never more than a couple of entries in practice, so
/// this avoids a heap allocation per request in the common case.
pub type InstrIdSet = SmallVec<[u64; 4]>;

#[derive(Debug, Clone)]
pub struct Request {
    pub address: Address,
    pub v_address: Address,
    pub is_translated: bool,
    pub response_requested: bool,
    pub kind: RequestKind,
    pub cpu: u32,
    pub asid: [u8; 2],
    pub instr_id: u64,
    pub ip: Address,
    pub pf_metadata: u32,
    pub data: Address,
    pub instr_depend_on_me: InstrIdSet,

    /// Set by the prefetcher hook (`Cache::prefetch_line`); only
    /// meaningful for PQ packets. When true the issuing cache must
    /// store the fill; when false it is a "pass-through" PF sent
    /// straight to the lower level's RQ.
    pub fill_this_level: bool,
}

impl Request {
    pub fn new(address: Address, v_address: Address, kind: RequestKind, cpu: u32) -> Self {
        Request {
            address,
            v_address,
            is_translated: true,
            response_requested: true,
            kind,
            cpu,
            asid: [u8::MAX, u8::MAX],
            instr_id: 0,
            ip: Address::default(),
            pf_metadata: 0,
            data: Address::default(),
            instr_depend_on_me: SmallVec::new(),
            fill_this_level: true,
        }
    }

    /// The block-granular collision key used by channel merge rules,
    /// or the page-granular key when the coupled channel is configured
    /// with `match_offset_bits`.
    pub fn collision_key(&self, offset_bits: u32) -> Address {
        self.address.aligned(offset_bits)
    }
}

#[derive(Debug, Clone)]
pub struct Response {
    pub address: Address,
    pub v_address: Address,
    pub data: Address,
    pub pf_metadata: u32,
    pub instr_depend_on_me: InstrIdSet,
}

impl From<&Request> for Response {
    fn from(req: &Request) -> Self {
        Response {
            address: req.address,
            v_address: req.v_address,
            data: req.data,
            pf_metadata: req.pf_metadata,
            instr_depend_on_me: req.instr_depend_on_me.clone(),
        }
    }
}
