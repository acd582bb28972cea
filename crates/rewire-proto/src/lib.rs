//! Wire shape of the control channel's three commands.
//!
//! A kernel-mediated control channel carries these across
//! `ioctl(REW_CMD, *cmd)` as `struct cmd { type, start, len, mapping_base,
//! payload }`. This crate keeps that shape explicit even though
//! `rewire-kernel` dispatches it in-process (both ends live in one address
//! space here) — a future out-of-tree transport could deserialize the same
//! fields off a real ioctl buffer rather than invent a new protocol.

use strum::FromRepr;

pub use rewire_types::PageId;

/// Identifies one live mapping within a client, playing the role a
/// `mapping_base` address would play on a raw ioctl buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MappingId(u64);

impl MappingId {
    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }
}

/// The three control-channel command kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr)]
#[repr(u8)]
pub enum CommandKind {
    SetPageIds = 0,
    GetPageIds = 1,
    CreatePageIds = 2,
}

/// Direction of the command's payload buffer.
#[derive(Debug)]
pub enum Payload<'a> {
    /// Userspace -> channel: page ids to install (`SET_PAGE_IDS`).
    In(&'a [PageId]),
    /// Channel -> userspace: page ids to report (`GET_PAGE_IDS`,
    /// `CREATE_PAGE_IDS`).
    Out(&'a mut [PageId]),
}

impl Payload<'_> {
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::In(s) => s.len(),
            Self::Out(s) => s.len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One control-channel command.
///
/// `CREATE_PAGE_IDS` carries no `mapping` — a type-level guarantee, not a
/// runtime check, that it never has a mapping table to accidentally touch.
#[derive(Debug)]
pub struct Command<'a> {
    pub kind: CommandKind,
    pub mapping: Option<MappingId>,
    pub start: usize,
    pub payload: Payload<'a>,
}

impl<'a> Command<'a> {
    #[must_use]
    pub fn set_page_ids(mapping: MappingId, start: usize, ids: &'a [PageId]) -> Self {
        Self {
            kind: CommandKind::SetPageIds,
            mapping: Some(mapping),
            start,
            payload: Payload::In(ids),
        }
    }

    #[must_use]
    pub fn get_page_ids(mapping: MappingId, start: usize, out: &'a mut [PageId]) -> Self {
        Self {
            kind: CommandKind::GetPageIds,
            mapping: Some(mapping),
            start,
            payload: Payload::Out(out),
        }
    }

    #[must_use]
    pub fn create_page_ids(out: &'a mut [PageId]) -> Self {
        Self {
            kind: CommandKind::CreatePageIds,
            mapping: None,
            start: 0,
            payload: Payload::Out(out),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}
