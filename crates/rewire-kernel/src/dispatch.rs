//! Control-channel command dispatch.
//!
//! Plays the role a big `switch` over command type would play in a kernel
//! module's `ioctl` handler, minus the copy to/from userspace buffers (the
//! caller already holds plain Rust slices). Every arm here takes exactly
//! one lock, for exactly the duration of its own work, via
//! [`Client::set_page_ids`] / [`Client::with_mapping_mut`] /
//! [`Client::with_pool_mut`] — there is no path that unlocks twice or
//! forgets to unlock.

use rewire_proto::{Command, CommandKind, Payload};
use rewire_types::{PageId, RewireError};

use crate::client::Client;

/// Executes one control command against `client`.
///
/// `CREATE_PAGE_IDS` never takes a mapping lock at all — it only ever
/// touches the client's page pool — so there is no mapping table for it
/// to corrupt even by accident.
pub fn handle_command(client: &Client, cmd: Command<'_>) -> Result<(), RewireError> {
    match cmd.kind {
        CommandKind::CreatePageIds => {
            let Payload::Out(out) = cmd.payload else {
                unreachable!("CREATE_PAGE_IDS always carries an Out payload")
            };
            // Allocate into a scratch buffer first: if any allocation runs
            // out of memory, the command is abandoned in full and `out` is
            // left untouched, matching "no partial mutation is committed".
            let result = client.with_pool_mut(|pool| {
                let mut scratch = Vec::with_capacity(out.len());
                for _ in 0..out.len() {
                    let id = pool.alloc_new_page();
                    if id.is_unassigned() {
                        return Err(RewireError::OutOfMemory);
                    }
                    scratch.push(id);
                }
                Ok(scratch)
            });
            let scratch: Vec<PageId> = result?;
            out.copy_from_slice(&scratch);
            Ok(())
        }

        CommandKind::SetPageIds => {
            let mapping = cmd
                .mapping
                .expect("SET_PAGE_IDS always names a mapping");
            let Payload::In(ids) = cmd.payload else {
                unreachable!("SET_PAGE_IDS always carries an In payload")
            };
            let start = cmd.start;

            client.set_page_ids(mapping, start, ids).unwrap_or_else(|| {
                Err(RewireError::InvalidState {
                    op: "SET_PAGE_IDS: no such mapping",
                    num_pages: 0,
                })
            })
        }

        CommandKind::GetPageIds => {
            let mapping = cmd
                .mapping
                .expect("GET_PAGE_IDS always names a mapping");
            let Payload::Out(out) = cmd.payload else {
                unreachable!("GET_PAGE_IDS always carries an Out payload")
            };
            let start = cmd.start;

            client
                .with_mapping_mut(mapping, |table, _pool| {
                    let num_pages = table.len();
                    let end = start.checked_add(out.len()).unwrap_or(usize::MAX);
                    if end > num_pages {
                        return Err(RewireError::OutOfBounds {
                            start,
                            end,
                            num_pages,
                        });
                    }
                    for (i, slot) in out.iter_mut().enumerate() {
                        *slot = table.get(start + i);
                    }
                    Ok(())
                })
                .unwrap_or_else(|| {
                    Err(RewireError::InvalidState {
                        op: "GET_PAGE_IDS: no such mapping",
                        num_pages: 0,
                    })
                })
        }
    }
}
