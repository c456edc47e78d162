// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Fixed pools of transfer buffers and the [`Transfer`] type that carries a
//! pooled buffer through the peripheral controller.

use std::collections::VecDeque;
use std::fmt::Debug;
use std::sync::Weak;
use thiserror::Error;

/// The endpoint role a pool serves.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Role {
    /// Interrupt IN, response-available notifications.
    Notification,
    /// Bulk IN, frames sent to the host.
    BulkIn,
    /// Bulk OUT, frames received from the host.
    BulkOut,
}

/// Identifies a buffer slot within the pool for its role.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct BufferId {
    pub role: Role,
    pub index: u32,
}

enum Slot {
    Idle(Box<[u8]>),
    InFlight,
    Released,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReturnError {
    #[error("pool has been released")]
    Released,
    #[error("buffer {0} is not in flight")]
    NotInFlight(u32),
    #[error("buffer {0} does not belong to this pool")]
    UnknownBuffer(u32),
}

/// A bounded set of buffers for one endpoint role. Each slot is either idle
/// (owned by the pool and listed in `free`) or in flight (owned by a
/// [`Transfer`]).
pub struct BufferPool {
    role: Role,
    slots: Vec<Slot>,
    free: VecDeque<u32>,
    buffer_len: usize,
    released: bool,
}

impl BufferPool {
    /// Creates a pool of `count` buffers, each with room for the controller's
    /// per-transfer header followed by `data_len` bytes.
    pub fn new(role: Role, count: u32, header_len: usize, data_len: usize) -> Self {
        let buffer_len = header_len + data_len;
        Self {
            role,
            slots: (0..count)
                .map(|_| Slot::Idle(vec![0; buffer_len].into()))
                .collect(),
            free: (0..count).collect(),
            buffer_len,
            released: false,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn idle(&self) -> usize {
        self.free.len()
    }

    pub fn in_flight(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| matches!(slot, Slot::InFlight))
            .count()
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    /// Takes an idle buffer, or returns `None` immediately if there is none.
    pub fn acquire(&mut self) -> Option<(BufferId, Box<[u8]>)> {
        let index = self.free.pop_front()?;
        let slot = std::mem::replace(&mut self.slots[index as usize], Slot::InFlight);
        let Slot::Idle(buffer) = slot else {
            unreachable!("free list entry {index} was not idle");
        };
        Some((
            BufferId {
                role: self.role,
                index,
            },
            buffer,
        ))
    }

    /// Returns an in-flight buffer to the pool. After [`Self::release`] the
    /// buffer is dropped instead.
    pub fn put(&mut self, index: u32, buffer: Box<[u8]>) -> Result<(), ReturnError> {
        if self.released {
            return Err(ReturnError::Released);
        }
        let slot = self
            .slots
            .get_mut(index as usize)
            .ok_or(ReturnError::UnknownBuffer(index))?;
        if !matches!(slot, Slot::InFlight) {
            return Err(ReturnError::NotInFlight(index));
        }
        if buffer.len() != self.buffer_len {
            return Err(ReturnError::UnknownBuffer(index));
        }
        *slot = Slot::Idle(buffer);
        self.free.push_back(index);
        Ok(())
    }

    /// Frees every idle buffer. Buffers still in flight are dropped when
    /// they come back.
    pub fn release(&mut self) {
        self.released = true;
        self.free.clear();
        for slot in &mut self.slots {
            *slot = Slot::Released;
        }
    }
}

/// Outcome of a transfer reported by the peripheral controller.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TransferStatus {
    /// The transfer finished; `actual` bytes were moved.
    Completed { actual: usize },
    /// The transfer was cancelled, by endpoint disable or shutdown.
    Cancelled,
    /// The transfer failed on the bus.
    Failed,
}

pub(crate) trait CompleteTransfer: Send + Sync {
    fn transfer_complete(&self, transfer: Transfer, status: TransferStatus);
}

/// A pooled buffer submitted to an endpoint.
///
/// The controller owns the transfer from [`UsbFunction::submit_transfer`]
/// until it calls [`Transfer::complete`], which hands the buffer back to the
/// engine.
///
/// [`UsbFunction::submit_transfer`]: crate::UsbFunction::submit_transfer
pub struct Transfer {
    endpoint: u8,
    id: BufferId,
    buffer: Box<[u8]>,
    header_len: usize,
    len: usize,
    owner: Weak<dyn CompleteTransfer>,
}

impl Debug for Transfer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transfer")
            .field("endpoint", &self.endpoint)
            .field("id", &self.id)
            .field("len", &self.len)
            .finish()
    }
}

impl Transfer {
    pub(crate) fn new(
        endpoint: u8,
        id: BufferId,
        buffer: Box<[u8]>,
        header_len: usize,
        len: usize,
        owner: Weak<dyn CompleteTransfer>,
    ) -> Self {
        Self {
            endpoint,
            id,
            buffer,
            header_len,
            len,
            owner,
        }
    }

    /// The endpoint address the transfer is queued on.
    pub fn endpoint(&self) -> u8 {
        self.endpoint
    }

    pub fn id(&self) -> BufferId {
        self.id
    }

    /// For IN transfers, the number of bytes to send. For OUT transfers, the
    /// number of bytes received once completed, or the capacity before.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The valid data bytes.
    pub fn data(&self) -> &[u8] {
        &self.buffer[self.header_len..][..self.len]
    }

    /// The whole data area, for the controller to fill on OUT transfers.
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.buffer[self.header_len..]
    }

    /// Scratch space reserved for the controller's own bookkeeping.
    pub fn header_mut(&mut self) -> &mut [u8] {
        &mut self.buffer[..self.header_len]
    }

    /// Completes the transfer, returning its buffer to the engine.
    pub fn complete(mut self, status: TransferStatus) {
        if let TransferStatus::Completed { actual } = status {
            self.len = actual.min(self.buffer.len() - self.header_len);
        }
        if let Some(owner) = self.owner.upgrade() {
            owner.transfer_complete(self, status);
        }
    }

    pub(crate) fn into_buffer(self) -> (BufferId, Box<[u8]>) {
        (self.id, self.buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::BufferPool;
    use super::ReturnError;
    use super::Role;

    #[test]
    fn test_acquire_and_put() {
        let mut pool = BufferPool::new(Role::BulkIn, 3, 16, 64);
        assert_eq!((pool.capacity(), pool.idle(), pool.in_flight()), (3, 3, 0));

        let (a, buf_a) = pool.acquire().unwrap();
        let (b, buf_b) = pool.acquire().unwrap();
        let (c, buf_c) = pool.acquire().unwrap();
        assert_eq!(buf_a.len(), 80);
        assert_eq!((a.index, b.index, c.index), (0, 1, 2));
        assert!(pool.acquire().is_none());
        assert_eq!(pool.in_flight(), 3);

        pool.put(b.index, buf_b).unwrap();
        assert_eq!(pool.idle(), 1);
        let (again, buf_again) = pool.acquire().unwrap();
        assert_eq!(again.index, 1);

        pool.put(again.index, buf_again).unwrap();
        pool.put(a.index, buf_a).unwrap();
        pool.put(c.index, buf_c).unwrap();
        assert_eq!((pool.idle(), pool.in_flight()), (3, 0));
    }

    #[test]
    fn test_double_return_rejected() {
        let mut pool = BufferPool::new(Role::BulkOut, 2, 0, 8);
        let (id, buf) = pool.acquire().unwrap();
        let copy = buf.clone();
        pool.put(id.index, buf).unwrap();
        assert_eq!(pool.put(id.index, copy), Err(ReturnError::NotInFlight(0)));
        assert_eq!(
            pool.put(7, vec![0; 8].into()),
            Err(ReturnError::UnknownBuffer(7))
        );
        assert_eq!(pool.idle(), 2);
    }

    #[test]
    fn test_release_ignores_late_returns() {
        let mut pool = BufferPool::new(Role::Notification, 2, 0, 8);
        let (id, buf) = pool.acquire().unwrap();
        pool.release();
        assert!(pool.is_released());
        assert_eq!(pool.idle(), 0);
        assert!(pool.acquire().is_none());
        assert_eq!(pool.put(id.index, buf), Err(ReturnError::Released));
        pool.release();
        assert!(pool.acquire().is_none());
    }
}
