// src/core/launcher/ports.rs

//! Port pair allocation for launched patterns: gRPC ports start at the
//! configured base and stride by 10; the health port is always gRPC + 1.

use crate::core::errors::CitrineError;
use parking_lot::Mutex;
use std::collections::BTreeSet;

const PORT_STRIDE: u16 = 10;

/// The port pair injected into one pattern process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortPair {
    pub grpc: u16,
    pub health: u16,
}

#[derive(Debug)]
struct PortInner {
    next: u16,
    free: BTreeSet<u16>,
}

/// Hands out gRPC/health port pairs, reusing released pairs first.
#[derive(Debug)]
pub struct PortAllocator {
    inner: Mutex<PortInner>,
}

impl PortAllocator {
    pub fn new(base: u16) -> Self {
        Self {
            inner: Mutex::new(PortInner {
                next: base,
                free: BTreeSet::new(),
            }),
        }
    }

    pub fn allocate(&self) -> Result<PortPair, CitrineError> {
        let mut inner = self.inner.lock();
        let grpc = match inner.free.pop_first() {
            Some(port) => port,
            None => {
                let port = inner.next;
                inner.next = inner.next.checked_add(PORT_STRIDE).ok_or_else(|| {
                    CitrineError::Launch("port space exhausted".to_string())
                })?;
                port
            }
        };
        let health = grpc.checked_add(1).ok_or_else(|| {
            CitrineError::Launch("port space exhausted".to_string())
        })?;
        Ok(PortPair { grpc, health })
    }

    pub fn release(&self, pair: PortPair) {
        self.inner.lock().free.insert(pair.grpc);
    }
}
