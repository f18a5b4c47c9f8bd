// SPDX-License-Identifier: MPL-2.0

//! Thin wrapper around the `x86_64` crate's port I/O primitives.

use core::marker::PhantomData;

use x86_64::instructions::port::{PortReadAccess, PortWriteAccess};

pub trait PortRead: PortReadAccess {}
impl<T: PortReadAccess> PortRead for T {}

pub trait PortWrite: PortWriteAccess {}
impl<T: PortWriteAccess> PortWrite for T {}

pub trait PortReadWriteAccess: PortReadAccess + PortWriteAccess {}
impl<T: PortReadAccess + PortWriteAccess> PortReadWriteAccess for T {}

/// A typed I/O port at a fixed address.
pub struct IoPort<T, A> {
    port: u16,
    phantom: PhantomData<(T, A)>,
}

pub struct ReadOnlyAccess;
pub struct WriteOnlyAccess;
pub struct ReadWriteAccess;

impl<T: PortRead> IoPort<T, ReadOnlyAccess> {
    /// # Safety
    ///
    /// The caller must ensure the given port does not break memory safety.
    pub const unsafe fn new(port: u16) -> Self {
        Self { port, phantom: PhantomData }
    }

    pub fn read(&self) -> T {
        unsafe { x86_64::instructions::port::PortReadOnly::new(self.port).read() }
    }
}

impl<T: PortWrite> IoPort<T, WriteOnlyAccess> {
    /// # Safety
    ///
    /// The caller must ensure the given port does not break memory safety.
    pub const unsafe fn new(port: u16) -> Self {
        Self { port, phantom: PhantomData }
    }

    pub fn write(&self, value: T) {
        unsafe { x86_64::instructions::port::PortWriteOnly::new(self.port).write(value) }
    }
}

impl<T: PortReadWriteAccess> IoPort<T, ReadWriteAccess> {
    /// # Safety
    ///
    /// The caller must ensure the given port does not break memory safety.
    pub const unsafe fn new(port: u16) -> Self {
        Self { port, phantom: PhantomData }
    }

    pub fn read(&self) -> T {
        unsafe { x86_64::instructions::port::Port::new(self.port).read() }
    }

    pub fn write(&self, value: T) {
        unsafe { x86_64::instructions::port::Port::new(self.port).write(value) }
    }
}
