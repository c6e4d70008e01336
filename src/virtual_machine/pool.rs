//! Reuse of drained machines.
//!
//! A machine goes back to the pool only after [`Machine::check_empty`]
//! confirms that every stack drained. Accepted machines are
//! [`reset`](Machine::reset) before they are handed out again, so no value,
//! counter or gas budget of one execution is visible to the next. Dirty
//! machines are dropped.

use crate::error;
use crate::virtual_machine::errors::VMError;
use crate::virtual_machine::machine::{Machine, MachineOptions};

pub struct MachinePool {
    options: MachineOptions,
    idle: Vec<Machine>,
}

impl MachinePool {
    pub fn new(options: MachineOptions) -> Self {
        Self {
            options,
            idle: Vec::new(),
        }
    }

    /// An idle machine, or a new one if none is left.
    pub fn acquire(&mut self) -> Machine {
        match self.idle.pop() {
            Some(m) => m,
            None => Machine::new(self.options.clone()),
        }
    }

    /// Returns `m` to the pool. A machine with leftover state is dropped and
    /// the leftover is reported.
    pub fn release(&mut self, mut m: Machine) -> Result<(), VMError> {
        if let Err(err) = m.check_empty() {
            error!(target: "pool", "rejected machine: {}", err);
            return Err(err);
        }
        m.reset();
        self.idle.push(m);
        Ok(())
    }

    /// Number of idle machines.
    pub fn len(&self) -> usize {
        self.idle.len()
    }

    pub fn is_empty(&self) -> bool {
        self.idle.is_empty()
    }
}
