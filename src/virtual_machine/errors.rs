use govm_derive::Error;

/// Errors that terminate an execution.
///
/// Language-level faults raised by the interpreted program (division by zero,
/// index out of range, nil dereference) are not represented here: they become
/// recoverable exceptions and only surface as [`VMError::UnhandledPanic`] once
/// they escape the outermost frame.
#[derive(Debug, Error)]
pub enum VMError {
    // ---- fatal resource exhaustion ----
    /// The allocator stayed over its ceiling after a grace collection.
    #[error("allocation limit exceeded: {allocated} bytes charged, limit is {limit}")]
    AllocationLimitExceeded { allocated: i64, limit: i64 },
    /// The gas meter refused a charge.
    #[error("out of gas in {reason}: used {used}, limit {limit}")]
    OutOfGas {
        reason: &'static str,
        used: u64,
        limit: u64,
    },
    /// The machine ran more opcode cycles than configured.
    #[error("cpu cycle overrun: {cycles} > {limit}")]
    CpuCycleOverrun { cycles: u64, limit: u64 },

    // ---- accounting bugs and broken invariants ----
    /// More bytes were released than were ever charged.
    #[error("allocator accounting underflow: releasing {released} from {bytes}")]
    NegativeAllocation { bytes: i64, released: i64 },
    /// An opcode popped from an empty stack.
    #[error("{stack} stack underflow")]
    StackUnderflow { stack: &'static str },
    /// An opcode found the wrong kind of entry on a stack.
    #[error("unexpected {found} while executing {op}")]
    UnexpectedEntry { op: &'static str, found: String },
    /// A byte that does not name any opcode.
    #[error("invalid opcode 0x{0:02x}")]
    InvalidOpcode(u8),
    /// An operand had the wrong type for the operation.
    #[error("{op} expected {expected} but got {actual}")]
    TypeMismatch {
        op: &'static str,
        expected: &'static str,
        actual: String,
    },
    /// A name path pointed outside its block.
    #[error("name path depth {depth} index {index} is out of range")]
    InvalidPath { depth: u8, index: u16 },
    /// A persisted parent block could not be loaded.
    #[error("missing persisted block {0}")]
    MissingBlock(u64),
    /// A machine was checked or returned to the pool with pending state.
    #[error("machine not empty: {details}")]
    MachineNotEmpty { details: String },
    /// The machine was asked to do something only valid on an idle machine.
    #[error("machine is busy: {0}")]
    MachineBusy(&'static str),

    // ---- unsupported ----
    /// Concurrency opcodes are recognized but not executed.
    #[error("{op} is not yet implemented")]
    NotImplemented { op: &'static str },

    // ---- language exceptions ----
    /// An exception escaped every frame without being recovered.
    #[error("{descriptor}\n{stacktrace}")]
    UnhandledPanic {
        descriptor: String,
        stacktrace: String,
    },
}

impl VMError {
    /// Fatal exhaustion errors represent infrastructure limits rather than
    /// program faults.
    pub fn is_exhaustion(&self) -> bool {
        matches!(
            self,
            VMError::AllocationLimitExceeded { .. }
                | VMError::OutOfGas { .. }
                | VMError::CpuCycleOverrun { .. }
        )
    }

    /// Accounting and invariant failures point at a defect in the core.
    pub fn is_internal(&self) -> bool {
        matches!(
            self,
            VMError::NegativeAllocation { .. }
                | VMError::StackUnderflow { .. }
                | VMError::UnexpectedEntry { .. }
                | VMError::InvalidOpcode(_)
                | VMError::InvalidPath { .. }
                | VMError::MachineNotEmpty { .. }
        )
    }
}
