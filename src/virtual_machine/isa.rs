//! Opcode table for the interpreter.
//!
//! Every opcode appears exactly once in [`for_each_op!`] together with its
//! mnemonic and its fixed CPU cost. The table is the single source of truth:
//! the [`Op`] enum, byte decoding, mnemonics and cost lookups are all
//! generated from it, and `isa_static_check` pins its contents.
//!
//! Opcodes at or above `0xD0` are *sticky*: the run loop peeks them instead
//! of popping, so they stay on the op stack until they pop themselves.

/// First opcode value that is left on the op stack when executed.
pub const STICKY_OP_START: u8 = 0xD0;

/// Invokes `$callback!` with the full opcode table.
///
/// Row format: `Name = code, "mnemonic", cpu_cost`.
#[macro_export]
macro_rules! for_each_op {
    ($callback:ident) => {
        $callback! {
            // ---- control ----
            /// Stops the run loop.
            Halt = 0x01, "halt", 1,
            /// Does nothing.
            Noop = 0x02, "noop", 1,
            /// Executes the statement on top of the statement stack.
            Exec = 0x03, "exec", 25,
            /// Inspects the evaluated callee and schedules the matching call.
            Precall = 0x04, "precall", 207,
            /// Enters a user function: builds its block and schedules its body.
            Call = 0x05, "call", 256,
            /// Runs a builtin implemented by the host.
            CallNativeBody = 0x06, "call_native_body", 424,
            /// Pushes the function's results and pops its frame.
            ReturnFromBlock = 0x08, "return_from_block", 36,
            /// Copies returned values into the function block's result slots.
            ReturnToBlock = 0x09, "return_to_block", 23,
            /// Records a deferred call on the current call frame.
            Defer = 0x0A, "defer", 64,
            /// Goroutine launch; unsupported.
            Go = 0x0C, "go", 1,
            /// Channel select; unsupported.
            Select = 0x0D, "select", 1,
            /// Picks a branch of an if statement.
            IfCond = 0x11, "if_cond", 33,
            /// Discards one value.
            PopValue = 0x12, "pop_value", 1,
            /// Discards the results of the last call.
            PopResults = 0x13, "pop_results", 1,
            /// Leaves the innermost lexical block.
            PopBlock = 0x14, "pop_block", 3,
            /// Truncates every stack to the innermost frame and pops it.
            PopFrameAndReset = 0x15, "pop_frame_and_reset", 15,
            /// Starts unwinding with the value on top of the value stack.
            Panic1 = 0x16, "panic1", 121,
            /// Continues unwinding after a frame's deferred calls ran.
            Panic2 = 0x17, "panic2", 21,

            // ---- unary ----
            Upos = 0x20, "upos", 7,
            Uneg = 0x21, "uneg", 25,
            Unot = 0x22, "unot", 6,
            Uxor = 0x23, "uxor", 14,

            // ---- binary ----
            Lor = 0x26, "lor", 26,
            Land = 0x27, "land", 24,
            Eql = 0x28, "eql", 160,
            Neq = 0x29, "neq", 95,
            Lss = 0x2A, "lss", 13,
            Leq = 0x2B, "leq", 19,
            Gtr = 0x2C, "gtr", 20,
            Geq = 0x2D, "geq", 26,
            Add = 0x2E, "add", 18,
            Sub = 0x2F, "sub", 6,
            Bor = 0x30, "bor", 23,
            Xor = 0x31, "xor", 13,
            Mul = 0x32, "mul", 19,
            Quo = 0x33, "quo", 16,
            Rem = 0x34, "rem", 18,
            Shl = 0x35, "shl", 22,
            Shr = 0x36, "shr", 20,
            Band = 0x37, "band", 9,
            Bandn = 0x38, "bandn", 15,

            // ---- expressions ----
            /// Evaluates the expression on top of the expression stack.
            Eval = 0x40, "eval", 29,
            /// Short-circuit check between the operands of `&&` and `||`.
            Binary1 = 0x41, "binary1", 19,
            Index1 = 0x42, "index1", 77,
            /// Map index in comma-ok form.
            Index2 = 0x43, "index2", 195,
            Selector = 0x44, "selector", 32,
            Slice = 0x45, "slice", 103,
            Star = 0x46, "star", 40,
            Ref = 0x47, "ref", 125,
            ArrayLit = 0x4C, "array_lit", 137,
            SliceLit = 0x4D, "slice_lit", 183,
            MapLit = 0x4F, "map_lit", 475,
            StructLit = 0x50, "struct_lit", 179,
            FuncLit = 0x51, "func_lit", 61,

            // ---- statements ----
            Assign = 0x80, "assign", 79,
            AddAssign = 0x81, "add_assign", 85,
            SubAssign = 0x82, "sub_assign", 57,
            MulAssign = 0x83, "mul_assign", 55,
            Define = 0x8C, "define", 111,
            Inc = 0x8D, "inc", 76,
            Dec = 0x8E, "dec", 76,

            // ---- sticky ----
            /// Steps through the statements of the innermost body.
            Body = 0xD1, "body", 43,
            /// Drives a for loop through init, condition, body and post.
            ForLoop = 0xD2, "for_loop", 27,
            /// Runs the innermost call frame's deferred calls, last first.
            ReturnCallDefers = 0xD7, "return_call_defers", 78,
        }
    };
}

/// Generates [`Op`] and its lookups from the rows of [`for_each_op!`].
#[macro_export]
macro_rules! define_ops {
    (
        $( $(#[$doc:meta])* $name:ident = $code:literal, $mnemonic:literal, $cpu:literal ),* $(,)?
    ) => {
        /// A single interpreter opcode.
        #[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
        #[repr(u8)]
        pub enum Op {
            $( $(#[$doc])* $name = $code, )*
        }

        impl TryFrom<u8> for Op {
            type Error = $crate::virtual_machine::errors::VMError;

            fn try_from(value: u8) -> Result<Self, Self::Error> {
                match value {
                    $( $code => Ok(Op::$name), )*
                    _ => Err($crate::virtual_machine::errors::VMError::InvalidOpcode(value)),
                }
            }
        }

        impl Op {
            /// Every opcode in table order.
            pub const ALL: &'static [Op] = &[ $( Op::$name, )* ];

            /// Returns the opcode's mnemonic.
            pub const fn mnemonic(&self) -> &'static str {
                match self {
                    $( Op::$name => $mnemonic, )*
                }
            }

            /// Returns the fixed CPU cycles charged each time the opcode runs.
            pub const fn cpu_cost(&self) -> u64 {
                match self {
                    $( Op::$name => $cpu, )*
                }
            }
        }
    };
}

for_each_op!(define_ops);

impl Op {
    /// Sticky opcodes are peeked by the run loop and pop themselves.
    #[inline]
    pub const fn is_sticky(&self) -> bool {
        *self as u8 >= STICKY_OP_START
    }
}

impl std::fmt::Display for Op {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.mnemonic())
    }
}
