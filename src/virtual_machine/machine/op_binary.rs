use super::Machine;
use crate::virtual_machine::errors::VMError;
use crate::virtual_machine::isa::Op;
use crate::virtual_machine::types::Kind;
use crate::virtual_machine::values::TypedValue;
use num_bigint::BigInt;
use std::cmp::Ordering;

const DIVIDE_BY_ZERO: &str = "runtime error: integer divide by zero";
const NEGATIVE_SHIFT: &str = "runtime error: negative shift amount";
const BIGINT_OVERFLOW: &str = "runtime error: big integer overflow";

impl Machine {
    pub(super) fn do_unary(&mut self, op: Op) -> Result<(), VMError> {
        let x = self.pop_value()?;
        let result = match (op, x.kind()) {
            (Op::Upos, Some(Kind::Int | Kind::Uint8 | Kind::BigInt)) => x,
            (Op::Uneg, Some(Kind::Int)) => TypedValue::int(x.get_int().wrapping_neg()),
            (Op::Uneg, Some(Kind::Uint8)) => TypedValue::uint8(x.get_uint8().wrapping_neg()),
            (Op::Uneg, Some(Kind::BigInt)) => self.alloc.new_bigint(-x.get_bigint())?,
            (Op::Unot, Some(Kind::Bool)) => TypedValue::boolean(!x.get_bool()),
            (Op::Uxor, Some(Kind::Int)) => TypedValue::int(!x.get_int()),
            (Op::Uxor, Some(Kind::Uint8)) => TypedValue::uint8(!x.get_uint8()),
            (Op::Uxor, Some(Kind::BigInt)) => self.alloc.new_bigint(!x.get_bigint())?,
            _ => {
                return Err(VMError::TypeMismatch {
                    op: op.mnemonic(),
                    expected: if op == Op::Unot { "bool" } else { "numeric" },
                    actual: x.type_name(),
                });
            }
        };
        self.values.push(result);
        Ok(())
    }

    pub(super) fn do_binary(&mut self, op: Op) -> Result<(), VMError> {
        let y = self.pop_value()?;
        let x = self.pop_value()?;
        if let Some(fault) = self.runtime_fault(op, &x, &y) {
            return self.raise(fault);
        }
        let result = self.apply_binary(op, &x, &y)?;
        self.values.push(result);
        Ok(())
    }

    /// Applies a binary operator to two operands of the same kind. Runtime
    /// faults must have been ruled out by the caller.
    pub(super) fn apply_binary(
        &mut self,
        op: Op,
        x: &TypedValue,
        y: &TypedValue,
    ) -> Result<TypedValue, VMError> {
        match op {
            Op::Eql => return Ok(TypedValue::boolean(x.equals(y)?)),
            Op::Neq => return Ok(TypedValue::boolean(!x.equals(y)?)),
            Op::Shl | Op::Shr => return self.shift(op, x, y),
            _ => {}
        }
        if x.kind() != y.kind() {
            return Err(mismatch(op, x, y));
        }
        match op {
            Op::Lor => Ok(TypedValue::boolean(x.expect_bool("lor")? || y.get_bool())),
            Op::Land => Ok(TypedValue::boolean(x.expect_bool("land")? && y.get_bool())),
            Op::Lss | Op::Leq | Op::Gtr | Op::Geq => {
                let ord = compare(x, y).ok_or_else(|| mismatch(op, x, y))?;
                let holds = match op {
                    Op::Lss => ord == Ordering::Less,
                    Op::Leq => ord != Ordering::Greater,
                    Op::Gtr => ord == Ordering::Greater,
                    _ => ord != Ordering::Less,
                };
                Ok(TypedValue::boolean(holds))
            }
            _ => match x.kind() {
                Some(Kind::Int) => int_arith(op, x.get_int(), y.get_int())
                    .map(TypedValue::int)
                    .ok_or_else(|| mismatch(op, x, y)),
                Some(Kind::Uint8) => uint8_arith(op, x.get_uint8(), y.get_uint8())
                    .map(TypedValue::uint8)
                    .ok_or_else(|| mismatch(op, x, y)),
                Some(Kind::String) if op == Op::Add => {
                    let joined = [x.get_bytes(), y.get_bytes()].concat();
                    self.alloc.new_string(&joined)
                }
                Some(Kind::BigInt) => {
                    let (a, b) = (x.get_bigint(), y.get_bigint());
                    let r = match op {
                        Op::Add => a + b,
                        Op::Sub => a - b,
                        Op::Mul => a * b,
                        Op::Quo => a / b,
                        Op::Rem => a % b,
                        Op::Bor => a | b,
                        Op::Xor => a ^ b,
                        Op::Band => a & b,
                        Op::Bandn => a & !b,
                        _ => return Err(mismatch(op, x, y)),
                    };
                    self.alloc.new_bigint(r)
                }
                _ => Err(mismatch(op, x, y)),
            },
        }
    }

    /// Runtime error raised by `x op y`, if any. Big integer results are
    /// bounded before they are built.
    pub(super) fn runtime_fault(
        &self,
        op: Op,
        x: &TypedValue,
        y: &TypedValue,
    ) -> Option<&'static str> {
        match op {
            Op::Quo | Op::Rem => {
                let zero = match y.kind() {
                    Some(Kind::Int) => y.get_int() == 0,
                    Some(Kind::Uint8) => y.get_uint8() == 0,
                    Some(Kind::BigInt) => y.get_bigint() == BigInt::default(),
                    _ => false,
                };
                zero.then_some(DIVIDE_BY_ZERO)
            }
            Op::Shl | Op::Shr => {
                if y.kind() == Some(Kind::Int) && y.get_int() < 0 {
                    return Some(NEGATIVE_SHIFT);
                }
                if op == Op::Shr || x.kind() != Some(Kind::BigInt) {
                    return None;
                }
                let v = x.get_bigint();
                let count = match y.kind() {
                    Some(Kind::Int) => y.get_int() as u64,
                    Some(Kind::Uint8) => y.get_uint8() as u64,
                    _ => return None,
                };
                let bits = v.bits().saturating_add(count);
                (v != BigInt::default() && bits > self.max_bigint_bits).then_some(BIGINT_OVERFLOW)
            }
            Op::Mul if x.kind() == Some(Kind::BigInt) && y.kind() == Some(Kind::BigInt) => {
                let bits = x.get_bigint().bits() + y.get_bigint().bits();
                (bits > self.max_bigint_bits).then_some(BIGINT_OVERFLOW)
            }
            _ => None,
        }
    }

    fn shift(&mut self, op: Op, x: &TypedValue, y: &TypedValue) -> Result<TypedValue, VMError> {
        let count = match y.kind() {
            Some(Kind::Int) => y.get_int().max(0) as u64,
            Some(Kind::Uint8) => y.get_uint8() as u64,
            _ => return Err(mismatch(op, x, y)),
        };
        let left = op == Op::Shl;
        match x.kind() {
            Some(Kind::Int) => {
                let v = x.get_int();
                let r = match (left, count >= 64) {
                    (true, true) => 0,
                    (true, false) => v.wrapping_shl(count as u32),
                    (false, true) => v >> 63,
                    (false, false) => v >> count,
                };
                Ok(TypedValue::int(r))
            }
            Some(Kind::Uint8) => {
                let v = x.get_uint8();
                let r = if count >= 8 {
                    0
                } else if left {
                    v.wrapping_shl(count as u32)
                } else {
                    v >> count
                };
                Ok(TypedValue::uint8(r))
            }
            Some(Kind::BigInt) => {
                let v = x.get_bigint();
                if left {
                    self.alloc.new_bigint(v << count)
                } else {
                    self.alloc.new_bigint(v >> count)
                }
            }
            _ => Err(mismatch(op, x, y)),
        }
    }
}

fn int_arith(op: Op, a: i64, b: i64) -> Option<i64> {
    Some(match op {
        Op::Add => a.wrapping_add(b),
        Op::Sub => a.wrapping_sub(b),
        Op::Mul => a.wrapping_mul(b),
        Op::Quo => a.wrapping_div(b),
        Op::Rem => a.wrapping_rem(b),
        Op::Bor => a | b,
        Op::Xor => a ^ b,
        Op::Band => a & b,
        Op::Bandn => a & !b,
        _ => return None,
    })
}

fn uint8_arith(op: Op, a: u8, b: u8) -> Option<u8> {
    Some(match op {
        Op::Add => a.wrapping_add(b),
        Op::Sub => a.wrapping_sub(b),
        Op::Mul => a.wrapping_mul(b),
        Op::Quo => a / b,
        Op::Rem => a % b,
        Op::Bor => a | b,
        Op::Xor => a ^ b,
        Op::Band => a & b,
        Op::Bandn => a & !b,
        _ => return None,
    })
}

fn compare(x: &TypedValue, y: &TypedValue) -> Option<Ordering> {
    match x.kind()? {
        Kind::Int => Some(x.get_int().cmp(&y.get_int())),
        Kind::Uint8 => Some(x.get_uint8().cmp(&y.get_uint8())),
        Kind::String => Some(x.get_bytes().cmp(y.get_bytes())),
        Kind::BigInt => Some(x.get_bigint().cmp(&y.get_bigint())),
        _ => None,
    }
}

fn mismatch(op: Op, x: &TypedValue, y: &TypedValue) -> VMError {
    VMError::TypeMismatch {
        op: op.mnemonic(),
        expected: "matching operand types",
        actual: format!("{} and {}", x.type_name(), y.type_name()),
    }
}
