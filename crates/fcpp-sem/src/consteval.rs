//! Compile-time constant values.
//!
//! [`ConstValue`] is the result type of the constexpr evaluator in the
//! parser crate; it also appears in non-type template arguments and
//! enumerator values, which is why it lives here with the registries. The
//! arithmetic helpers implement width-aware two's-complement semantics with
//! explicit overflow and division failure modes.

use thiserror::Error;

/// Why a constant evaluation failed.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum ConstEvalError {
    #[error("expression is not a constant expression")]
    NotConstant,
    #[error("overflow in constant expression")]
    Overflow,
    #[error("division by zero in constant expression")]
    DivByZero,
}

/// Binary operators understood by the evaluator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConstBinOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    BitAnd,
    BitOr,
    BitXor,
    Shl,
    Shr,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
    LogicalAnd,
    LogicalOr,
}

/// Unary operators understood by the evaluator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConstUnOp {
    Neg,
    BitNot,
    LogicalNot,
    Plus,
}

/// A compile-time constant.
///
/// Integers carry their width and signedness so that wrapping and comparison
/// behave like the C++ type they came from. Character values are integers of
/// width 8.
#[derive(Clone, Copy, Debug)]
pub enum ConstValue {
    Int { value: i64, bits: u8, signed: bool },
    Float(f64),
    Bool(bool),
}

impl ConstValue {
    /// A plain `int` constant.
    pub fn int(value: i64) -> Self {
        ConstValue::Int {
            value,
            bits: 32,
            signed: true,
        }
    }

    /// Truthiness under C++ conversion rules.
    pub fn as_bool(&self) -> bool {
        match *self {
            ConstValue::Int { value, .. } => value != 0,
            ConstValue::Float(f) => f != 0.0,
            ConstValue::Bool(b) => b,
        }
    }

    /// Integer value, if this is an integer or bool.
    pub fn as_int(&self) -> Result<i64, ConstEvalError> {
        match *self {
            ConstValue::Int { value, .. } => Ok(value),
            ConstValue::Bool(b) => Ok(b as i64),
            ConstValue::Float(_) => Err(ConstEvalError::NotConstant),
        }
    }

    /// Apply a binary operator.
    pub fn binary(op: ConstBinOp, lhs: ConstValue, rhs: ConstValue) -> Result<ConstValue, ConstEvalError> {
        use ConstBinOp::*;
        // Logical operators work on truthiness regardless of operand kind.
        match op {
            LogicalAnd => return Ok(ConstValue::Bool(lhs.as_bool() && rhs.as_bool())),
            LogicalOr => return Ok(ConstValue::Bool(lhs.as_bool() || rhs.as_bool())),
            _ => {}
        }
        // Float arithmetic if either side is float.
        if matches!(lhs, ConstValue::Float(_)) || matches!(rhs, ConstValue::Float(_)) {
            return Self::binary_float(op, lhs.to_f64(), rhs.to_f64());
        }
        let a = lhs.as_int()?;
        let b = rhs.as_int()?;
        let (bits, signed) = Self::common_int_shape(&lhs, &rhs);
        let wrap = |v: Option<i64>| -> Result<ConstValue, ConstEvalError> {
            let value = v.ok_or(ConstEvalError::Overflow)?;
            Ok(ConstValue::Int {
                value: truncate(value, bits, signed),
                bits,
                signed,
            })
        };
        match op {
            Add => wrap(a.checked_add(b)),
            Sub => wrap(a.checked_sub(b)),
            Mul => wrap(a.checked_mul(b)),
            Div => {
                if b == 0 {
                    Err(ConstEvalError::DivByZero)
                } else {
                    wrap(a.checked_div(b))
                }
            }
            Rem => {
                if b == 0 {
                    Err(ConstEvalError::DivByZero)
                } else {
                    wrap(a.checked_rem(b))
                }
            }
            BitAnd => wrap(Some(a & b)),
            BitOr => wrap(Some(a | b)),
            BitXor => wrap(Some(a ^ b)),
            Shl => wrap(a.checked_shl(u32::try_from(b).map_err(|_| ConstEvalError::Overflow)?)),
            Shr => wrap(a.checked_shr(u32::try_from(b).map_err(|_| ConstEvalError::Overflow)?)),
            Lt => Ok(ConstValue::Bool(a < b)),
            Le => Ok(ConstValue::Bool(a <= b)),
            Gt => Ok(ConstValue::Bool(a > b)),
            Ge => Ok(ConstValue::Bool(a >= b)),
            Eq => Ok(ConstValue::Bool(a == b)),
            Ne => Ok(ConstValue::Bool(a != b)),
            LogicalAnd | LogicalOr => unreachable!("handled above"),
        }
    }

    /// Apply a unary operator.
    pub fn unary(op: ConstUnOp, operand: ConstValue) -> Result<ConstValue, ConstEvalError> {
        match op {
            ConstUnOp::LogicalNot => Ok(ConstValue::Bool(!operand.as_bool())),
            ConstUnOp::Plus => Ok(operand),
            ConstUnOp::Neg => match operand {
                ConstValue::Float(f) => Ok(ConstValue::Float(-f)),
                _ => {
                    let v = operand.as_int()?;
                    let negated = v.checked_neg().ok_or(ConstEvalError::Overflow)?;
                    let (bits, signed) = Self::common_int_shape(&operand, &operand);
                    Ok(ConstValue::Int {
                        value: truncate(negated, bits, signed),
                        bits,
                        signed,
                    })
                }
            },
            ConstUnOp::BitNot => {
                let v = operand.as_int()?;
                let (bits, signed) = Self::common_int_shape(&operand, &operand);
                Ok(ConstValue::Int {
                    value: truncate(!v, bits, signed),
                    bits,
                    signed,
                })
            }
        }
    }

    fn binary_float(op: ConstBinOp, a: f64, b: f64) -> Result<ConstValue, ConstEvalError> {
        use ConstBinOp::*;
        Ok(match op {
            Add => ConstValue::Float(a + b),
            Sub => ConstValue::Float(a - b),
            Mul => ConstValue::Float(a * b),
            Div => {
                if b == 0.0 {
                    return Err(ConstEvalError::DivByZero);
                }
                ConstValue::Float(a / b)
            }
            Lt => ConstValue::Bool(a < b),
            Le => ConstValue::Bool(a <= b),
            Gt => ConstValue::Bool(a > b),
            Ge => ConstValue::Bool(a >= b),
            Eq => ConstValue::Bool(a == b),
            Ne => ConstValue::Bool(a != b),
            _ => return Err(ConstEvalError::NotConstant),
        })
    }

    fn to_f64(&self) -> f64 {
        match *self {
            ConstValue::Int { value, .. } => value as f64,
            ConstValue::Float(f) => f,
            ConstValue::Bool(b) => b as u8 as f64,
        }
    }

    /// Usual-arithmetic-conversion shape for two integer operands: the wider
    /// width wins, at least `int`, unsigned wins at equal width.
    fn common_int_shape(lhs: &ConstValue, rhs: &ConstValue) -> (u8, bool) {
        let shape = |v: &ConstValue| match *v {
            ConstValue::Int { bits, signed, .. } => (bits.max(32), signed),
            ConstValue::Bool(_) => (32, true),
            ConstValue::Float(_) => (64, true),
        };
        let (lb, ls) = shape(lhs);
        let (rb, rs) = shape(rhs);
        let bits = lb.max(rb);
        let signed = if lb == rb { ls && rs } else if lb > rb { ls } else { rs };
        (bits, signed)
    }
}

/// Truncate a value to `bits`, sign- or zero-extending back into i64.
fn truncate(value: i64, bits: u8, signed: bool) -> i64 {
    if bits >= 64 {
        return value;
    }
    let mask = (1i64 << bits) - 1;
    let low = value & mask;
    if signed && (low >> (bits - 1)) & 1 == 1 {
        low | !mask
    } else {
        low
    }
}

impl PartialEq for ConstValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (
                ConstValue::Int { value: a, bits: ab, signed: asg },
                ConstValue::Int { value: b, bits: bb, signed: bsg },
            ) => a == b && ab == bb && asg == bsg,
            (ConstValue::Float(a), ConstValue::Float(b)) => a.to_bits() == b.to_bits(),
            (ConstValue::Bool(a), ConstValue::Bool(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for ConstValue {}

impl std::hash::Hash for ConstValue {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            ConstValue::Int { value, bits, signed } => {
                value.hash(state);
                bits.hash(state);
                signed.hash(state);
            }
            ConstValue::Float(f) => f.to_bits().hash(state),
            ConstValue::Bool(b) => b.hash(state),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_int_arithmetic() {
        let a = ConstValue::int(20);
        let b = ConstValue::int(22);
        assert_eq!(
            ConstValue::binary(ConstBinOp::Add, a, b).unwrap().as_int(),
            Ok(42)
        );
    }

    #[test]
    fn test_div_by_zero() {
        let a = ConstValue::int(1);
        let z = ConstValue::int(0);
        assert_eq!(
            ConstValue::binary(ConstBinOp::Div, a, z),
            Err(ConstEvalError::DivByZero)
        );
        assert_eq!(
            ConstValue::binary(ConstBinOp::Rem, a, z),
            Err(ConstEvalError::DivByZero)
        );
    }

    #[test]
    fn test_overflow_detected() {
        let big = ConstValue::Int {
            value: i64::MAX,
            bits: 64,
            signed: true,
        };
        assert_eq!(
            ConstValue::binary(ConstBinOp::Add, big, ConstValue::int(1)),
            Err(ConstEvalError::Overflow)
        );
    }

    #[test]
    fn test_narrow_width_wraps_to_int() {
        // 8-bit operands promote to int before arithmetic.
        let a = ConstValue::Int { value: 200, bits: 8, signed: false };
        let b = ConstValue::Int { value: 100, bits: 8, signed: false };
        let sum = ConstValue::binary(ConstBinOp::Add, a, b).unwrap();
        assert_eq!(sum.as_int(), Ok(300));
    }

    #[test]
    fn test_comparisons_yield_bool() {
        let r = ConstValue::binary(ConstBinOp::Lt, ConstValue::int(1), ConstValue::int(2)).unwrap();
        assert_eq!(r, ConstValue::Bool(true));
    }

    #[test]
    fn test_logical_short_circuit_semantics() {
        let t = ConstValue::Bool(true);
        let f = ConstValue::Bool(false);
        assert_eq!(
            ConstValue::binary(ConstBinOp::LogicalAnd, t, f).unwrap(),
            ConstValue::Bool(false)
        );
        assert_eq!(
            ConstValue::binary(ConstBinOp::LogicalOr, t, f).unwrap(),
            ConstValue::Bool(true)
        );
    }

    #[test]
    fn test_unary() {
        assert_eq!(
            ConstValue::unary(ConstUnOp::Neg, ConstValue::int(5)).unwrap().as_int(),
            Ok(-5)
        );
        assert_eq!(
            ConstValue::unary(ConstUnOp::LogicalNot, ConstValue::int(0)).unwrap(),
            ConstValue::Bool(true)
        );
        assert_eq!(
            ConstValue::unary(ConstUnOp::BitNot, ConstValue::int(0)).unwrap().as_int(),
            Ok(-1)
        );
    }

    #[test]
    fn test_float_mixing() {
        let r = ConstValue::binary(ConstBinOp::Mul, ConstValue::Float(1.5), ConstValue::int(4))
            .unwrap();
        assert_eq!(r, ConstValue::Float(6.0));
    }

    #[test]
    fn test_hash_eq_consistency() {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};
        let a = ConstValue::int(7);
        let b = ConstValue::int(7);
        let mut ha = DefaultHasher::new();
        let mut hb = DefaultHasher::new();
        a.hash(&mut ha);
        b.hash(&mut hb);
        assert_eq!(a, b);
        assert_eq!(ha.finish(), hb.finish());
    }
}
