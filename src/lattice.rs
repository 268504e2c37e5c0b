//! The four-height value lattice used by constant propagation, together with the rules for
//! evaluating a single operation over it.
//!
//! ```text
//!              top
//!      /     |       \
//!   const  const   rel(base, off) ...
//!      \     |       /
//!             bottom
//! ```
//!
//! A relative constant `rel(base, off)` is a value known to be `off` bytes away from the value
//! that the register at `base` held on function entry. It is how stack-pointer derived addresses
//! are tracked before the stack pointer itself is known.

use crate::il::{calc_mask, sign_extend, Address, Opcode};

#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ValueType {
    /// Not yet known; optimistic starting point
    #[default]
    Top,
    /// A known constant, already masked to the size of the value it describes
    Constant(u64),
    /// `offset` bytes from the entry value of the register at `base`
    RelConstant { base: Address, offset: i64 },
    /// Not a constant
    Bottom,
}

impl std::fmt::Debug for ValueType {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            ValueType::Top => write!(f, "top"),
            ValueType::Constant(c) => write!(f, "{:#x}", c),
            ValueType::RelConstant { base, offset } => write!(f, "rel({:?}{:+})", base, offset),
            ValueType::Bottom => write!(f, "bottom"),
        }
    }
}

impl ValueType {
    /// Position in the lattice, counting downwards from `top`
    pub fn height(&self) -> u8 {
        match self {
            ValueType::Top => 0,
            ValueType::Constant(_) | ValueType::RelConstant { .. } => 1,
            ValueType::Bottom => 2,
        }
    }

    pub fn is_top(&self) -> bool {
        matches!(self, ValueType::Top)
    }

    pub fn is_bottom(&self) -> bool {
        matches!(self, ValueType::Bottom)
    }

    pub fn as_constant(&self) -> Option<u64> {
        match self {
            ValueType::Constant(c) => Some(*c),
            _ => None,
        }
    }

    /// Convert a relative constant into a plain one, given the concrete value of its base
    pub fn resolve_relative(&self, base_value: impl Fn(Address) -> Option<u64>) -> Option<u64> {
        match self {
            ValueType::Constant(c) => Some(*c),
            ValueType::RelConstant { base, offset } => {
                Some(base_value(*base)?.wrapping_add(*offset as u64))
            }
            ValueType::Top | ValueType::Bottom => None,
        }
    }

    /// Greatest lower bound, used at merge points. `top` is the identity.
    pub fn meet(&self, other: &ValueType) -> ValueType {
        match (self, other) {
            (ValueType::Top, x) | (x, ValueType::Top) => *x,
            (ValueType::Bottom, _) | (_, ValueType::Bottom) => ValueType::Bottom,
            (a, b) if a == b => *a,
            _ => ValueType::Bottom,
        }
    }

    /// The value to store if `self` is to be updated with `new`, or `None` if nothing changes.
    /// Values only ever move down the lattice; two different values of the same height meet to
    /// `bottom`.
    pub fn lowered_by(&self, new: &ValueType) -> Option<ValueType> {
        match new.height().cmp(&self.height()) {
            std::cmp::Ordering::Less => None,
            std::cmp::Ordering::Greater => Some(*new),
            std::cmp::Ordering::Equal if self == new => None,
            std::cmp::Ordering::Equal => Some(ValueType::Bottom),
        }
    }
}

/// Result of evaluating one operation
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Evaluation {
    pub value: ValueType,
    /// A relative constant was adjusted inside a loop body, where the offset cannot be trusted
    pub stack_unsafe: bool,
}

impl From<ValueType> for Evaluation {
    fn from(value: ValueType) -> Self {
        Self {
            value,
            stack_unsafe: false,
        }
    }
}

/// Evaluate a side-effect free operation over the lattice.
///
/// `inputs` pairs each input value with the byte size of the input varnode. `loop_risk` is set
/// when the operation sits in a loop body and relative offsets computed there should be dropped.
/// Memory, control-flow and merge operations are not handled here and evaluate to `bottom`.
pub fn evaluate(
    opcode: Opcode,
    inputs: &[(ValueType, u32)],
    out_size: u32,
    loop_risk: bool,
) -> Evaluation {
    if inputs.iter().any(|(v, _)| v.is_bottom()) || inputs.is_empty() {
        return ValueType::Bottom.into();
    }
    if inputs.iter().any(|(v, _)| v.is_top()) {
        return ValueType::Top.into();
    }

    if let Some(consts) = inputs
        .iter()
        .map(|(v, sz)| v.as_constant().map(|c| (c, *sz)))
        .collect::<Option<Vec<_>>>()
    {
        return match fold_constant(opcode, &consts, out_size) {
            Some(c) => ValueType::Constant(c),
            None => ValueType::Bottom,
        }
        .into();
    }

    use ValueType::{Constant, RelConstant};
    let adjust = |base: Address, offset: i64, delta: i64| -> Evaluation {
        if loop_risk {
            Evaluation {
                value: ValueType::Bottom,
                stack_unsafe: true,
            }
        } else {
            RelConstant {
                base,
                offset: offset.wrapping_add(delta),
            }
            .into()
        }
    };

    match (opcode, inputs) {
        (Opcode::Copy, [(v @ RelConstant { .. }, _)]) => (*v).into(),
        (Opcode::IntAdd, [(RelConstant { base, offset }, _), (Constant(c), csz)])
        | (Opcode::IntAdd, [(Constant(c), csz), (RelConstant { base, offset }, _)]) => {
            adjust(*base, *offset, sign_extend(*c, *csz))
        }
        (Opcode::IntSub, [(RelConstant { base, offset }, _), (Constant(c), csz)]) => {
            adjust(*base, *offset, sign_extend(*c, *csz).wrapping_neg())
        }
        (
            op,
            [(RelConstant {
                base: b1,
                offset: o1,
            }, _), (RelConstant {
                base: b2,
                offset: o2,
            }, _)],
        ) if b1 == b2 => match op {
            Opcode::IntSub => Constant((o1.wrapping_sub(*o2) as u64) & calc_mask(out_size)).into(),
            Opcode::IntEqual => Constant((o1 == o2) as u64).into(),
            Opcode::IntNotEqual => Constant((o1 != o2) as u64).into(),
            _ => ValueType::Bottom.into(),
        },
        _ => ValueType::Bottom.into(),
    }
}

/// Fold an operation over constant inputs `(value, size)`. Returns `None` if the operation is
/// not foldable (or undefined, as for a division by zero).
pub fn fold_constant(opcode: Opcode, inputs: &[(u64, u32)], out_size: u32) -> Option<u64> {
    if out_size > 8 || inputs.iter().any(|(_, sz)| *sz > 8) {
        return None;
    }
    let m = |i: usize| -> Option<u64> { inputs.get(i).map(|(v, sz)| v & calc_mask(*sz)) };
    let s = |i: usize| -> Option<i64> { inputs.get(i).map(|(v, sz)| sign_extend(*v, *sz)) };
    let size = |i: usize| -> u32 { inputs.get(i).map_or(0, |(_, sz)| *sz) };
    let sign_bit = |v: u64, sz: u32| -> bool { sz > 0 && (v >> (sz * 8 - 1)) & 1 == 1 };

    use Opcode::*;
    let r: u64 = match opcode {
        Copy | IntZext => m(0)?,
        IntSext => s(0)? as u64,
        IntAdd => m(0)?.wrapping_add(m(1)?),
        IntSub => m(0)?.wrapping_sub(m(1)?),
        IntMult => m(0)?.wrapping_mul(m(1)?),
        IntDiv => m(0)?.checked_div(m(1)?)?,
        IntRem => m(0)?.checked_rem(m(1)?)?,
        IntSDiv => {
            if s(1)? == 0 {
                return None;
            }
            s(0)?.wrapping_div(s(1)?) as u64
        }
        IntSRem => {
            if s(1)? == 0 {
                return None;
            }
            s(0)?.wrapping_rem(s(1)?) as u64
        }
        IntAnd => m(0)? & m(1)?,
        IntOr => m(0)? | m(1)?,
        IntXor => m(0)? ^ m(1)?,
        IntLeft => {
            let sh = m(1)?;
            if sh >= 64 {
                0
            } else {
                m(0)? << sh
            }
        }
        IntRight => {
            let sh = m(1)?;
            if sh >= 64 {
                0
            } else {
                m(0)? >> sh
            }
        }
        IntSRight => (s(0)? >> m(1)?.min(63)) as u64,
        IntNegate => !m(0)?,
        Int2Comp => m(0)?.wrapping_neg(),
        IntEqual => (m(0)? == m(1)?) as u64,
        IntNotEqual => (m(0)? != m(1)?) as u64,
        IntLess => (m(0)? < m(1)?) as u64,
        IntLessEqual => (m(0)? <= m(1)?) as u64,
        IntSLess => (s(0)? < s(1)?) as u64,
        IntSLessEqual => (s(0)? <= s(1)?) as u64,
        IntCarry => {
            let sum = m(0)? as u128 + m(1)? as u128;
            (sum > calc_mask(size(0)) as u128) as u64
        }
        IntSCarry => {
            let sz = size(0);
            let (a, b) = (m(0)?, m(1)?);
            let r = a.wrapping_add(b) & calc_mask(sz);
            let (sa, sb, sr) = (sign_bit(a, sz), sign_bit(b, sz), sign_bit(r, sz));
            (sa == sb && sr != sa) as u64
        }
        IntSBorrow => {
            let sz = size(0);
            let (a, b) = (m(0)?, m(1)?);
            let r = a.wrapping_sub(b) & calc_mask(sz);
            let (sa, sb, sr) = (sign_bit(a, sz), sign_bit(b, sz), sign_bit(r, sz));
            (sa != sb && sr != sa) as u64
        }
        BoolNegate => (m(0)? & 1) ^ 1,
        BoolAnd => m(0)? & m(1)? & 1,
        BoolOr => (m(0)? | m(1)?) & 1,
        BoolXor => (m(0)? ^ m(1)?) & 1,
        Piece => {
            let low = size(1);
            if low >= 8 {
                return None;
            }
            (m(0)? << (low * 8)) | m(1)?
        }
        Subpiece => {
            let sh = m(1)?;
            if sh >= 8 {
                0
            } else {
                m(0)? >> (sh * 8)
            }
        }
        Popcount => m(0)?.count_ones() as u64,
        Load | Store | Branch | Cbranch | BranchInd | Call | CallInd | CallOther | Return
        | MultiEqual | Indirect | Nop => return None,
    };
    Some(r & calc_mask(out_size))
}
