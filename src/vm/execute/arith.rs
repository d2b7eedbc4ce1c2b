// Arithmetic, bitwise, comparison and concatenation.
//
// Int op Int stays Int with 64-bit wraparound (division and modulo by zero
// are errors); any Float promotes both sides. Everything else falls back to
// a metamethod on the class of the non-numeric operand, and a missing
// metamethod is a type error.

use crate::value::Value;
use crate::vm::{CrocVm, ExecResult, MetaName, OpCode};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    BAnd,
    BOr,
    BXor,
    Shl,
    Shr,
    UShr,
}

impl ArithOp {
    pub(crate) fn from_opcode(op: OpCode) -> ArithOp {
        match op {
            OpCode::Add => ArithOp::Add,
            OpCode::Sub => ArithOp::Sub,
            OpCode::Mul => ArithOp::Mul,
            OpCode::Div => ArithOp::Div,
            OpCode::Mod => ArithOp::Mod,
            OpCode::BAnd => ArithOp::BAnd,
            OpCode::BOr => ArithOp::BOr,
            OpCode::BXor => ArithOp::BXor,
            OpCode::Shl => ArithOp::Shl,
            OpCode::Shr => ArithOp::Shr,
            OpCode::UShr => ArithOp::UShr,
            _ => unreachable!("not an arithmetic opcode"),
        }
    }

    fn is_bitwise(self) -> bool {
        matches!(
            self,
            ArithOp::BAnd | ArithOp::BOr | ArithOp::BXor | ArithOp::Shl | ArithOp::Shr | ArithOp::UShr
        )
    }

    fn metamethod(self) -> MetaName {
        match self {
            ArithOp::Add => MetaName::Add,
            ArithOp::Sub => MetaName::Sub,
            ArithOp::Mul => MetaName::Mul,
            ArithOp::Div => MetaName::Div,
            ArithOp::Mod => MetaName::Mod,
            ArithOp::BAnd => MetaName::And,
            ArithOp::BOr => MetaName::Or,
            ArithOp::BXor => MetaName::Xor,
            ArithOp::Shl => MetaName::Shl,
            ArithOp::Shr => MetaName::Shr,
            ArithOp::UShr => MetaName::UShr,
        }
    }

    fn symbol(self) -> &'static str {
        match self {
            ArithOp::Add => "+",
            ArithOp::Sub => "-",
            ArithOp::Mul => "*",
            ArithOp::Div => "/",
            ArithOp::Mod => "%",
            ArithOp::BAnd => "&",
            ArithOp::BOr => "|",
            ArithOp::BXor => "^",
            ArithOp::Shl => "<<",
            ArithOp::Shr => ">>",
            ArithOp::UShr => ">>>",
        }
    }
}

pub(crate) fn arith_binary(vm: &mut CrocVm, op: ArithOp, a: Value, b: Value) -> ExecResult<Value> {
    if op.is_bitwise() {
        if let (Some(x), Some(y)) = (a.as_int(), b.as_int()) {
            let r = match op {
                ArithOp::BAnd => x & y,
                ArithOp::BOr => x | y,
                ArithOp::BXor => x ^ y,
                ArithOp::Shl => x.wrapping_shl(y as u32),
                ArithOp::Shr => x.wrapping_shr(y as u32),
                ArithOp::UShr => ((x as u64).wrapping_shr(y as u32)) as i64,
                _ => unreachable!(),
            };
            return Ok(Value::int(r));
        }
        return arith_metamethod(vm, op, a, b);
    }

    if let (Some(x), Some(y)) = (a.as_int(), b.as_int()) {
        let r = match op {
            ArithOp::Add => x.wrapping_add(y),
            ArithOp::Sub => x.wrapping_sub(y),
            ArithOp::Mul => x.wrapping_mul(y),
            ArithOp::Div => {
                if y == 0 {
                    return Err(vm.value_error("integer divide by zero".into()));
                }
                x.wrapping_div(y)
            }
            ArithOp::Mod => {
                if y == 0 {
                    return Err(vm.value_error("integer modulo by zero".into()));
                }
                x.wrapping_rem(y)
            }
            _ => unreachable!(),
        };
        return Ok(Value::int(r));
    }

    if a.is_number() && b.is_number() {
        let x = a.as_number().expect("number");
        let y = b.as_number().expect("number");
        let r = match op {
            ArithOp::Add => x + y,
            ArithOp::Sub => x - y,
            ArithOp::Mul => x * y,
            ArithOp::Div => x / y,
            ArithOp::Mod => x % y,
            _ => unreachable!(),
        };
        return Ok(Value::float(r));
    }

    arith_metamethod(vm, op, a, b)
}

fn arith_metamethod(vm: &mut CrocVm, op: ArithOp, a: Value, b: Value) -> ExecResult<Value> {
    let meta = op.metamethod();
    if let Some(mm) = vm.get_metamethod(&a, meta) {
        let r = vm.call_value(mm, &[a, b], 1)?;
        return Ok(r.into_iter().next().unwrap_or_default());
    }
    if let Some(reflected) = meta.reflected() {
        if let Some(mm) = vm.get_metamethod(&b, reflected) {
            let r = vm.call_value(mm, &[b, a], 1)?;
            return Ok(r.into_iter().next().unwrap_or_default());
        }
    }
    Err(vm.type_error(format!(
        "cannot apply '{}' to {} and {}",
        op.symbol(),
        a.kind().name(),
        b.kind().name()
    )))
}

pub(crate) fn arith_unary(vm: &mut CrocVm, meta: MetaName, v: Value) -> ExecResult<Value> {
    match meta {
        MetaName::Neg => {
            if let Some(i) = v.as_int() {
                return Ok(Value::int(i.wrapping_neg()));
            }
            if let Some(f) = v.as_float() {
                return Ok(Value::float(-f));
            }
        }
        MetaName::Com => {
            if let Some(i) = v.as_int() {
                return Ok(Value::int(!i));
            }
        }
        _ => {}
    }
    if let Some(mm) = vm.get_metamethod(&v, meta) {
        let r = vm.call_value(mm, &[v], 1)?;
        return Ok(r.into_iter().next().unwrap_or_default());
    }
    Err(vm.type_error(format!(
        "cannot apply unary {} to a {}",
        if meta == MetaName::Neg { "-" } else { "~" },
        v.kind().name()
    )))
}

/// Three-way comparison: negative, zero or positive.
pub(crate) fn cmp_values(vm: &mut CrocVm, a: Value, b: Value) -> ExecResult<i32> {
    if let (Some(x), Some(y)) = (a.as_int(), b.as_int()) {
        return Ok(match x.cmp(&y) {
            std::cmp::Ordering::Less => -1,
            std::cmp::Ordering::Equal => 0,
            std::cmp::Ordering::Greater => 1,
        });
    }
    if a.is_number() && b.is_number() {
        let x = a.as_number().expect("number");
        let y = b.as_number().expect("number");
        return match x.partial_cmp(&y) {
            Some(std::cmp::Ordering::Less) => Ok(-1),
            Some(std::cmp::Ordering::Equal) => Ok(0),
            Some(std::cmp::Ordering::Greater) => Ok(1),
            None => Err(vm.value_error("cannot order NaN".into())),
        };
    }
    if let (Some(x), Some(y)) = (a.as_string_id(), b.as_string_id()) {
        let sx = vm.pool.str_of(x);
        let sy = vm.pool.str_of(y);
        return Ok(match sx.cmp(sy) {
            std::cmp::Ordering::Less => -1,
            std::cmp::Ordering::Equal => 0,
            std::cmp::Ordering::Greater => 1,
        });
    }

    if let Some(mm) = vm.get_metamethod(&a, MetaName::Cmp) {
        let r = vm.call_value(mm, &[a, b], 1)?;
        let v = r.into_iter().next().unwrap_or_default();
        return v
            .as_int()
            .map(|i| i.signum() as i32)
            .ok_or_else(|| vm.type_error("opCmp must return an int".into()));
    }
    if let Some(mm) = vm.get_metamethod(&b, MetaName::Cmp) {
        let r = vm.call_value(mm, &[b, a], 1)?;
        let v = r.into_iter().next().unwrap_or_default();
        return v
            .as_int()
            .map(|i| -(i.signum() as i32))
            .ok_or_else(|| vm.type_error("opCmp must return an int".into()));
    }

    Err(vm.type_error(format!(
        "cannot compare {} and {}",
        a.kind().name(),
        b.kind().name()
    )))
}

/// N-ary concatenation. All-string runs concatenate directly; a leading
/// array builds a new array; anything else resolves pairwise through
/// opCat / opCat_r.
pub(crate) fn cat_values(vm: &mut CrocVm, parts: &[Value]) -> ExecResult<Value> {
    if parts.is_empty() {
        return Ok(vm.new_string(""));
    }

    if parts.iter().all(|p| p.is_string()) {
        let mut s = String::new();
        for p in parts {
            s.push_str(vm.pool.str_of(p.as_string_id().expect("string")));
        }
        return Ok(vm.new_string(&s));
    }

    if parts[0].is_array() {
        let mut values = Vec::new();
        for p in parts {
            match p.as_array_id() {
                Some(aid) => {
                    if let Some(arr) = vm.pool.array(aid) {
                        values.extend(arr.values());
                    }
                }
                None => values.push(*p),
            }
        }
        return Ok(vm.new_array_from(values));
    }

    // Pairwise left fold with metamethod fallback.
    let mut acc = parts[0];
    for &next in &parts[1..] {
        acc = cat_pair(vm, acc, next)?;
    }
    Ok(acc)
}

fn cat_pair(vm: &mut CrocVm, a: Value, b: Value) -> ExecResult<Value> {
    if a.is_string() && b.is_string() {
        let mut s = vm.pool.str_of(a.as_string_id().expect("string")).to_string();
        s.push_str(vm.pool.str_of(b.as_string_id().expect("string")));
        return Ok(vm.new_string(&s));
    }
    if let Some(mm) = vm.get_metamethod(&a, MetaName::Cat) {
        let r = vm.call_value(mm, &[a, b], 1)?;
        return Ok(r.into_iter().next().unwrap_or_default());
    }
    if let Some(mm) = vm.get_metamethod(&b, MetaName::CatR) {
        let r = vm.call_value(mm, &[b, a], 1)?;
        return Ok(r.into_iter().next().unwrap_or_default());
    }
    Err(vm.type_error(format!(
        "cannot concatenate {} and {}",
        a.kind().name(),
        b.kind().name()
    )))
}
