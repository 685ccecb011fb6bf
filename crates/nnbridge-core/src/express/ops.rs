//! Operators over [`Var`]s.
//!
//! Broadcasting is limited to scalars: operands must have equal shapes, or
//! one of them must hold a single element. `BiasAdd` additionally broadcasts
//! a 1-D bias along the last axis.

use crate::error::{Result, RuntimeError};

use super::var::{element_count, Var, VarData};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Subtract,
    Multiply,
    Divide,
    Pow,
    Minimum,
    Maximum,
    Greater,
    GreaterEqual,
    Less,
    LessEqual,
    Equal,
    SquaredDifference,
    FloorDiv,
    FloorMod,
    Atan2,
    BiasAdd,
}

impl BinaryOp {
    fn is_comparison(&self) -> bool {
        matches!(
            self,
            BinaryOp::Greater | BinaryOp::GreaterEqual | BinaryOp::Less | BinaryOp::LessEqual | BinaryOp::Equal
        )
    }

    /// Integer operands stay integer for these.
    fn closed_over_int(&self) -> bool {
        matches!(
            self,
            BinaryOp::Add
                | BinaryOp::Subtract
                | BinaryOp::Multiply
                | BinaryOp::Minimum
                | BinaryOp::Maximum
                | BinaryOp::SquaredDifference
                | BinaryOp::FloorDiv
                | BinaryOp::FloorMod
                | BinaryOp::BiasAdd
        )
    }

    fn eval(&self, x: f64, y: f64) -> f64 {
        let flag = |b: bool| if b { 1.0 } else { 0.0 };
        match self {
            BinaryOp::Add | BinaryOp::BiasAdd => x + y,
            BinaryOp::Subtract => x - y,
            BinaryOp::Multiply => x * y,
            BinaryOp::Divide => x / y,
            BinaryOp::Pow => x.powf(y),
            BinaryOp::Minimum => x.min(y),
            BinaryOp::Maximum => x.max(y),
            BinaryOp::Greater => flag(x > y),
            BinaryOp::GreaterEqual => flag(x >= y),
            BinaryOp::Less => flag(x < y),
            BinaryOp::LessEqual => flag(x <= y),
            BinaryOp::Equal => flag(x == y),
            BinaryOp::SquaredDifference => (x - y) * (x - y),
            BinaryOp::FloorDiv => (x / y).floor(),
            BinaryOp::FloorMod => x - (x / y).floor() * y,
            BinaryOp::Atan2 => x.atan2(y),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Sign,
    Abs,
    Negative,
    Floor,
    Round,
    Ceil,
    Square,
    Sqrt,
    Rsqrt,
    Exp,
    Log,
    Sin,
    Cos,
    Tan,
    Asin,
    Acos,
    Atan,
    Reciprocal,
    Tanh,
    Sigmoid,
}

impl UnaryOp {
    fn closed_over_int(&self) -> bool {
        matches!(
            self,
            UnaryOp::Sign | UnaryOp::Abs | UnaryOp::Negative | UnaryOp::Square | UnaryOp::Floor | UnaryOp::Ceil | UnaryOp::Round
        )
    }

    fn eval(&self, x: f64) -> f64 {
        match self {
            UnaryOp::Sign => {
                if x > 0.0 {
                    1.0
                } else if x < 0.0 {
                    -1.0
                } else {
                    0.0
                }
            }
            UnaryOp::Abs => x.abs(),
            UnaryOp::Negative => -x,
            UnaryOp::Floor => x.floor(),
            UnaryOp::Round => x.round(),
            UnaryOp::Ceil => x.ceil(),
            UnaryOp::Square => x * x,
            UnaryOp::Sqrt => x.sqrt(),
            UnaryOp::Rsqrt => 1.0 / x.sqrt(),
            UnaryOp::Exp => x.exp(),
            UnaryOp::Log => x.ln(),
            UnaryOp::Sin => x.sin(),
            UnaryOp::Cos => x.cos(),
            UnaryOp::Tan => x.tan(),
            UnaryOp::Asin => x.asin(),
            UnaryOp::Acos => x.acos(),
            UnaryOp::Atan => x.atan(),
            UnaryOp::Reciprocal => 1.0 / x,
            UnaryOp::Tanh => x.tanh(),
            UnaryOp::Sigmoid => 1.0 / (1.0 + (-x).exp()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReduceOp {
    Sum,
    Mean,
    Max,
    Min,
    Prod,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CastTarget {
    Float,
    Int,
}

fn build(shape: Vec<i32>, values: Vec<f64>, as_int: bool) -> Result<Var> {
    let data = if as_int {
        VarData::Int(values.into_iter().map(|v| v as i32).collect())
    } else {
        VarData::Float(values.into_iter().map(|v| v as f32).collect())
    };
    Var::new(shape, data)
}

fn size_error(op: &str, detail: String) -> RuntimeError {
    RuntimeError::ComputeSize {
        op: op.to_string(),
        detail,
    }
}

pub fn binary(op: BinaryOp, a: &Var, b: &Var) -> Result<Var> {
    let (na, nb) = (a.element_size(), b.element_size());
    let shape = if a.shape() == b.shape() {
        a.shape().to_vec()
    } else if nb == 1 {
        a.shape().to_vec()
    } else if na == 1 {
        b.shape().to_vec()
    } else if op == BinaryOp::BiasAdd && b.shape().len() == 1 && a.shape().last() == Some(&b.shape()[0]) {
        a.shape().to_vec()
    } else {
        return Err(size_error(
            &format!("{:?}", op),
            format!("cannot broadcast {:?} with {:?}", a.shape(), b.shape()),
        ));
    };

    let n = element_count(&shape)?;
    let values = (0..n)
        .map(|i| {
            let x = a.data().get_f64(if na == 1 { 0 } else { i % na });
            let y = b.data().get_f64(if nb == 1 { 0 } else { i % nb });
            op.eval(x, y)
        })
        .collect();
    let both_int = !a.is_float() && !b.is_float();
    build(shape, values, op.is_comparison() || (both_int && op.closed_over_int()))
}

pub fn unary(op: UnaryOp, x: &Var) -> Result<Var> {
    let values = (0..x.element_size()).map(|i| op.eval(x.data().get_f64(i))).collect();
    build(x.shape().to_vec(), values, !x.is_float() && op.closed_over_int())
}

fn normalize_axes(axes: &[i32], rank: usize) -> Result<Vec<usize>> {
    if axes.is_empty() {
        return Ok((0..rank).collect());
    }
    let mut out = Vec::with_capacity(axes.len());
    for &axis in axes {
        let a = if axis < 0 { axis + rank as i32 } else { axis };
        if a < 0 || a as usize >= rank {
            return Err(RuntimeError::invalid(format!("axis {} out of range for rank {}", axis, rank)));
        }
        if !out.contains(&(a as usize)) {
            out.push(a as usize);
        }
    }
    Ok(out)
}

fn strides(shape: &[i32]) -> Vec<usize> {
    let mut strides = vec![1usize; shape.len()];
    for i in (0..shape.len().saturating_sub(1)).rev() {
        strides[i] = strides[i + 1] * shape[i + 1].max(0) as usize;
    }
    strides
}

/// Reduce over `axes` (all axes when empty). Negative axes count from the end.
pub fn reduce(op: ReduceOp, x: &Var, axes: &[i32], keep_dims: bool) -> Result<Var> {
    let shape = x.shape();
    let axes = normalize_axes(axes, shape.len())?;

    let kept_shape: Vec<i32> = shape
        .iter()
        .enumerate()
        .map(|(i, &d)| if axes.contains(&i) { 1 } else { d })
        .collect();
    let out_count = element_count(&kept_shape)?;
    let in_strides = strides(shape);
    let out_strides = strides(&kept_shape);

    let init = match op {
        ReduceOp::Sum | ReduceOp::Mean => 0.0,
        ReduceOp::Prod => 1.0,
        ReduceOp::Max => f64::NEG_INFINITY,
        ReduceOp::Min => f64::INFINITY,
    };
    let mut acc = vec![init; out_count];
    let mut counts = vec![0usize; out_count];

    for i in 0..x.element_size() {
        let mut out_index = 0;
        for (dim, &stride) in in_strides.iter().enumerate() {
            let coord = (i / stride) % shape[dim].max(1) as usize;
            if !axes.contains(&dim) {
                out_index += coord * out_strides[dim];
            }
        }
        let v = x.data().get_f64(i);
        let slot = &mut acc[out_index];
        *slot = match op {
            ReduceOp::Sum | ReduceOp::Mean => *slot + v,
            ReduceOp::Prod => *slot * v,
            ReduceOp::Max => slot.max(v),
            ReduceOp::Min => slot.min(v),
        };
        counts[out_index] += 1;
    }
    if op == ReduceOp::Mean {
        for (value, &count) in acc.iter_mut().zip(&counts) {
            if count > 0 {
                *value /= count as f64;
            }
        }
    }

    let out_shape = if keep_dims {
        kept_shape
    } else {
        shape
            .iter()
            .enumerate()
            .filter(|(i, _)| !axes.contains(i))
            .map(|(_, &d)| d)
            .collect()
    };
    build(out_shape, acc, !x.is_float() && op != ReduceOp::Mean)
}

pub fn cast(x: &Var, target: CastTarget) -> Result<Var> {
    let values = (0..x.element_size()).map(|i| x.data().get_f64(i)).collect();
    build(x.shape().to_vec(), values, target == CastTarget::Int)
}

/// Zeroed output buffer; `None` means the element count overflowed.
fn zeroed_f32(count: Option<usize>) -> Result<Vec<f32>> {
    let count = count.ok_or(RuntimeError::OutOfMemory { bytes: usize::MAX })?;
    let mut out = Vec::new();
    out.try_reserve_exact(count).map_err(|_| RuntimeError::OutOfMemory {
        bytes: count.saturating_mul(std::mem::size_of::<f32>()),
    })?;
    out.resize(count, 0.0);
    Ok(out)
}

fn matmul_core(a: &[f32], b: &[f32], m: usize, k: usize, n: usize, ta: bool, tb: bool) -> Result<Vec<f32>> {
    let mut out = zeroed_f32(m.checked_mul(n))?;
    for i in 0..m {
        for j in 0..n {
            let mut sum = 0.0f32;
            for p in 0..k {
                let av = if ta { a[p * m + i] } else { a[i * k + p] };
                let bv = if tb { b[j * k + p] } else { b[p * n + j] };
                sum += av * bv;
            }
            out[i * n + j] = sum;
        }
    }
    Ok(out)
}

fn matmul_dims(a: &[i32], b: &[i32], ta: bool, tb: bool) -> Result<(usize, usize, usize)> {
    let (m, ka) = if ta { (a[1], a[0]) } else { (a[0], a[1]) };
    let (kb, n) = if tb { (b[1], b[0]) } else { (b[0], b[1]) };
    if ka != kb {
        return Err(size_error("MatMul", format!("inner dimensions {} and {} differ", ka, kb)));
    }
    Ok((m.max(0) as usize, ka.max(0) as usize, n.max(0) as usize))
}

/// 2-D matrix product with optional transposes.
pub fn mat_mul(a: &Var, b: &Var, transpose_a: bool, transpose_b: bool) -> Result<Var> {
    if a.shape().len() != 2 || b.shape().len() != 2 {
        return Err(size_error("MatMul", format!("expected 2-D operands, got {:?} and {:?}", a.shape(), b.shape())));
    }
    let (m, k, n) = matmul_dims(a.shape(), b.shape(), transpose_a, transpose_b)?;
    let out = matmul_core(&a.data().to_f32(), &b.data().to_f32(), m, k, n, transpose_a, transpose_b)?;
    Var::new(vec![m as i32, n as i32], VarData::Float(out))
}

/// Batched 3-D matrix product; batch extents must match.
pub fn batch_mat_mul(a: &Var, b: &Var, adj_x: bool, adj_y: bool) -> Result<Var> {
    if a.shape().len() != 3 || b.shape().len() != 3 || a.shape()[0] != b.shape()[0] {
        return Err(size_error(
            "BatchMatMul",
            format!("expected 3-D operands with equal batch, got {:?} and {:?}", a.shape(), b.shape()),
        ));
    }
    let batch = a.shape()[0].max(0) as usize;
    let (m, k, n) = matmul_dims(&a.shape()[1..], &b.shape()[1..], adj_x, adj_y)?;
    let (ad, bd) = (a.data().to_f32(), b.data().to_f32());
    let mut out = zeroed_f32(batch.checked_mul(m).and_then(|bm| bm.checked_mul(n)))?;
    for i in 0..batch {
        let sa = &ad[i * m * k..(i + 1) * m * k];
        let sb = &bd[i * k * n..(i + 1) * k * n];
        out[i * m * n..(i + 1) * m * n].copy_from_slice(&matmul_core(sa, sb, m, k, n, adj_x, adj_y)?);
    }
    Var::new(vec![batch as i32, m as i32, n as i32], VarData::Float(out))
}

fn arg_reduce(x: &Var, axis: i32, pick_max: bool) -> Result<Var> {
    let shape = x.shape();
    let axis = normalize_axes(&[axis], shape.len())?[0];
    let outer: usize = shape[..axis].iter().map(|&d| d as usize).product();
    let extent = shape[axis] as usize;
    let inner: usize = shape[axis + 1..].iter().map(|&d| d as usize).product();

    let mut out = Vec::with_capacity(outer * inner);
    for o in 0..outer {
        for i in 0..inner {
            let mut best = 0usize;
            for e in 1..extent {
                let candidate = x.data().get_f64((o * extent + e) * inner + i);
                let current = x.data().get_f64((o * extent + best) * inner + i);
                if (pick_max && candidate > current) || (!pick_max && candidate < current) {
                    best = e;
                }
            }
            out.push(best as i32);
        }
    }
    let out_shape = shape
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != axis)
        .map(|(_, &d)| d)
        .collect();
    Var::new(out_shape, VarData::Int(out))
}

pub fn arg_max(x: &Var, axis: i32) -> Result<Var> {
    arg_reduce(x, axis, true)
}

pub fn arg_min(x: &Var, axis: i32) -> Result<Var> {
    arg_reduce(x, axis, false)
}
