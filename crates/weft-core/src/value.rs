//! Immutable runtime values.
//!
//! Values are a structural tagged sum: equality, ordering and hashing are
//! defined over the contents, never over identity. Floating point fields are
//! compared with `total_cmp` and hashed through their bit patterns so any
//! value can key an ordered map (family ids, scopes, blocks) without pulling
//! nondeterminism into a traversal.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

use crate::errors::WeftError;
use crate::ids::{EnvId, NodeId};

/// Dense row-major matrix of doubles.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Matrix {
    /// Number of rows.
    pub rows: usize,
    /// Number of columns.
    pub cols: usize,
    /// Row-major entries; `data.len() == rows * cols`.
    pub data: Vec<f64>,
}

impl Matrix {
    /// Creates a matrix, checking that the entry count matches the shape.
    pub fn new(rows: usize, cols: usize, data: Vec<f64>) -> Result<Self, WeftError> {
        if data.len() != rows * cols {
            return Err(WeftError::Assertion(format!(
                "matrix shape {rows}x{cols} does not match {} entries",
                data.len()
            )));
        }
        Ok(Self { rows, cols, data })
    }

    /// Returns the entry at `(row, col)`, if in range.
    pub fn get(&self, row: usize, col: usize) -> Option<f64> {
        if row < self.rows && col < self.cols {
            Some(self.data[row * self.cols + col])
        } else {
            None
        }
    }
}

/// Environment requested for an ESR family, described as data.
///
/// Stochastic procedures never touch the trace's environment table directly;
/// they describe the frame they need and the evaluator materializes it when
/// the family is first built.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum EsrEnv {
    /// Evaluate the family in an existing frame.
    Existing(EnvId),
    /// Evaluate under a fresh frame with explicit node bindings.
    Frame {
        /// Parent frame of the new frame, if any.
        parent: Option<EnvId>,
        /// Symbol-to-node bindings installed in the new frame.
        bindings: Vec<(String, NodeId)>,
    },
    /// Evaluate under a fresh frame binding formals to the operand nodes of
    /// the requesting application, in order.
    WithOperands {
        /// Parent frame of the new frame.
        parent: EnvId,
        /// Formal parameter names, one per operand.
        params: Vec<String>,
    },
}

/// A request for a shared sub-trace, identified by a family id.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Esr {
    /// Family id; stable and structural, minted by the requesting procedure.
    pub id: Value,
    /// Expression whose evaluation is requested.
    pub exp: Value,
    /// Environment the expression is evaluated in.
    pub env: EsrEnv,
}

/// A request for procedure-private latent state; opaque to the engine.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Hsr(pub Value);

/// The value of a request node: ordered ESRs followed by ordered HSRs.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RequestValue {
    /// Existing-simulation requests, in evaluation order.
    pub esrs: Vec<Esr>,
    /// Hidden-simulation requests, in simulation order.
    pub hsrs: Vec<Hsr>,
}

impl RequestValue {
    /// Returns whether the request carries neither ESRs nor HSRs.
    pub fn is_empty(&self) -> bool {
        self.esrs.is_empty() && self.hsrs.is_empty()
    }
}

/// Immutable runtime value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Value {
    /// Empty list terminator.
    Nil,
    /// Boolean.
    Bool(bool),
    /// Exact integer.
    Integer(i64),
    /// Double-precision number.
    Number(f64),
    /// Interned-by-content symbol.
    Symbol(String),
    /// Cons pair.
    Pair(Box<Value>, Box<Value>),
    /// Heterogeneous array; also the shape of an application expression.
    Array(Vec<Value>),
    /// Homogeneous numeric vector.
    Vector(Vec<f64>),
    /// Point on a probability simplex.
    Simplex(Vec<f64>),
    /// Dense matrix.
    Matrix(Matrix),
    /// Structural dictionary.
    Dict(BTreeMap<Value, Value>),
    /// Weak reference to the node that made a stochastic procedure.
    SpRef(NodeId),
    /// A node used as a value; blocks of the default scope are node blocks.
    Node(NodeId),
    /// The requests emitted by a request PSP.
    Request(RequestValue),
}

impl Value {
    /// Builds a symbol value.
    pub fn symbol(name: &str) -> Self {
        Value::Symbol(name.to_owned())
    }

    /// Builds a proper list from the given elements.
    pub fn list<I: IntoIterator<Item = Value>>(items: I) -> Self {
        let mut out = Value::Nil;
        let collected: Vec<Value> = items.into_iter().collect();
        for item in collected.into_iter().rev() {
            out = Value::Pair(Box::new(item), Box::new(out));
        }
        out
    }

    /// Returns the kind name used in type-mismatch errors.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Bool(_) => "bool",
            Value::Integer(_) => "integer",
            Value::Number(_) => "number",
            Value::Symbol(_) => "symbol",
            Value::Pair(_, _) => "pair",
            Value::Array(_) => "array",
            Value::Vector(_) => "vector",
            Value::Simplex(_) => "simplex",
            Value::Matrix(_) => "matrix",
            Value::Dict(_) => "dict",
            Value::SpRef(_) => "sp-ref",
            Value::Node(_) => "node",
            Value::Request(_) => "request",
        }
    }

    fn mismatch(&self, expected: &str) -> WeftError {
        WeftError::type_mismatch(expected, self.kind())
    }

    /// Returns the boolean payload.
    pub fn as_bool(&self) -> Result<bool, WeftError> {
        match self {
            Value::Bool(b) => Ok(*b),
            other => Err(other.mismatch("bool")),
        }
    }

    /// Returns the integer payload.
    pub fn as_integer(&self) -> Result<i64, WeftError> {
        match self {
            Value::Integer(i) => Ok(*i),
            other => Err(other.mismatch("integer")),
        }
    }

    /// Returns the numeric payload; integers promote.
    pub fn as_double(&self) -> Result<f64, WeftError> {
        match self {
            Value::Number(x) => Ok(*x),
            Value::Integer(i) => Ok(*i as f64),
            other => Err(other.mismatch("number")),
        }
    }

    /// Returns the symbol payload.
    pub fn as_symbol(&self) -> Result<&str, WeftError> {
        match self {
            Value::Symbol(s) => Ok(s),
            other => Err(other.mismatch("symbol")),
        }
    }

    /// Returns the head and tail of a pair.
    pub fn as_pair(&self) -> Result<(&Value, &Value), WeftError> {
        match self {
            Value::Pair(car, cdr) => Ok((car, cdr)),
            other => Err(other.mismatch("pair")),
        }
    }

    /// Collects a proper list (a nil-terminated pair chain) into a vector.
    pub fn as_list(&self) -> Result<Vec<&Value>, WeftError> {
        let mut items = Vec::new();
        let mut cursor = self;
        loop {
            match cursor {
                Value::Nil => return Ok(items),
                Value::Pair(car, cdr) => {
                    items.push(car.as_ref());
                    cursor = cdr;
                }
                other => return Err(other.mismatch("list")),
            }
        }
    }

    /// Returns the array payload.
    pub fn as_array(&self) -> Result<&[Value], WeftError> {
        match self {
            Value::Array(items) => Ok(items),
            other => Err(other.mismatch("array")),
        }
    }

    /// Returns the numeric vector payload.
    pub fn as_vector(&self) -> Result<&[f64], WeftError> {
        match self {
            Value::Vector(items) => Ok(items),
            other => Err(other.mismatch("vector")),
        }
    }

    /// Returns the simplex payload.
    pub fn as_simplex(&self) -> Result<&[f64], WeftError> {
        match self {
            Value::Simplex(items) => Ok(items),
            other => Err(other.mismatch("simplex")),
        }
    }

    /// Returns the matrix payload.
    pub fn as_matrix(&self) -> Result<&Matrix, WeftError> {
        match self {
            Value::Matrix(m) => Ok(m),
            other => Err(other.mismatch("matrix")),
        }
    }

    /// Returns the dictionary payload.
    pub fn as_dict(&self) -> Result<&BTreeMap<Value, Value>, WeftError> {
        match self {
            Value::Dict(d) => Ok(d),
            other => Err(other.mismatch("dict")),
        }
    }

    /// Returns the maker node of a stochastic-procedure reference.
    pub fn as_sp_ref(&self) -> Result<NodeId, WeftError> {
        match self {
            Value::SpRef(node) => Ok(*node),
            other => Err(other.mismatch("sp-ref")),
        }
    }

    /// Returns the node payload.
    pub fn as_node(&self) -> Result<NodeId, WeftError> {
        match self {
            Value::Node(node) => Ok(*node),
            other => Err(other.mismatch("node")),
        }
    }

    /// Returns the request payload.
    pub fn as_request(&self) -> Result<&RequestValue, WeftError> {
        match self {
            Value::Request(r) => Ok(r),
            other => Err(other.mismatch("request")),
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Value::Nil => 0,
            Value::Bool(_) => 1,
            Value::Integer(_) => 2,
            Value::Number(_) => 3,
            Value::Symbol(_) => 4,
            Value::Pair(_, _) => 5,
            Value::Array(_) => 6,
            Value::Vector(_) => 7,
            Value::Simplex(_) => 8,
            Value::Matrix(_) => 9,
            Value::Dict(_) => 10,
            Value::SpRef(_) => 11,
            Value::Node(_) => 12,
            Value::Request(_) => 13,
        }
    }
}

fn cmp_f64(a: f64, b: f64) -> Ordering {
    a.total_cmp(&b)
}

fn cmp_f64_slice(a: &[f64], b: &[f64]) -> Ordering {
    for (x, y) in a.iter().zip(b.iter()) {
        let ord = cmp_f64(*x, *y);
        if ord != Ordering::Equal {
            return ord;
        }
    }
    a.len().cmp(&b.len())
}

impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        let by_rank = self.rank().cmp(&other.rank());
        if by_rank != Ordering::Equal {
            return by_rank;
        }
        match (self, other) {
            (Value::Nil, Value::Nil) => Ordering::Equal,
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (Value::Integer(a), Value::Integer(b)) => a.cmp(b),
            (Value::Number(a), Value::Number(b)) => cmp_f64(*a, *b),
            (Value::Symbol(a), Value::Symbol(b)) => a.cmp(b),
            (Value::Pair(a1, a2), Value::Pair(b1, b2)) => {
                a1.cmp(b1).then_with(|| a2.cmp(b2))
            }
            (Value::Array(a), Value::Array(b)) => a.cmp(b),
            (Value::Vector(a), Value::Vector(b)) => cmp_f64_slice(a, b),
            (Value::Simplex(a), Value::Simplex(b)) => cmp_f64_slice(a, b),
            (Value::Matrix(a), Value::Matrix(b)) => a
                .rows
                .cmp(&b.rows)
                .then_with(|| a.cols.cmp(&b.cols))
                .then_with(|| cmp_f64_slice(&a.data, &b.data)),
            (Value::Dict(a), Value::Dict(b)) => a.cmp(b),
            (Value::SpRef(a), Value::SpRef(b)) => a.cmp(b),
            (Value::Node(a), Value::Node(b)) => a.cmp(b),
            (Value::Request(a), Value::Request(b)) => a.cmp(b),
            _ => unreachable!("rank comparison already decided"),
        }
    }
}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u8(self.rank());
        match self {
            Value::Nil => {}
            Value::Bool(b) => b.hash(state),
            Value::Integer(i) => i.hash(state),
            Value::Number(x) => state.write_u64(x.to_bits()),
            Value::Symbol(s) => s.hash(state),
            Value::Pair(car, cdr) => {
                car.hash(state);
                cdr.hash(state);
            }
            Value::Array(items) => {
                state.write_usize(items.len());
                for item in items {
                    item.hash(state);
                }
            }
            Value::Vector(items) | Value::Simplex(items) => {
                state.write_usize(items.len());
                for x in items {
                    state.write_u64(x.to_bits());
                }
            }
            Value::Matrix(m) => {
                state.write_usize(m.rows);
                state.write_usize(m.cols);
                for x in &m.data {
                    state.write_u64(x.to_bits());
                }
            }
            Value::Dict(d) => {
                state.write_usize(d.len());
                for (k, v) in d {
                    k.hash(state);
                    v.hash(state);
                }
            }
            Value::SpRef(node) => node.hash(state),
            Value::Node(node) => node.hash(state),
            Value::Request(r) => r.hash(state),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => write!(f, "()"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Integer(i) => write!(f, "{i}"),
            Value::Number(x) => write!(f, "{x}"),
            Value::Symbol(s) => write!(f, "{s}"),
            Value::Pair(car, cdr) => write!(f, "({car} . {cdr})"),
            Value::Array(items) => {
                write!(f, "[")?;
                for (idx, item) in items.iter().enumerate() {
                    if idx > 0 {
                        write!(f, " ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
            Value::Vector(items) => write!(f, "vector<{}>", items.len()),
            Value::Simplex(items) => write!(f, "simplex<{}>", items.len()),
            Value::Matrix(m) => write!(f, "matrix<{}x{}>", m.rows, m.cols),
            Value::Dict(d) => write!(f, "dict<{}>", d.len()),
            Value::SpRef(node) => write!(f, "sp@{}", node.as_raw()),
            Value::Node(node) => write!(f, "node@{}", node.as_raw()),
            Value::Request(r) => write!(f, "request<{} esrs>", r.esrs.len()),
        }
    }
}
