//! An embedded stand-in for the foreign numeric runtime.
//!
//! A small expression interpreter with the same shape as an external
//! interpreter: a heap of reference-semantics cells (sequences and dicts
//! can be cyclic), a module library (`math`, `stats`, `vsa`), synthesized
//! tracebacks, and foreign-style exception type names. The heap is
//! conservative about reclamation: cells live until their last reference
//! is released or the runtime is dropped.

use super::{
    FResult, ForeignErrorRecord, ForeignHeap, ForeignRef, ForeignRepr, ForeignRuntime,
    ForeignValue, ProxyDispatch,
};
use crate::bridge::BridgeConfig;
use crate::vsa::{kernels, AnnIndex, IndexKind, DEFAULT_DIMENSION};
use ndarray::Array1;
use nom::branch::alt;
use nom::bytes::complete::take_while1;
use nom::character::complete::{char, multispace0, one_of};
use nom::combinator::{map, opt, verify};
use nom::multi::{many0, separated_list0};
use nom::number::complete::double;
use nom::sequence::{delimited, pair, preceded, separated_pair, terminated, tuple};
use nom::IResult;
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

fn raise(type_name: &str, message: impl Into<String>) -> ForeignErrorRecord {
    let message = message.into();
    ForeignErrorRecord::new("RuntimeError", message.clone(), type_name).with_traceback(vec![
        "File \"<eval>\", line 1, in <module>".to_string(),
        format!("{}: {}", type_name, message),
    ])
}

// ---------------------------------------------------------------------------
// Heap

#[derive(Debug)]
enum CellBody {
    Seq(Vec<ForeignValue>),
    Dict(Vec<(ForeignValue, ForeignValue)>),
    Proxy(String),
    Module(ModuleKind),
    Builtin(Builtin),
    Class(ClassKind),
    Accumulator(f64),
    Index(AnnIndex),
}

#[derive(Debug)]
struct Cell {
    rc: u32,
    body: CellBody,
}

#[derive(Debug, Default)]
pub(crate) struct Heap {
    cells: HashMap<u64, Cell>,
    next: u64,
}

impl Heap {
    fn alloc(&mut self, body: CellBody) -> ForeignRef {
        let id = self.next;
        self.next += 1;
        self.cells.insert(id, Cell { rc: 1, body });
        ForeignRef(id)
    }

    fn body(&self, r: ForeignRef) -> FResult<&CellBody> {
        self.cells
            .get(&r.0)
            .map(|cell| &cell.body)
            .ok_or_else(|| raise("ReferenceError", format!("dangling foreign reference {}", r)))
    }

    fn body_mut(&mut self, r: ForeignRef) -> FResult<&mut CellBody> {
        self.cells
            .get_mut(&r.0)
            .map(|cell| &mut cell.body)
            .ok_or_else(|| raise("ReferenceError", format!("dangling foreign reference {}", r)))
    }

    pub(crate) fn live_cells(&self) -> usize {
        self.cells.len()
    }
}

impl ForeignHeap for Heap {
    fn introspect(&self, r: ForeignRef) -> FResult<ForeignRepr> {
        Ok(match self.body(r)? {
            CellBody::Seq(items) => ForeignRepr::Seq(items.clone()),
            CellBody::Dict(entries) => ForeignRepr::Dict(entries.clone()),
            CellBody::Proxy(handle_id) => ForeignRepr::Proxy(handle_id.clone()),
            CellBody::Module(kind) => ForeignRepr::Module {
                name: kind.name().to_string(),
            },
            CellBody::Builtin(builtin) => ForeignRepr::Callable {
                name: builtin.name().to_string(),
            },
            CellBody::Class(class) => ForeignRepr::Callable {
                name: class.name().to_string(),
            },
            CellBody::Accumulator(_) => ForeignRepr::Opaque {
                type_name: "Accumulator".to_string(),
            },
            CellBody::Index(_) => ForeignRepr::Opaque {
                type_name: "AnnIndex".to_string(),
            },
        })
    }

    fn make_seq(&mut self, items: Vec<ForeignValue>) -> ForeignRef {
        self.alloc(CellBody::Seq(items))
    }

    fn make_dict(&mut self, entries: Vec<(String, ForeignValue)>) -> ForeignRef {
        let entries = entries
            .into_iter()
            .map(|(key, value)| (ForeignValue::Str(key), value))
            .collect();
        self.alloc(CellBody::Dict(entries))
    }

    fn make_proxy(&mut self, handle_id: &str) -> ForeignRef {
        self.alloc(CellBody::Proxy(handle_id.to_string()))
    }

    fn retain_ref(&mut self, r: ForeignRef) {
        if let Some(cell) = self.cells.get_mut(&r.0) {
            cell.rc += 1;
        }
    }

    fn release_ref(&mut self, r: ForeignRef) {
        let gone = match self.cells.get_mut(&r.0) {
            Some(cell) => {
                cell.rc = cell.rc.saturating_sub(1);
                cell.rc == 0
            }
            None => false,
        };
        if gone {
            self.cells.remove(&r.0);
        }
    }
}

// ---------------------------------------------------------------------------
// Library

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
enum ModuleKind {
    Math,
    Stats,
    Vsa,
}

impl ModuleKind {
    fn name(self) -> &'static str {
        match self {
            ModuleKind::Math => "math",
            ModuleKind::Stats => "stats",
            ModuleKind::Vsa => "vsa",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
enum ClassKind {
    Accumulator,
}

impl ClassKind {
    fn name(self) -> &'static str {
        match self {
            ClassKind::Accumulator => "Accumulator",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
enum Builtin {
    // globals
    List,
    Append,
    Len,
    Sleep,
    DictSet,
    GetSlot,
    SetSlot,
    Perform,
    CloneProxy,
    // math
    Sqrt,
    Abs,
    Floor,
    Ceil,
    Pow,
    // vsa
    Bind,
    Bundle,
    Unbind,
    Cosine,
    Generate,
    IndexCreate,
    IndexAdd,
    IndexSearch,
}

impl Builtin {
    fn name(self) -> &'static str {
        match self {
            Builtin::List => "list",
            Builtin::Append => "append",
            Builtin::Len => "len",
            Builtin::Sleep => "sleep",
            Builtin::DictSet => "dict_set",
            Builtin::GetSlot => "get_slot",
            Builtin::SetSlot => "set_slot",
            Builtin::Perform => "perform",
            Builtin::CloneProxy => "clone",
            Builtin::Sqrt => "sqrt",
            Builtin::Abs => "abs",
            Builtin::Floor => "floor",
            Builtin::Ceil => "ceil",
            Builtin::Pow => "pow",
            Builtin::Bind => "bind",
            Builtin::Bundle => "bundle",
            Builtin::Unbind => "unbind",
            Builtin::Cosine => "cosine",
            Builtin::Generate => "generate",
            Builtin::IndexCreate => "index_create",
            Builtin::IndexAdd => "index_add",
            Builtin::IndexSearch => "index_search",
        }
    }

    fn global(name: &str) -> Option<Builtin> {
        Some(match name {
            "list" => Builtin::List,
            "append" => Builtin::Append,
            "len" => Builtin::Len,
            "sleep" => Builtin::Sleep,
            "dict_set" => Builtin::DictSet,
            "get_slot" => Builtin::GetSlot,
            "set_slot" => Builtin::SetSlot,
            "perform" => Builtin::Perform,
            "clone" => Builtin::CloneProxy,
            _ => return None,
        })
    }
}

// ---------------------------------------------------------------------------
// Grammar

#[derive(Clone, Debug)]
enum Expr {
    Number(f64),
    Str(String),
    Bool(bool),
    Null,
    List(Vec<Expr>),
    Dict(Vec<(String, Expr)>),
    Name(String),
    Attr(Box<Expr>, String),
    Index(Box<Expr>, Box<Expr>),
    Call(Box<Expr>, Vec<Expr>),
    Neg(Box<Expr>),
    Binary(char, Box<Expr>, Box<Expr>),
}

#[derive(Clone, Debug)]
enum Stmt {
    Assign(String, Expr),
    Expr(Expr),
}

fn identifier(input: &str) -> IResult<&str, &str> {
    verify(
        take_while1(|c: char| c.is_ascii_alphanumeric() || c == '_'),
        |s: &str| !s.starts_with(|c: char| c.is_ascii_digit()),
    )(input)
}

fn string_literal(input: &str) -> IResult<&str, String> {
    let (mut rest, _) = char('"')(input)?;
    let mut out = String::new();
    let mut chars = rest.char_indices();
    loop {
        match chars.next() {
            Some((at, '"')) => {
                rest = &rest[at + 1..];
                return Ok((rest, out));
            }
            Some((_, '\\')) => match chars.next() {
                Some((_, 'n')) => out.push('\n'),
                Some((_, 't')) => out.push('\t'),
                Some((_, escaped)) => out.push(escaped),
                None => break,
            },
            Some((_, c)) => out.push(c),
            None => break,
        }
    }
    Err(nom::Err::Failure(nom::error::Error::new(
        input,
        nom::error::ErrorKind::Char,
    )))
}

fn atom(input: &str) -> IResult<&str, Expr> {
    preceded(
        multispace0,
        alt((
            map(string_literal, Expr::Str),
            list_literal,
            dict_literal,
            delimited(
                char('('),
                expr,
                preceded(multispace0, char(')')),
            ),
            map(identifier, |name| match name {
                "true" => Expr::Bool(true),
                "false" => Expr::Bool(false),
                "null" => Expr::Null,
                _ => Expr::Name(name.to_string()),
            }),
            map(double, Expr::Number),
        )),
    )(input)
}

fn list_literal(input: &str) -> IResult<&str, Expr> {
    map(
        delimited(
            char('['),
            separated_list0(preceded(multispace0, char(',')), expr),
            preceded(multispace0, char(']')),
        ),
        Expr::List,
    )(input)
}

fn dict_literal(input: &str) -> IResult<&str, Expr> {
    let entry = separated_pair(
        preceded(multispace0, string_literal),
        preceded(multispace0, char(':')),
        expr,
    );
    map(
        delimited(
            char('{'),
            separated_list0(preceded(multispace0, char(',')), entry),
            preceded(multispace0, char('}')),
        ),
        Expr::Dict,
    )(input)
}

enum Postfix {
    Call(Vec<Expr>),
    Attr(String),
    Index(Expr),
}

fn postfix(input: &str) -> IResult<&str, Expr> {
    let call = map(
        delimited(
            char('('),
            separated_list0(preceded(multispace0, char(',')), expr),
            preceded(multispace0, char(')')),
        ),
        Postfix::Call,
    );
    let attr = map(preceded(char('.'), identifier), |name: &str| {
        Postfix::Attr(name.to_string())
    });
    let index = map(
        delimited(char('['), expr, preceded(multispace0, char(']'))),
        Postfix::Index,
    );
    map(
        pair(atom, many0(preceded(multispace0, alt((call, attr, index))))),
        |(base, ops)| {
            ops.into_iter().fold(base, |acc, op| match op {
                Postfix::Call(args) => Expr::Call(Box::new(acc), args),
                Postfix::Attr(name) => Expr::Attr(Box::new(acc), name),
                Postfix::Index(idx) => Expr::Index(Box::new(acc), Box::new(idx)),
            })
        },
    )(input)
}

fn factor(input: &str) -> IResult<&str, Expr> {
    preceded(
        multispace0,
        alt((
            map(preceded(char('-'), factor), |inner| Expr::Neg(Box::new(inner))),
            postfix,
        )),
    )(input)
}

fn term(input: &str) -> IResult<&str, Expr> {
    map(
        pair(
            factor,
            many0(pair(preceded(multispace0, one_of("*/%")), factor)),
        ),
        |(first, rest)| {
            rest.into_iter().fold(first, |acc, (op, rhs)| {
                Expr::Binary(op, Box::new(acc), Box::new(rhs))
            })
        },
    )(input)
}

fn expr(input: &str) -> IResult<&str, Expr> {
    map(
        pair(
            term,
            many0(pair(preceded(multispace0, one_of("+-")), term)),
        ),
        |(first, rest)| {
            rest.into_iter().fold(first, |acc, (op, rhs)| {
                Expr::Binary(op, Box::new(acc), Box::new(rhs))
            })
        },
    )(input)
}

fn statement(input: &str) -> IResult<&str, Stmt> {
    let assign = map(
        tuple((
            preceded(multispace0, identifier),
            preceded(multispace0, char('=')),
            expr,
        )),
        |(name, _, value)| Stmt::Assign(name.to_string(), value),
    );
    alt((assign, map(expr, Stmt::Expr)))(input)
}

fn parse_program(code: &str) -> Result<Vec<Stmt>, (usize, String)> {
    let program = terminated(
        separated_list0(preceded(multispace0, char(';')), statement),
        tuple((multispace0, opt(char(';')), multispace0)),
    )(code);
    match program {
        Ok(("", statements)) if !statements.is_empty() => Ok(statements),
        Ok((rest, _)) => Err((
            code.len() - rest.len(),
            format!("unexpected input '{}'", rest.trim().chars().take(16).collect::<String>()),
        )),
        Err(nom::Err::Error(err)) | Err(nom::Err::Failure(err)) => Err((
            code.len() - err.input.len(),
            "malformed expression".to_string(),
        )),
        Err(nom::Err::Incomplete(_)) => Err((code.len(), "incomplete input".to_string())),
    }
}

// ---------------------------------------------------------------------------
// Runtime

/// The embedded interpreter. One instance per gate.
pub struct EmbeddedRuntime {
    heap: Heap,
    modules: HashMap<ModuleKind, ForeignRef>,
    builtins: HashMap<Builtin, ForeignRef>,
    classes: HashMap<ClassKind, ForeignRef>,
}

impl Default for EmbeddedRuntime {
    fn default() -> Self {
        EmbeddedRuntime::new()
    }
}

impl EmbeddedRuntime {
    pub fn new() -> EmbeddedRuntime {
        EmbeddedRuntime {
            heap: Heap::default(),
            modules: HashMap::new(),
            builtins: HashMap::new(),
            classes: HashMap::new(),
        }
    }

    /// Number of live heap cells; interned modules and builtins count too.
    pub fn live_cells(&self) -> usize {
        self.heap.live_cells()
    }

    fn builtin_ref(&mut self, builtin: Builtin) -> ForeignRef {
        if let Some(r) = self.builtins.get(&builtin) {
            return *r;
        }
        let r = self.heap.alloc(CellBody::Builtin(builtin));
        self.builtins.insert(builtin, r);
        r
    }

    fn class_ref(&mut self, class: ClassKind) -> ForeignRef {
        if let Some(r) = self.classes.get(&class) {
            return *r;
        }
        let r = self.heap.alloc(CellBody::Class(class));
        self.classes.insert(class, r);
        r
    }

    fn module_attr(&mut self, module: ModuleKind, name: &str) -> FResult<ForeignValue> {
        let value = match (module, name) {
            (ModuleKind::Math, "sqrt") => ForeignValue::Ref(self.builtin_ref(Builtin::Sqrt)),
            (ModuleKind::Math, "abs") => ForeignValue::Ref(self.builtin_ref(Builtin::Abs)),
            (ModuleKind::Math, "floor") => ForeignValue::Ref(self.builtin_ref(Builtin::Floor)),
            (ModuleKind::Math, "ceil") => ForeignValue::Ref(self.builtin_ref(Builtin::Ceil)),
            (ModuleKind::Math, "pow") => ForeignValue::Ref(self.builtin_ref(Builtin::Pow)),
            (ModuleKind::Math, "pi") => ForeignValue::Float(std::f64::consts::PI),
            (ModuleKind::Stats, "Accumulator") => {
                ForeignValue::Ref(self.class_ref(ClassKind::Accumulator))
            }
            (ModuleKind::Vsa, "bind") => ForeignValue::Ref(self.builtin_ref(Builtin::Bind)),
            (ModuleKind::Vsa, "bundle") => ForeignValue::Ref(self.builtin_ref(Builtin::Bundle)),
            (ModuleKind::Vsa, "unbind") => ForeignValue::Ref(self.builtin_ref(Builtin::Unbind)),
            (ModuleKind::Vsa, "cosine") => ForeignValue::Ref(self.builtin_ref(Builtin::Cosine)),
            (ModuleKind::Vsa, "generate") => {
                ForeignValue::Ref(self.builtin_ref(Builtin::Generate))
            }
            (ModuleKind::Vsa, "index_create") => {
                ForeignValue::Ref(self.builtin_ref(Builtin::IndexCreate))
            }
            (ModuleKind::Vsa, "index_add") => {
                ForeignValue::Ref(self.builtin_ref(Builtin::IndexAdd))
            }
            (ModuleKind::Vsa, "index_search") => {
                ForeignValue::Ref(self.builtin_ref(Builtin::IndexSearch))
            }
            (module, name) => {
                return Err(raise(
                    "AttributeError",
                    format!("module '{}' has no attribute '{}'", module.name(), name),
                ))
            }
        };
        Ok(value)
    }

    fn eval_statements(
        &mut self,
        statements: &[Stmt],
        env: &mut HashMap<String, ForeignValue>,
        proxies: &dyn ProxyDispatch,
    ) -> FResult<ForeignValue> {
        let mut last = ForeignValue::Null;
        for statement in statements {
            last = match statement {
                Stmt::Assign(name, value) => {
                    let value = self.eval_expr(value, env, proxies)?;
                    env.insert(name.clone(), value.clone());
                    value
                }
                Stmt::Expr(value) => self.eval_expr(value, env, proxies)?,
            };
        }
        Ok(last)
    }

    fn eval_expr(
        &mut self,
        expr: &Expr,
        env: &mut HashMap<String, ForeignValue>,
        proxies: &dyn ProxyDispatch,
    ) -> FResult<ForeignValue> {
        match expr {
            Expr::Number(n) => Ok(ForeignValue::Float(*n)),
            Expr::Str(s) => Ok(ForeignValue::Str(s.clone())),
            Expr::Bool(b) => Ok(ForeignValue::Bool(*b)),
            Expr::Null => Ok(ForeignValue::Null),
            Expr::List(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(self.eval_expr(item, env, proxies)?);
                }
                Ok(ForeignValue::Ref(self.heap.make_seq(out)))
            }
            Expr::Dict(entries) => {
                let mut out = Vec::with_capacity(entries.len());
                for (key, value) in entries {
                    out.push((key.clone(), self.eval_expr(value, env, proxies)?));
                }
                Ok(ForeignValue::Ref(self.heap.make_dict(out)))
            }
            Expr::Name(name) => {
                if let Some(value) = env.get(name) {
                    return Ok(value.clone());
                }
                if let Some(builtin) = Builtin::global(name) {
                    return Ok(ForeignValue::Ref(self.builtin_ref(builtin)));
                }
                Err(raise(
                    "NameError",
                    format!("name '{}' is not defined", name),
                ))
            }
            Expr::Attr(target, name) => {
                let target = self.eval_expr(target, env, proxies)?;
                match target {
                    ForeignValue::Ref(r) => match self.heap.body(r)? {
                        CellBody::Module(kind) => {
                            let kind = *kind;
                            self.module_attr(kind, name)
                        }
                        other => Err(raise(
                            "AttributeError",
                            format!("{} has no attribute '{}'", describe(other), name),
                        )),
                    },
                    other => Err(raise(
                        "AttributeError",
                        format!("{} has no attribute '{}'", type_name_of(&other), name),
                    )),
                }
            }
            Expr::Index(target, idx) => {
                let target = self.eval_expr(target, env, proxies)?;
                let idx = self.eval_expr(idx, env, proxies)?;
                self.index_value(target, idx)
            }
            Expr::Call(callee, args) => {
                let callee = self.eval_expr(callee, env, proxies)?;
                let mut evaluated = Vec::with_capacity(args.len());
                for arg in args {
                    evaluated.push(self.eval_expr(arg, env, proxies)?);
                }
                self.call_value(callee, &evaluated, &[], proxies)
            }
            Expr::Neg(inner) => {
                let inner = self.eval_expr(inner, env, proxies)?;
                match inner {
                    ForeignValue::Float(n) => Ok(ForeignValue::Float(-n)),
                    other => Err(raise(
                        "TypeError",
                        format!("bad operand type for unary -: '{}'", type_name_of(&other)),
                    )),
                }
            }
            Expr::Binary(op, lhs, rhs) => {
                let lhs = self.eval_expr(lhs, env, proxies)?;
                let rhs = self.eval_expr(rhs, env, proxies)?;
                binary_op(*op, lhs, rhs)
            }
        }
    }

    fn index_value(&self, target: ForeignValue, idx: ForeignValue) -> FResult<ForeignValue> {
        let r = match target {
            ForeignValue::Ref(r) => r,
            other => {
                return Err(raise(
                    "TypeError",
                    format!("'{}' is not subscriptable", type_name_of(&other)),
                ))
            }
        };
        match (self.heap.body(r)?, idx) {
            (CellBody::Seq(items), ForeignValue::Float(i)) => {
                let at = i as usize;
                items.get(at).cloned().ok_or_else(|| {
                    raise("IndexError", format!("index {} out of range", at))
                })
            }
            (CellBody::Dict(entries), key) => entries
                .iter()
                .find(|(k, _)| *k == key)
                .map(|(_, v)| v.clone())
                .ok_or_else(|| raise("KeyError", "key not found")),
            (body, _) => Err(raise(
                "TypeError",
                format!("'{}' is not subscriptable", describe(body)),
            )),
        }
    }

    fn call_value(
        &mut self,
        callee: ForeignValue,
        args: &[ForeignValue],
        kwargs: &[(String, ForeignValue)],
        proxies: &dyn ProxyDispatch,
    ) -> FResult<ForeignValue> {
        let r = match callee {
            ForeignValue::Ref(r) => r,
            other => {
                return Err(ForeignErrorRecord::new(
                    "NotCallable",
                    format!("'{}' object is not callable", type_name_of(&other)),
                    "TypeError",
                ))
            }
        };
        let target = match self.heap.body(r)? {
            CellBody::Builtin(builtin) => Ok(*builtin),
            CellBody::Class(class) => {
                let class = *class;
                let instance = self.instantiate_class(class, args)?;
                return Ok(ForeignValue::Ref(instance));
            }
            body => Err(ForeignErrorRecord::new(
                "NotCallable",
                format!("'{}' object is not callable", describe(body)),
                "TypeError",
            )),
        }?;
        self.call_builtin(target, args, kwargs, proxies)
    }

    fn instantiate_class(&mut self, class: ClassKind, args: &[ForeignValue]) -> FResult<ForeignRef> {
        match class {
            ClassKind::Accumulator => {
                let initial = match args.first() {
                    Some(value) => as_float(value)?,
                    None => 0.0,
                };
                Ok(self.heap.alloc(CellBody::Accumulator(initial)))
            }
        }
    }

    fn call_builtin(
        &mut self,
        builtin: Builtin,
        args: &[ForeignValue],
        _kwargs: &[(String, ForeignValue)],
        proxies: &dyn ProxyDispatch,
    ) -> FResult<ForeignValue> {
        match builtin {
            Builtin::List => Ok(ForeignValue::Ref(self.heap.make_seq(args.to_vec()))),
            Builtin::Append => {
                let r = as_ref(arg(args, 0, "append")?)?;
                let item = arg(args, 1, "append")?.clone();
                match self.heap.body_mut(r)? {
                    CellBody::Seq(items) => {
                        items.push(item);
                        Ok(ForeignValue::Null)
                    }
                    body => Err(raise(
                        "TypeError",
                        format!("cannot append to '{}'", describe(body)),
                    )),
                }
            }
            Builtin::Len => {
                let len = match arg(args, 0, "len")? {
                    ForeignValue::Str(s) => s.chars().count(),
                    ForeignValue::Ref(r) => match self.heap.body(*r)? {
                        CellBody::Seq(items) => items.len(),
                        CellBody::Dict(entries) => entries.len(),
                        body => {
                            return Err(raise(
                                "TypeError",
                                format!("'{}' has no length", describe(body)),
                            ))
                        }
                    },
                    other => {
                        return Err(raise(
                            "TypeError",
                            format!("'{}' has no length", type_name_of(other)),
                        ))
                    }
                };
                Ok(ForeignValue::Float(len as f64))
            }
            Builtin::Sleep => {
                let seconds = as_float(arg(args, 0, "sleep")?)?;
                if seconds < 0.0 {
                    return Err(raise("ValueError", "sleep length must be non-negative"));
                }
                std::thread::sleep(Duration::from_secs_f64(seconds));
                Ok(ForeignValue::Null)
            }
            Builtin::DictSet => {
                let r = as_ref(arg(args, 0, "dict_set")?)?;
                let key = arg(args, 1, "dict_set")?.clone();
                let value = arg(args, 2, "dict_set")?.clone();
                match self.heap.body_mut(r)? {
                    CellBody::Dict(entries) => {
                        match entries.iter_mut().find(|(k, _)| *k == key) {
                            Some(entry) => entry.1 = value,
                            None => entries.push((key, value)),
                        }
                        Ok(ForeignValue::Null)
                    }
                    body => Err(raise(
                        "TypeError",
                        format!("cannot set key on '{}'", describe(body)),
                    )),
                }
            }
            Builtin::GetSlot => {
                let handle_id = self.proxy_id(arg(args, 0, "get_slot")?)?;
                let name = as_str(arg(args, 1, "get_slot")?)?;
                proxies.get_slot(&handle_id, &name, &mut self.heap)
            }
            Builtin::SetSlot => {
                let handle_id = self.proxy_id(arg(args, 0, "set_slot")?)?;
                let name = as_str(arg(args, 1, "set_slot")?)?;
                let value = arg(args, 2, "set_slot")?.clone();
                proxies.set_slot(&handle_id, &name, value, &mut self.heap)?;
                Ok(ForeignValue::Null)
            }
            Builtin::Perform => {
                let handle_id = self.proxy_id(arg(args, 0, "perform")?)?;
                let message = as_str(arg(args, 1, "perform")?)?;
                proxies.perform(&handle_id, &message, &args[2..], &mut self.heap)
            }
            Builtin::CloneProxy => {
                let handle_id = self.proxy_id(arg(args, 0, "clone")?)?;
                proxies.clone_object(&handle_id, &mut self.heap)
            }
            Builtin::Sqrt => {
                let x = as_float(arg(args, 0, "sqrt")?)?;
                if x < 0.0 {
                    return Err(raise("ValueError", "math domain error"));
                }
                Ok(ForeignValue::Float(x.sqrt()))
            }
            Builtin::Abs => Ok(ForeignValue::Float(
                as_float(arg(args, 0, "abs")?)?.abs(),
            )),
            Builtin::Floor => Ok(ForeignValue::Float(
                as_float(arg(args, 0, "floor")?)?.floor(),
            )),
            Builtin::Ceil => Ok(ForeignValue::Float(
                as_float(arg(args, 0, "ceil")?)?.ceil(),
            )),
            Builtin::Pow => {
                let base = as_float(arg(args, 0, "pow")?)?;
                let exponent = as_float(arg(args, 1, "pow")?)?;
                Ok(ForeignValue::Float(base.powf(exponent)))
            }
            Builtin::Bind | Builtin::Bundle | Builtin::Unbind => {
                let a = self.vector_arg(arg(args, 0, builtin.name())?)?;
                let b = self.vector_arg(arg(args, 1, builtin.name())?)?;
                let out = match builtin {
                    Builtin::Bind => kernels::bind(&a, &b),
                    Builtin::Bundle => kernels::bundle(&a, &b),
                    _ => kernels::unbind(&a, &b),
                }
                .map_err(record_from_error)?;
                Ok(ForeignValue::Ref(self.vector_result(&out)))
            }
            Builtin::Cosine => {
                let a = self.vector_arg(arg(args, 0, "cosine")?)?;
                let b = self.vector_arg(arg(args, 1, "cosine")?)?;
                let out = kernels::cosine(&a, &b).map_err(record_from_error)?;
                Ok(ForeignValue::Float(out))
            }
            Builtin::Generate => {
                let dim = match args.first() {
                    Some(value) => as_float(value)? as usize,
                    None => DEFAULT_DIMENSION,
                };
                let seed = match args.get(1) {
                    Some(value) => Some(as_float(value)? as u64),
                    None => None,
                };
                let out = kernels::generate(dim, seed);
                Ok(ForeignValue::Ref(self.vector_result(&out)))
            }
            Builtin::IndexCreate => {
                let kind = as_str(arg(args, 0, "index_create")?)?;
                let kind = IndexKind::from_str(&kind).map_err(record_from_error)?;
                let dim = as_float(arg(args, 1, "index_create")?)? as usize;
                let capacity = match args.get(2) {
                    Some(value) => Some(as_float(value)? as usize),
                    None => None,
                };
                let index = AnnIndex::new(kind, dim, capacity).map_err(record_from_error)?;
                Ok(ForeignValue::Ref(self.heap.alloc(CellBody::Index(index))))
            }
            Builtin::IndexAdd => {
                let r = as_ref(arg(args, 0, "index_add")?)?;
                let vectors = self.vectors_arg(arg(args, 1, "index_add")?)?;
                let ids = match args.get(2) {
                    Some(value) => {
                        Some(self.vector_arg(value)?.to_vec())
                    }
                    None => None,
                };
                match self.heap.body_mut(r)? {
                    CellBody::Index(index) => {
                        index.add(vectors, ids).map_err(record_from_error)?;
                        Ok(ForeignValue::Null)
                    }
                    body => Err(raise(
                        "TypeError",
                        format!("'{}' is not an index", describe(body)),
                    )),
                }
            }
            Builtin::IndexSearch => {
                let r = as_ref(arg(args, 0, "index_search")?)?;
                let query = self.vector_arg(arg(args, 1, "index_search")?)?;
                let k = as_float(arg(args, 2, "index_search")?)? as usize;
                let hits = match self.heap.body(r)? {
                    CellBody::Index(index) => {
                        index.search(&query, k).map_err(record_from_error)?
                    }
                    body => {
                        return Err(raise(
                            "TypeError",
                            format!("'{}' is not an index", describe(body)),
                        ))
                    }
                };
                let mut out = Vec::with_capacity(hits.len());
                for hit in hits {
                    let entry = self.heap.make_dict(vec![
                        ("id".to_string(), ForeignValue::Float(hit.id)),
                        ("score".to_string(), ForeignValue::Float(hit.score)),
                    ]);
                    out.push(ForeignValue::Ref(entry));
                }
                Ok(ForeignValue::Ref(self.heap.make_seq(out)))
            }
        }
    }

    fn proxy_id(&self, value: &ForeignValue) -> FResult<String> {
        let r = as_ref(value)?;
        match self.heap.body(r)? {
            CellBody::Proxy(handle_id) => Ok(handle_id.clone()),
            body => Err(raise(
                "TypeError",
                format!("expected a kernel proxy, got '{}'", describe(body)),
            )),
        }
    }

    fn vector_arg(&self, value: &ForeignValue) -> FResult<Array1<f64>> {
        let r = as_ref(value)?;
        match self.heap.body(r)? {
            CellBody::Seq(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(as_float(item)?);
                }
                Ok(Array1::from_vec(out))
            }
            body => Err(raise(
                "TypeError",
                format!("expected a numeric sequence, got '{}'", describe(body)),
            )),
        }
    }

    fn vectors_arg(&self, value: &ForeignValue) -> FResult<Vec<Array1<f64>>> {
        let r = as_ref(value)?;
        let items = match self.heap.body(r)? {
            CellBody::Seq(items) => items.clone(),
            body => {
                return Err(raise(
                    "TypeError",
                    format!("expected a sequence of vectors, got '{}'", describe(body)),
                ))
            }
        };
        items.iter().map(|item| self.vector_arg(item)).collect()
    }

    fn vector_result(&mut self, values: &Array1<f64>) -> ForeignRef {
        self.heap
            .make_seq(values.iter().map(|n| ForeignValue::Float(*n)).collect())
    }
}

fn arg<'a>(args: &'a [ForeignValue], at: usize, name: &str) -> FResult<&'a ForeignValue> {
    args.get(at).ok_or_else(|| {
        raise(
            "TypeError",
            format!("{}() missing required argument {}", name, at + 1),
        )
    })
}

fn as_float(value: &ForeignValue) -> FResult<f64> {
    match value {
        ForeignValue::Float(n) => Ok(*n),
        other => Err(raise(
            "TypeError",
            format!("expected a number, got '{}'", type_name_of(other)),
        )),
    }
}

fn as_str(value: &ForeignValue) -> FResult<String> {
    match value {
        ForeignValue::Str(s) => Ok(s.clone()),
        other => Err(raise(
            "TypeError",
            format!("expected a string, got '{}'", type_name_of(other)),
        )),
    }
}

fn as_ref(value: &ForeignValue) -> FResult<ForeignRef> {
    match value {
        ForeignValue::Ref(r) => Ok(*r),
        other => Err(raise(
            "TypeError",
            format!("expected an object, got '{}'", type_name_of(other)),
        )),
    }
}

fn type_name_of(value: &ForeignValue) -> &'static str {
    match value {
        ForeignValue::Null => "NoneType",
        ForeignValue::Bool(_) => "bool",
        ForeignValue::Float(_) => "float",
        ForeignValue::Str(_) => "str",
        ForeignValue::Ref(_) => "object",
    }
}

fn describe(body: &CellBody) -> &'static str {
    match body {
        CellBody::Seq(_) => "list",
        CellBody::Dict(_) => "dict",
        CellBody::Proxy(_) => "proxy",
        CellBody::Module(_) => "module",
        CellBody::Builtin(_) => "builtin",
        CellBody::Class(_) => "type",
        CellBody::Accumulator(_) => "Accumulator",
        CellBody::Index(_) => "AnnIndex",
    }
}

fn binary_op(op: char, lhs: ForeignValue, rhs: ForeignValue) -> FResult<ForeignValue> {
    match (op, lhs, rhs) {
        ('+', ForeignValue::Str(a), ForeignValue::Str(b)) => Ok(ForeignValue::Str(a + &b)),
        (op, ForeignValue::Float(a), ForeignValue::Float(b)) => {
            let out = match op {
                '+' => a + b,
                '-' => a - b,
                '*' => a * b,
                '/' => {
                    if b == 0.0 {
                        return Err(raise("ZeroDivisionError", "division by zero"));
                    }
                    a / b
                }
                '%' => {
                    if b == 0.0 {
                        return Err(raise("ZeroDivisionError", "modulo by zero"));
                    }
                    a % b
                }
                _ => return Err(raise("TypeError", format!("unknown operator '{}'", op))),
            };
            Ok(ForeignValue::Float(out))
        }
        (op, lhs, rhs) => Err(raise(
            "TypeError",
            format!(
                "unsupported operand types for {}: '{}' and '{}'",
                op,
                type_name_of(&lhs),
                type_name_of(&rhs)
            ),
        )),
    }
}

fn record_from_error(err: crate::error::Error) -> ForeignErrorRecord {
    let type_name = match &err {
        crate::error::Error::ShapeMismatch(_) => "ValueError",
        _ => "RuntimeError",
    };
    ForeignErrorRecord::new(err.kind(), err.to_string(), type_name).with_traceback(vec![
        "File \"<eval>\", line 1, in <module>".to_string(),
        format!("{}: {}", type_name, err),
    ])
}

impl ForeignRuntime for EmbeddedRuntime {
    fn initialize(&mut self, config: &BridgeConfig) -> FResult<()> {
        if let Some(path) = &config.runtime_path {
            if !path.exists() {
                return Err(ForeignErrorRecord::new(
                    "RuntimeInitFailed",
                    format!("runtime path '{}' does not exist", path.display()),
                    "RuntimeError",
                ));
            }
        }
        Ok(())
    }

    fn eval(
        &mut self,
        code: &str,
        bindings: &[(String, ForeignValue)],
        proxies: &dyn ProxyDispatch,
    ) -> FResult<ForeignValue> {
        let statements = parse_program(code).map_err(|(position, message)| {
            ForeignErrorRecord::new("SyntaxError", message, "SyntaxError").with_position(position)
        })?;
        let mut env: HashMap<String, ForeignValue> = bindings.iter().cloned().collect();
        self.eval_statements(&statements, &mut env, proxies)
    }

    fn load_module(&mut self, name: &str) -> FResult<ForeignRef> {
        let kind = match name {
            "math" => ModuleKind::Math,
            "stats" => ModuleKind::Stats,
            "vsa" => ModuleKind::Vsa,
            other => {
                return Err(ForeignErrorRecord::new(
                    "ModuleNotFound",
                    other,
                    "ImportError",
                ))
            }
        };
        if let Some(r) = self.modules.get(&kind) {
            return Ok(*r);
        }
        let r = self.heap.alloc(CellBody::Module(kind));
        self.modules.insert(kind, r);
        Ok(r)
    }

    fn get_attr(&mut self, target: ForeignRef, name: &str) -> FResult<ForeignValue> {
        match self.heap.body(target)? {
            CellBody::Module(kind) => {
                let kind = *kind;
                self.module_attr(kind, name)
            }
            body => Err(raise(
                "AttributeError",
                format!("'{}' has no attribute '{}'", describe(body), name),
            )),
        }
    }

    fn call(
        &mut self,
        callable: ForeignRef,
        args: &[ForeignValue],
        kwargs: &[(String, ForeignValue)],
        proxies: &dyn ProxyDispatch,
    ) -> FResult<ForeignValue> {
        self.call_value(ForeignValue::Ref(callable), args, kwargs, proxies)
    }

    fn instantiate(
        &mut self,
        class: ForeignRef,
        args: &[ForeignValue],
        _kwargs: &[(String, ForeignValue)],
        _proxies: &dyn ProxyDispatch,
    ) -> FResult<ForeignRef> {
        match self.heap.body(class)? {
            CellBody::Class(kind) => {
                let kind = *kind;
                self.instantiate_class(kind, args)
            }
            body => Err(ForeignErrorRecord::new(
                "NotCallable",
                format!("'{}' is not a class", describe(body)),
                "TypeError",
            )),
        }
    }

    fn call_method(
        &mut self,
        target: ForeignRef,
        name: &str,
        args: &[ForeignValue],
        kwargs: &[(String, ForeignValue)],
        proxies: &dyn ProxyDispatch,
    ) -> FResult<ForeignValue> {
        enum Target {
            Module(ModuleKind),
            Accumulator,
            Proxy(String),
            Seq,
            Other(&'static str),
        }
        let kind = match self.heap.body(target)? {
            CellBody::Module(kind) => Target::Module(*kind),
            CellBody::Accumulator(_) => Target::Accumulator,
            CellBody::Proxy(handle_id) => Target::Proxy(handle_id.clone()),
            CellBody::Seq(_) => Target::Seq,
            body => Target::Other(describe(body)),
        };
        match kind {
            Target::Module(module) => {
                let attr = self.module_attr(module, name)?;
                self.call_value(attr, args, kwargs, proxies)
            }
            Target::Accumulator => match name {
                "add" => {
                    let amount = as_float(arg(args, 0, "add")?)?;
                    match self.heap.body_mut(target)? {
                        CellBody::Accumulator(total) => {
                            *total += amount;
                            Ok(ForeignValue::Float(*total))
                        }
                        _ => unreachable!("target kind checked above"),
                    }
                }
                "total" => match self.heap.body(target)? {
                    CellBody::Accumulator(total) => Ok(ForeignValue::Float(*total)),
                    _ => unreachable!("target kind checked above"),
                },
                other => Err(raise(
                    "AttributeError",
                    format!("'Accumulator' object has no attribute '{}'", other),
                )),
            },
            Target::Proxy(handle_id) => proxies.perform(&handle_id, name, args, &mut self.heap),
            Target::Seq => match name {
                "append" => self.call_builtin(
                    Builtin::Append,
                    &{
                        let mut with_receiver = vec![ForeignValue::Ref(target)];
                        with_receiver.extend_from_slice(args);
                        with_receiver
                    },
                    kwargs,
                    proxies,
                ),
                other => Err(raise(
                    "AttributeError",
                    format!("'list' object has no attribute '{}'", other),
                )),
            },
            Target::Other(type_name) => Err(raise(
                "AttributeError",
                format!("'{}' object has no method '{}'", type_name, name),
            )),
        }
    }

    fn as_heap(&mut self) -> &mut dyn ForeignHeap {
        &mut self.heap
    }
}
