//! Types.
//!
//! A deliberately small type language: enough to decide suspend-ness of
//! callees, nullability of lowered return types and the unboxing/unit
//! conversions a delegated call needs.

use crate::ids::DeclId;
use std::fmt;

/// A type as seen by the lowering passes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Type {
    Unit,
    Bool,
    Int,
    String,
    Any,
    /// Type of expressions that never complete normally.
    Nothing,
    Throwable,
    /// Instance of a class declaration.
    Class(DeclId),
    /// Function type; `suspend` marks suspend function types.
    Function {
        params: Vec<Type>,
        ret: Box<Type>,
        suspend: bool,
    },
    /// `Continuation<T>`.
    Continuation(Box<Type>),
    Nullable(Box<Type>),
    /// Type parameter reference.
    Param(String),
}

impl Type {
    pub fn function(params: Vec<Type>, ret: Type) -> Self {
        Type::Function {
            params,
            ret: Box::new(ret),
            suspend: false,
        }
    }

    pub fn suspend_function(params: Vec<Type>, ret: Type) -> Self {
        Type::Function {
            params,
            ret: Box::new(ret),
            suspend: true,
        }
    }

    pub fn continuation(of: Type) -> Self {
        Type::Continuation(Box::new(of))
    }

    /// Make this type nullable (idempotent).
    pub fn nullable(self) -> Self {
        match self {
            Type::Nullable(_) => self,
            other => Type::Nullable(Box::new(other)),
        }
    }

    pub fn nullable_any() -> Self {
        Type::Any.nullable()
    }

    pub fn is_unit(&self) -> bool {
        matches!(self, Type::Unit)
    }

    pub fn is_nothing(&self) -> bool {
        matches!(self, Type::Nothing)
    }

    pub fn is_nullable(&self) -> bool {
        matches!(self, Type::Nullable(_))
    }

    pub fn is_function(&self) -> bool {
        matches!(self, Type::Function { .. })
    }

    pub fn is_suspend_function(&self) -> bool {
        matches!(self, Type::Function { suspend: true, .. })
    }

    /// Value types that are unboxed when they travel through `Any`.
    pub fn is_primitive(&self) -> bool {
        matches!(self, Type::Bool | Type::Int)
    }

    /// Return type of a function type.
    pub fn return_type(&self) -> Option<&Type> {
        match self {
            Type::Function { ret, .. } => Some(ret),
            _ => None,
        }
    }

    /// The type a suspend function returns once it takes a continuation:
    /// either its value or the suspended sentinel.
    pub fn lowered_suspend_return(&self) -> Type {
        if self.is_nullable() {
            Type::nullable_any()
        } else {
            Type::Any
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Unit => write!(f, "Unit"),
            Type::Bool => write!(f, "Boolean"),
            Type::Int => write!(f, "Int"),
            Type::String => write!(f, "String"),
            Type::Any => write!(f, "Any"),
            Type::Nothing => write!(f, "Nothing"),
            Type::Throwable => write!(f, "Throwable"),
            Type::Class(id) => write!(f, "{}", id),
            Type::Function {
                params,
                ret,
                suspend,
            } => {
                if *suspend {
                    write!(f, "suspend ")?;
                }
                write!(f, "(")?;
                for (i, p) in params.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", p)?;
                }
                write!(f, ") -> {}", ret)
            }
            Type::Continuation(inner) => write!(f, "Continuation<{}>", inner),
            Type::Nullable(inner) => write!(f, "{}?", inner),
            Type::Param(name) => write!(f, "{}", name),
        }
    }
}
