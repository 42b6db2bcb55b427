//! Declarations and value declarations.

use crate::expr::Body;
use crate::ids::{DeclId, FileId, VarId};
use crate::types::Type;

/// Where a declaration is attached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeclParent {
    File(FileId),
    /// A class (member) or a function (local declaration).
    Decl(DeclId),
}

/// Who produced a declaration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Origin {
    Source,
    /// Body of a function literal.
    Lambda,
    /// Synthetic invoke function of an adapted function reference.
    AdaptedReference,
    /// Continuation-taking replacement of a suspend function.
    LoweredSuspendFunction,
    ContinuationClass,
    StateMachineMethod,
    ContinuationField,
    /// Field or parameter introduced to carry a captured value.
    CapturedValue,
}

/// A named declaration and the parent that lists it.
#[derive(Debug, Clone)]
pub struct Declaration {
    /// Simple name; qualified names are built from the parent chain.
    pub name: String,
    /// The file or declaration whose member list holds this one.
    pub parent: DeclParent,
    /// Which pass created the declaration, if any.
    pub origin: Origin,
    /// Kind specific payload.
    pub kind: DeclKind,
}

/// What a declaration declares.
#[derive(Debug, Clone)]
pub enum DeclKind {
    Function(FunctionDecl),
    Class(ClassDecl),
    Field(FieldDecl),
    LocalDelegatedProperty(DelegatedPropertyDecl),
}

impl Declaration {
    pub fn as_function(&self) -> Option<&FunctionDecl> {
        match &self.kind {
            DeclKind::Function(f) => Some(f),
            _ => None,
        }
    }

    pub fn as_function_mut(&mut self) -> Option<&mut FunctionDecl> {
        match &mut self.kind {
            DeclKind::Function(f) => Some(f),
            _ => None,
        }
    }

    pub fn as_class(&self) -> Option<&ClassDecl> {
        match &self.kind {
            DeclKind::Class(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_class_mut(&mut self) -> Option<&mut ClassDecl> {
        match &mut self.kind {
            DeclKind::Class(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_field(&self) -> Option<&FieldDecl> {
        match &self.kind {
            DeclKind::Field(f) => Some(f),
            _ => None,
        }
    }

    pub fn is_lambda(&self) -> bool {
        matches!(self.origin, Origin::Lambda | Origin::AdaptedReference)
    }

    pub fn kind_name(&self) -> &'static str {
        match self.kind {
            DeclKind::Function(_) => "fun",
            DeclKind::Class(_) => "class",
            DeclKind::Field(_) => "field",
            DeclKind::LocalDelegatedProperty(_) => "val by",
        }
    }
}

/// A type parameter of a function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeParam {
    pub name: String,
    /// Reified parameters keep inline functions from being compiled on their own.
    pub reified: bool,
}

/// A function, lambda body or method.
#[derive(Debug, Clone)]
pub struct FunctionDecl {
    /// Value parameters in declaration order.
    pub params: Vec<VarId>,
    /// Receiver of member functions.
    pub dispatch_receiver: Option<VarId>,
    pub type_params: Vec<TypeParam>,
    /// Declared return type.
    pub return_type: Type,
    /// Whether the function is a suspend function.
    pub is_suspend: bool,
    /// Whether calls to the function are inlined.
    pub is_inline: bool,
    /// `None` for external declarations.
    pub body: Option<Body>,
    /// Functions this one overrides.
    pub overridden: Vec<DeclId>,
}

impl FunctionDecl {
    /// A non-suspend, non-inline function without a body.
    pub fn new(return_type: Type) -> Self {
        Self {
            params: Vec::new(),
            dispatch_receiver: None,
            type_params: Vec::new(),
            return_type,
            is_suspend: false,
            is_inline: false,
            body: None,
            overridden: Vec::new(),
        }
    }

    pub fn suspend(mut self) -> Self {
        self.is_suspend = true;
        self
    }

    pub fn inline(mut self) -> Self {
        self.is_inline = true;
        self
    }

    pub fn with_type_param(mut self, name: &str, reified: bool) -> Self {
        self.type_params.push(TypeParam {
            name: name.to_string(),
            reified,
        });
        self
    }

    pub fn has_reified_type_params(&self) -> bool {
        self.type_params.iter().any(|p| p.reified)
    }

    /// Parameters in call-argument order (dispatch receiver first).
    pub fn value_params(&self) -> impl Iterator<Item = VarId> + '_ {
        self.dispatch_receiver.iter().copied().chain(self.params.iter().copied())
    }
}

/// A class, including generated continuation classes.
#[derive(Debug, Clone)]
pub struct ClassDecl {
    /// Member declarations in source order.
    pub members: Vec<DeclId>,
    /// Fields initialized from constructor arguments, in argument order.
    pub constructor_fields: Vec<DeclId>,
    /// Receiver used by member bodies to refer to the instance.
    pub this_receiver: VarId,
    /// Supertype, if the class extends one.
    pub super_class: Option<Type>,
}

/// A field of a class.
#[derive(Debug, Clone)]
pub struct FieldDecl {
    /// Type of the stored value.
    pub ty: Type,
    /// Whether the field can be assigned after construction.
    pub mutable: bool,
}

/// A local `val x by delegate` property.
#[derive(Debug, Clone)]
pub struct DelegatedPropertyDecl {
    /// Type of the property.
    pub ty: Type,
    /// Local holding the delegate object.
    pub delegate: VarId,
    /// Accessor function that reads through the delegate.
    pub getter: DeclId,
}

/// How a function-typed parameter of an inline function is passed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InlineMode {
    Inline,
    NoInline,
    CrossInline,
}

/// Per-parameter flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParamInfo {
    /// Inlining mode of the argument.
    pub inline_mode: InlineMode,
    /// The trailing continuation parameter of a lowered suspend function.
    pub is_continuation: bool,
}

impl Default for ParamInfo {
    fn default() -> Self {
        Self {
            inline_mode: InlineMode::Inline,
            is_continuation: false,
        }
    }
}

/// Role of a value declaration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Param(ParamInfo),
    Local,
    Receiver,
    CatchParam,
}

/// A parameter, local, receiver or catch parameter.
#[derive(Debug, Clone)]
pub struct ValueDecl {
    /// Name as written; not unique.
    pub name: String,
    /// Declared type.
    pub ty: Type,
    /// Whether the value can be reassigned.
    pub mutable: bool,
    /// Role of the value.
    pub kind: ValueKind,
}

impl ValueDecl {
    pub fn local(name: &str, ty: Type, mutable: bool) -> Self {
        Self {
            name: name.to_string(),
            ty,
            mutable,
            kind: ValueKind::Local,
        }
    }

    pub fn param(name: &str, ty: Type) -> Self {
        Self {
            name: name.to_string(),
            ty,
            mutable: false,
            kind: ValueKind::Param(ParamInfo::default()),
        }
    }

    pub fn is_param(&self) -> bool {
        matches!(self.kind, ValueKind::Param(_))
    }

    pub fn param_info(&self) -> Option<ParamInfo> {
        match self.kind {
            ValueKind::Param(info) => Some(info),
            _ => None,
        }
    }

    /// A function-typed parameter whose argument is inlined at call sites.
    pub fn is_inline_param(&self) -> bool {
        match self.kind {
            ValueKind::Param(info) => {
                self.ty.is_function() && info.inline_mode != InlineMode::NoInline
            }
            _ => false,
        }
    }

    pub fn is_crossinline(&self) -> bool {
        matches!(
            self.kind,
            ValueKind::Param(ParamInfo {
                inline_mode: InlineMode::CrossInline,
                ..
            })
        )
    }
}
