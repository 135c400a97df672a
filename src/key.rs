//! Cache key derivation from an operation and its effective arguments.
//!
//! A key looks like `prefix:app::users::get_user(user_id=42,verbose=false)`.
//! Arguments whose declared type is excluded contribute nothing, not even
//! their name. Values are rendered through their natural string form
//! without escaping, so a value containing `,` can make two different
//! argument sets render the same key.

use std::{borrow::Cow, collections::HashSet, fmt};

use crate::{error::BindingError, Value};

/// Separator between rendered `name=value` pairs.
pub const ARG_SEPARATOR: &str = ",";
/// Separator between the namespace prefix and the rest of the key.
pub const PREFIX_DELIMITER: &str = ":";

/// The declared type of an operation parameter.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ArgType(Cow<'static, str>);

impl ArgType {
    /// The inbound request carrier. Always excluded from keys.
    pub const REQUEST: ArgType = ArgType::named("Request");
    /// The outbound response carrier. Always excluded from keys.
    pub const RESPONSE: ArgType = ArgType::named("Response");

    /// A type known by a static name.
    pub const fn named(name: &'static str) -> Self {
        Self(Cow::Borrowed(name))
    }

    /// A type known by a runtime name.
    pub fn new(name: impl Into<Cow<'static, str>>) -> Self {
        Self(name.into())
    }

    /// The type name.
    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ArgType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One formal parameter of an [`Operation`].
#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    /// Parameter name
    pub name: String,
    /// Declared type
    pub ty: ArgType,
    /// Value used when the call does not supply one
    pub default: Option<Value>,
}

/// The identity and signature of a cached endpoint handler.
///
/// ```
/// use redis_response_cache::{ArgType, Operation};
///
/// let op = Operation::new("app::users::get_user")
///     .param("request", ArgType::REQUEST)
///     .param("user_id", ArgType::named("i64"))
///     .param_with_default("verbose", ArgType::named("bool"), false);
/// assert_eq!(op.params().len(), 3);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Operation {
    name: String,
    params: Vec<Param>,
}

impl Operation {
    /// Creates an operation with no parameters. `name` should be the fully
    /// qualified path of the handler, e.g. `module::function`.
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), params: Vec::new() }
    }

    /// Declares a required parameter.
    pub fn param(mut self, name: impl Into<String>, ty: ArgType) -> Self {
        self.params.push(Param { name: name.into(), ty, default: None });
        self
    }

    /// Declares a parameter with a default value.
    pub fn param_with_default(
        mut self,
        name: impl Into<String>,
        ty: ArgType,
        default: impl Into<Value>,
    ) -> Self {
        self.params.push(Param {
            name: name.into(),
            ty,
            default: Some(default.into()),
        });
        self
    }

    /// The operation's fully-qualified name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declared parameters, in declaration order.
    pub fn params(&self) -> &[Param] {
        &self.params
    }

    /// Binds call arguments to the declared parameters and fills defaults.
    pub fn bind(
        &self,
        args: Arguments,
    ) -> Result<BoundArguments<'_>, BindingError> {
        let Arguments { positional, named } = args;
        if positional.len() > self.params.len() {
            return Err(BindingError::TooManyPositional {
                operation: self.name.clone(),
                expected: self.params.len(),
                given: positional.len(),
            });
        }

        let mut slots: Vec<Option<Value>> =
            positional.into_iter().map(Some).collect();
        slots.resize(self.params.len(), None);

        for (name, value) in named {
            let index = self
                .params
                .iter()
                .position(|p| p.name == name)
                .ok_or_else(|| BindingError::UnknownArgument {
                    operation: self.name.clone(),
                    name: name.clone(),
                })?;
            if slots[index].is_some() {
                return Err(BindingError::DuplicateArgument {
                    operation: self.name.clone(),
                    name,
                });
            }
            slots[index] = Some(value);
        }

        let values = self
            .params
            .iter()
            .zip(slots)
            .map(|(param, slot)| {
                slot.or_else(|| param.default.clone())
                    .map(|value| (param, value))
                    .ok_or_else(|| BindingError::MissingArgument {
                        operation: self.name.clone(),
                        name: param.name.clone(),
                    })
            })
            .collect::<Result<_, _>>()?;

        Ok(BoundArguments { values })
    }
}

/// The values supplied for one call, before binding.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Arguments {
    positional: Vec<Value>,
    named: Vec<(String, Value)>,
}

impl Arguments {
    /// An empty argument list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a positional value.
    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.positional.push(value.into());
        self
    }

    /// Adds a value by parameter name.
    pub fn named(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.named.push((name.into(), value.into()));
        self
    }

    /// Whether no value was supplied at all.
    pub fn is_empty(&self) -> bool {
        self.positional.is_empty() && self.named.is_empty()
    }
}

/// Every parameter of an operation paired with its value for one call.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundArguments<'a> {
    values: Vec<(&'a Param, Value)>,
}

impl BoundArguments<'_> {
    /// Iterates `(parameter, value)` pairs in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = (&Param, &Value)> {
        self.values.iter().map(|(param, value)| (*param, value))
    }

    /// The bound value of a parameter.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.iter().find(|(p, _)| p.name == name).map(|(_, v)| v)
    }
}

/// Argument types that never contribute to a key.
///
/// Always contains [`ArgType::REQUEST`] and [`ArgType::RESPONSE`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExcludedTypes(HashSet<ArgType>);

impl ExcludedTypes {
    /// The built-in carriers plus any additional types.
    pub fn new(extra: impl IntoIterator<Item = ArgType>) -> Self {
        let mut set: HashSet<ArgType> = extra.into_iter().collect();
        set.insert(ArgType::REQUEST);
        set.insert(ArgType::RESPONSE);
        Self(set)
    }

    /// Whether arguments of `ty` are left out of keys.
    pub fn contains(&self, ty: &ArgType) -> bool {
        self.0.contains(ty)
    }
}

impl Default for ExcludedTypes {
    fn default() -> Self {
        Self::new([])
    }
}

/// Renders the key for already bound arguments.
pub fn build_key(
    prefix: Option<&str>,
    operation: &Operation,
    excluded: &ExcludedTypes,
    args: &BoundArguments<'_>,
) -> String {
    let args_str = args
        .iter()
        .filter(|(param, _)| !excluded.contains(&param.ty))
        .map(|(param, value)| format!("{}={}", param.name, value))
        .collect::<Vec<_>>()
        .join(ARG_SEPARATOR);
    let prefix = prefix
        .filter(|p| !p.is_empty())
        .map(|p| format!("{p}{PREFIX_DELIMITER}"))
        .unwrap_or_default();
    format!("{prefix}{}({args_str})", operation.name())
}

/// Binds and renders keys with a fixed prefix and exclusion set.
#[derive(Debug, Clone, Default)]
pub struct KeyBuilder {
    prefix: Option<String>,
    excluded: ExcludedTypes,
}

impl KeyBuilder {
    /// Creates a builder. The exclusion set is fixed from here on.
    pub fn new(prefix: Option<String>, excluded: ExcludedTypes) -> Self {
        Self { prefix, excluded }
    }

    /// The exclusion set in use.
    pub fn excluded(&self) -> &ExcludedTypes {
        &self.excluded
    }

    /// Binds `args` against `operation` and renders the key.
    pub fn build(
        &self,
        operation: &Operation,
        args: Arguments,
    ) -> Result<String, BindingError> {
        let bound = operation.bind(args)?;
        Ok(build_key(self.prefix.as_deref(), operation, &self.excluded, &bound))
    }
}
