//! Interned names for dialects, operations, and attribute keys.

use std::borrow::Cow;
use std::fmt;
use std::sync::LazyLock;

use lasso::{Rodeo, Spur};
use parking_lot::RwLock;

/// Process-wide string table backing every [`Symbol`].
static INTERNER: LazyLock<RwLock<Rodeo>> = LazyLock::new(|| RwLock::new(Rodeo::default()));

/// Interned string with cheap copy, comparison, and hashing.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Symbol(Spur);

impl Symbol {
    /// Intern a static string. Prefer this over `from_dynamic` when possible.
    pub fn new(text: &'static str) -> Self {
        Self::lookup_or_insert(text, |rodeo| rodeo.get_or_intern_static(text))
    }

    /// Intern a string that is only known at runtime.
    pub fn from_dynamic(text: &str) -> Self {
        Self::lookup_or_insert(text, |rodeo| rodeo.get_or_intern(text))
    }

    fn lookup_or_insert(text: &str, insert: impl FnOnce(&mut Rodeo) -> Spur) -> Self {
        let mut lock = INTERNER.upgradable_read();
        match lock.get(text) {
            Some(spur) => Symbol(spur),
            None => Symbol(lock.with_upgraded(insert)),
        }
    }

    /// Borrow the symbol's text without allocating.
    ///
    /// Takes a recursive read lock, so `f` may itself format or compare symbols.
    pub fn with_str<R>(&self, f: impl FnOnce(&str) -> R) -> R {
        let interner = INTERNER.read_recursive();
        f(interner.resolve(&self.0))
    }
}

impl From<&'static str> for Symbol {
    fn from(text: &'static str) -> Self {
        Symbol::new(text)
    }
}

impl From<Cow<'_, str>> for Symbol {
    fn from(text: Cow<'_, str>) -> Self {
        Symbol::from_dynamic(&text)
    }
}

impl PartialEq<str> for Symbol {
    fn eq(&self, other: &str) -> bool {
        self.with_str(|s| s == other)
    }
}

impl PartialEq<&str> for Symbol {
    fn eq(&self, other: &&str) -> bool {
        self.with_str(|s| s == *other)
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.with_str(|s| f.write_str(s))
    }
}

impl fmt::Debug for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.with_str(|s| write!(f, "{s:?}"))
    }
}

/// Declare a batch of symbol accessor functions.
///
/// ```
/// trunk_ir::symbols! {
///     ATTR_TYPE => "type",
///     ATTR_CALLEE => "callee",
/// }
/// assert_eq!(ATTR_TYPE(), "type");
/// ```
#[macro_export]
macro_rules! symbols {
    ($($(#[$attr:meta])* $name:ident => $text:literal),* $(,)?) => {
        $(
            $(#[$attr])*
            #[allow(non_snake_case)]
            #[inline]
            pub fn $name() -> $crate::Symbol {
                $crate::Symbol::new($text)
            }
        )*
    };
}

/// Fully qualified operation name, printed as `dialect.name`.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OpName {
    pub dialect: Symbol,
    pub name: Symbol,
}

impl OpName {
    pub fn new(dialect: impl Into<Symbol>, name: impl Into<Symbol>) -> Self {
        Self {
            dialect: dialect.into(),
            name: name.into(),
        }
    }

    /// Build from strings that are not `'static`.
    pub fn from_dynamic(dialect: &str, name: &str) -> Self {
        Self {
            dialect: Symbol::from_dynamic(dialect),
            name: Symbol::from_dynamic(name),
        }
    }
}

impl fmt::Display for OpName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.dialect, self.name)
    }
}

impl fmt::Debug for OpName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OpName({self})")
    }
}
