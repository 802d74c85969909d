//! Namespace name decomposition.
//!
//! A name is a dot-separated sequence of segments; `""` is the root
//! namespace. Every name has a *prefix chain*: the successive truncations of
//! the name down to the root, each paired with the remaining suffix, ordered
//! most-specific first.
//!
//! ```
//! use butler_bus::router::prefix_chain;
//!
//! assert_eq!(
//!     prefix_chain("foo.bar.baz"),
//!     vec![
//!         ("foo.bar.baz", ""),
//!         ("foo.bar", "baz"),
//!         ("foo", "bar.baz"),
//!         ("", "foo.bar.baz"),
//!     ]
//! );
//! ```

/// Separator between name segments.
pub const SEPARATOR: char = '.';

/// Decompose `name` into `(prefix, suffix)` pairs, most-specific first.
///
/// The chain always ends with the root prefix `""`. The root name itself
/// yields the single pair `("", "")`.
pub fn prefix_chain(name: &str) -> Vec<(&str, &str)> {
    if name.is_empty() {
        return vec![("", "")];
    }

    let mut chain = Vec::with_capacity(name.matches(SEPARATOR).count() + 2);
    chain.push((name, ""));

    for (i, _) in name.rmatch_indices(SEPARATOR) {
        chain.push((&name[..i], &name[i + 1..]));
    }

    chain.push(("", name));
    chain
}

/// Check whether `name` is `namespace` itself or lies beneath it.
///
/// The root namespace contains every name.
pub fn is_within(name: &str, namespace: &str) -> bool {
    if namespace.is_empty() {
        return true;
    }
    match name.strip_prefix(namespace) {
        Some("") => true,
        Some(rest) => rest.starts_with(SEPARATOR),
        None => false,
    }
}
