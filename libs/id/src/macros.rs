//! Macro for defining typed ID types.

/// Defines a ULID-backed ID newtype with a fixed string prefix.
///
/// The generated type gets `new()`, `short()`, `Display` and a
/// string-based `Serialize` impl.
///
/// ```ignore
/// define_id!(SessionId, "ses");
///
/// let id = SessionId::new();
/// assert!(id.to_string().starts_with("ses_"));
/// ```
#[macro_export]
macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name($crate::Ulid);

        impl $name {
            /// The prefix for this ID type.
            pub const PREFIX: &'static str = $prefix;

            /// Creates a new ID with a fresh ULID.
            #[must_use]
            pub fn new() -> Self {
                Self($crate::Ulid::new())
            }

            /// Lowercase tail of the ULID (random bits only), usable in
            /// hostnames and directory names.
            #[must_use]
            pub fn short(&self) -> String {
                let full = self.0.to_string();
                full[full.len() - 10..].to_ascii_lowercase()
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}_{}", Self::PREFIX, self.0)
            }
        }

        impl serde::Serialize for $name {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: serde::Serializer,
            {
                serializer.collect_str(self)
            }
        }
    };
}
