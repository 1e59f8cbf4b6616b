//! Shared utilities.
//!
//! Currently this module hosts [`vendor_enum!`](crate::vendor_enum), the macro
//! used for BACnet enumerations that reserve a portion of their value space
//! for vendor-proprietary extensions (error class, error code). Standard
//! values get named variants; values inside the proprietary range decode to
//! `Proprietary`, everything else to `Reserved`, so decoding never fails on
//! input from a conforming-but-extended peer.

/// Generates an enum over a BACnet value space with named standard variants,
/// a `Proprietary` variant for values inside the vendor range, and a
/// `Reserved` variant for everything else.
///
/// Conversions in both directions (`From<$repr>` / `From<$name>`) are total:
/// unknown values are classified, not rejected. The raw value of a
/// `Proprietary`/`Reserved` variant is wrapped so that named values cannot be
/// aliased by hand-built raw ones.
///
/// # Example
///
/// ```rust
/// use bacnet_engine::vendor_enum;
///
/// vendor_enum! {
///     /// Demo enumeration.
///     Demo {
///         Alpha = 0,
///         Beta = 1,
///     },
///     u16,
///     256..=65535
/// }
///
/// assert_eq!(Demo::from(1u16), Demo::Beta);
/// assert!(matches!(Demo::from(300u16), Demo::Proprietary(_)));
/// assert!(matches!(Demo::from(17u16), Demo::Reserved(_)));
/// assert_eq!(u16::from(Demo::Alpha), 0);
/// ```
#[macro_export]
macro_rules! vendor_enum {
    ($(#[$doc:meta])* $name:ident { $($variant:ident = $value:expr,)+ }, $repr:ident, $vendor_range:expr) => {
        pastey::paste! {
            $(#[$doc])*
            #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
            pub enum $name {
                $($variant,)*
                /// Value inside the vendor-proprietary range.
                Proprietary( [<$name Raw>] ),
                /// Value outside both the standard set and the vendor range.
                Reserved( [<$name Raw>] ),
            }

            /// Opaque carrier for a non-standard raw value of the parent enum.
            #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
            pub struct [<$name Raw>]($repr);

            impl [<$name Raw>] {
                pub fn value(&self) -> $repr {
                    self.0
                }
            }

            impl std::fmt::Display for $name {
                fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                    match self {
                        $($name::$variant => f.write_str(stringify!($variant)),)*
                        $name::Proprietary(raw) => write!(f, "Proprietary({})", raw.value()),
                        $name::Reserved(raw) => write!(f, "Reserved({})", raw.value()),
                    }
                }
            }

            impl From<$name> for $repr {
                fn from(value: $name) -> Self {
                    match value {
                        $($name::$variant => $value,)*
                        $name::Proprietary(raw) | $name::Reserved(raw) => raw.value(),
                    }
                }
            }

            impl From<$repr> for $name {
                fn from(value: $repr) -> Self {
                    match value {
                        $($value => $name::$variant,)*
                        v if ($vendor_range).contains(&v) => $name::Proprietary([<$name Raw>](v)),
                        v => $name::Reserved([<$name Raw>](v)),
                    }
                }
            }
        }
    };
}

#[cfg(test)]
mod tests {
    vendor_enum! {
        Sample {
            Zero = 0,
            Seven = 7,
        },
        u16,
        64..=65535
    }

    #[test]
    fn named_values_round_trip() {
        assert_eq!(Sample::from(0u16), Sample::Zero);
        assert_eq!(u16::from(Sample::Seven), 7);
        assert_eq!(format!("{}", Sample::Zero), "Zero");
    }

    #[test]
    fn vendor_and_reserved_classification() {
        match Sample::from(100u16) {
            Sample::Proprietary(raw) => assert_eq!(raw.value(), 100),
            other => panic!("expected proprietary, got {other:?}"),
        }
        match Sample::from(9u16) {
            Sample::Reserved(raw) => assert_eq!(raw.value(), 9),
            other => panic!("expected reserved, got {other:?}"),
        }
    }
}
