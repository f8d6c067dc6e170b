//! Type-indexed formatter registry.
//!
//! Maps a Rust type to its `(encode, decode)` pair with O(1) `TypeId`
//! lookup. Primitives are pre-registered; composite formatters are
//! registered once at startup and iterate their fields in declaration order
//! (a field the schema marks as ignored is simply never written). The
//! process-wide instance behind [`global`] is the only process-wide state in
//! the crate, and it is write-once by discipline: registration happens
//! before the listener starts, lookups after.

use std::{
    any::{Any, TypeId, type_name},
    collections::HashMap,
    sync::{Arc, OnceLock, RwLock},
};

use crate::{
    errors::{ProtocolError, Result},
    wire::{WireReader, WireWriter},
};

type EncodeFn<T> = dyn Fn(&T, &mut WireWriter) -> Result<()> + Send + Sync;
type DecodeFn<T> = dyn Fn(&mut WireReader<'_>) -> Result<T> + Send + Sync;

/// An `(encode, decode)` pair for one value type.
///
/// Cheap to clone; both halves are shared function objects.
pub struct Formatter<T> {
    encode: Arc<EncodeFn<T>>,
    decode: Arc<DecodeFn<T>>,
}

impl<T> Clone for Formatter<T> {
    fn clone(&self) -> Self {
        Self { encode: Arc::clone(&self.encode), decode: Arc::clone(&self.decode) }
    }
}

impl<T: 'static> Formatter<T> {
    /// Build a formatter from an encode and a decode function.
    pub fn new(
        encode: impl Fn(&T, &mut WireWriter) -> Result<()> + Send + Sync + 'static,
        decode: impl Fn(&mut WireReader<'_>) -> Result<T> + Send + Sync + 'static,
    ) -> Self {
        Self { encode: Arc::new(encode), decode: Arc::new(decode) }
    }

    /// Encode a value.
    pub fn encode(&self, value: &T, writer: &mut WireWriter) -> Result<()> {
        (self.encode)(value, writer)
    }

    /// Decode a value.
    pub fn decode(&self, reader: &mut WireReader<'_>) -> Result<T> {
        (self.decode)(reader)
    }

    /// Derive the nullable formatter for this type.
    ///
    /// Wire form: flag byte `0` for absent; `1` followed by the inner
    /// encoding for present. Any other flag byte fails
    /// [`ProtocolError::InvalidNullable`]. Strings do not use this wrapper;
    /// they carry their own null sentinel in the count prefix.
    #[must_use]
    pub fn nullable(self) -> Formatter<Option<T>> {
        let encode_inner = Arc::clone(&self.encode);
        let decode_inner = Arc::clone(&self.decode);

        Formatter::new(
            move |value: &Option<T>, writer| match value {
                None => {
                    writer.put_u8(0);
                    Ok(())
                },
                Some(inner) => {
                    writer.put_u8(1);
                    encode_inner(inner, writer)
                },
            },
            move |reader| match reader.get_u8()? {
                0 => Ok(None),
                1 => decode_inner(reader).map(Some),
                flag => Err(ProtocolError::InvalidNullable(flag)),
            },
        )
    }
}

impl<T> std::fmt::Debug for Formatter<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Formatter").field("type", &type_name::<T>()).finish()
    }
}

/// Registry of formatters keyed by `TypeId`.
#[derive(Debug, Default)]
pub struct FormatterRegistry {
    entries: RwLock<HashMap<TypeId, Box<dyn Any + Send + Sync>>>,
}

impl FormatterRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry with every primitive formatter pre-registered:
    /// fixed-width integers, floats, `bool`, `String`, `Option<String>`,
    /// and the nullable wrappers of the numeric primitives.
    #[must_use]
    pub fn with_primitives() -> Self {
        let registry = Self::new();

        registry.register(Formatter::<u8>::new(
            |v, w| {
                w.put_u8(*v);
                Ok(())
            },
            |r| WireReader::get_u8(r),
        ));
        registry.register(Formatter::<u16>::new(
            |v, w| {
                w.put_u16(*v);
                Ok(())
            },
            |r| WireReader::get_u16(r),
        ));
        registry.register(Formatter::<u32>::new(
            |v, w| {
                w.put_u32(*v);
                Ok(())
            },
            |r| WireReader::get_u32(r),
        ));
        registry.register(Formatter::<u64>::new(
            |v, w| {
                w.put_u64(*v);
                Ok(())
            },
            |r| WireReader::get_u64(r),
        ));
        registry.register(Formatter::<i8>::new(
            |v, w| {
                w.put_i8(*v);
                Ok(())
            },
            |r| WireReader::get_i8(r),
        ));
        registry.register(Formatter::<i16>::new(
            |v, w| {
                w.put_i16(*v);
                Ok(())
            },
            |r| WireReader::get_i16(r),
        ));
        registry.register(Formatter::<i32>::new(
            |v, w| {
                w.put_i32(*v);
                Ok(())
            },
            |r| WireReader::get_i32(r),
        ));
        registry.register(Formatter::<i64>::new(
            |v, w| {
                w.put_i64(*v);
                Ok(())
            },
            |r| WireReader::get_i64(r),
        ));
        registry.register(Formatter::<f32>::new(
            |v, w| {
                w.put_f32(*v);
                Ok(())
            },
            |r| WireReader::get_f32(r),
        ));
        registry.register(Formatter::<f64>::new(
            |v, w| {
                w.put_f64(*v);
                Ok(())
            },
            |r| WireReader::get_f64(r),
        ));
        registry.register(Formatter::<bool>::new(
            |v, w| {
                w.put_bool(*v);
                Ok(())
            },
            |r| WireReader::get_bool(r),
        ));
        registry.register(Formatter::<String>::new(
            |v, w| w.put_str(v),
            |r| r.get_str(),
        ));
        registry.register(Formatter::<Option<String>>::new(
            |v, w| w.put_opt_str(v.as_deref()),
            |r| r.get_opt_str(),
        ));

        registry.register_nullable::<u8>();
        registry.register_nullable::<u16>();
        registry.register_nullable::<u32>();
        registry.register_nullable::<u64>();
        registry.register_nullable::<i8>();
        registry.register_nullable::<i16>();
        registry.register_nullable::<i32>();
        registry.register_nullable::<i64>();
        registry.register_nullable::<f32>();
        registry.register_nullable::<f64>();
        registry.register_nullable::<bool>();

        registry
    }

    /// Register a formatter for `T`.
    ///
    /// Returns `false` if a formatter for `T` was already registered; the
    /// existing registration wins.
    pub fn register<T: Send + Sync + 'static>(&self, formatter: Formatter<T>) -> bool {
        let Ok(mut entries) = self.entries.write() else {
            return false;
        };

        match entries.entry(TypeId::of::<T>()) {
            std::collections::hash_map::Entry::Occupied(_) => false,
            std::collections::hash_map::Entry::Vacant(slot) => {
                slot.insert(Box::new(formatter));
                true
            },
        }
    }

    /// Register the nullable wrapper `Option<T>` derived from the formatter
    /// already registered for `T`.
    ///
    /// Returns `false` if `T` has no formatter or `Option<T>` is already
    /// registered.
    pub fn register_nullable<T: Send + Sync + 'static>(&self) -> bool {
        let Ok(inner) = self.get::<T>() else {
            return false;
        };
        self.register(inner.nullable())
    }

    /// Resolve the formatter for `T`.
    ///
    /// # Errors
    ///
    /// - [`ProtocolError::UnregisteredType`] if no formatter is registered.
    pub fn get<T: 'static>(&self) -> Result<Formatter<T>> {
        let entries =
            self.entries.read().map_err(|_| ProtocolError::UnregisteredType(type_name::<T>()))?;

        entries
            .get(&TypeId::of::<T>())
            .and_then(|boxed| boxed.downcast_ref::<Formatter<T>>())
            .cloned()
            .ok_or(ProtocolError::UnregisteredType(type_name::<T>()))
    }

    /// Encode a value using its registered formatter.
    pub fn encode_value<T: 'static>(&self, value: &T, writer: &mut WireWriter) -> Result<()> {
        self.get::<T>()?.encode(value, writer)
    }

    /// Decode a value using its registered formatter.
    pub fn decode_value<T: 'static>(&self, reader: &mut WireReader<'_>) -> Result<T> {
        self.get::<T>()?.decode(reader)
    }
}

/// Process-wide registry with primitives pre-registered.
///
/// Composite formatters are registered here during startup, before any
/// connection is accepted.
pub fn global() -> &'static FormatterRegistry {
    static REGISTRY: OnceLock<FormatterRegistry> = OnceLock::new();
    REGISTRY.get_or_init(FormatterRegistry::with_primitives)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primitive_lookup_never_fails() {
        let registry = FormatterRegistry::with_primitives();

        let mut w = WireWriter::new();
        registry.encode_value(&0xAABBu16, &mut w).unwrap();
        registry.encode_value(&true, &mut w).unwrap();
        registry.encode_value(&(-7i64), &mut w).unwrap();

        let bytes = w.freeze();
        let mut r = WireReader::new(&bytes);
        assert_eq!(registry.decode_value::<u16>(&mut r).unwrap(), 0xAABB);
        assert!(registry.decode_value::<bool>(&mut r).unwrap());
        assert_eq!(registry.decode_value::<i64>(&mut r).unwrap(), -7);
    }

    #[test]
    fn unregistered_type_fails() {
        struct Unknown;

        let registry = FormatterRegistry::with_primitives();
        let result = registry.get::<Unknown>();
        assert!(matches!(result, Err(ProtocolError::UnregisteredType(_))));
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let registry = FormatterRegistry::with_primitives();
        let duplicate = Formatter::<u8>::new(
            |v, w| {
                w.put_u8(*v);
                Ok(())
            },
            |r| WireReader::get_u8(r),
        );
        assert!(!registry.register(duplicate));
    }

    #[test]
    fn nullable_round_trip_and_flag_validation() {
        let registry = FormatterRegistry::with_primitives();

        let mut w = WireWriter::new();
        registry.encode_value(&Some(0x0102_0304u32), &mut w).unwrap();
        registry.encode_value(&None::<u32>, &mut w).unwrap();

        let bytes = w.freeze();
        assert_eq!(&bytes[..], &[1, 0x04, 0x03, 0x02, 0x01, 0]);

        let mut r = WireReader::new(&bytes);
        assert_eq!(registry.decode_value::<Option<u32>>(&mut r).unwrap(), Some(0x0102_0304));
        assert_eq!(registry.decode_value::<Option<u32>>(&mut r).unwrap(), None);

        let mut r = WireReader::new(&[2, 0, 0, 0, 0]);
        assert_eq!(
            registry.decode_value::<Option<u32>>(&mut r),
            Err(ProtocolError::InvalidNullable(2))
        );
    }

    #[test]
    fn composite_formatter_in_declaration_order() {
        // An aggregate encodes fields in declaration order; `debug_label`
        // is ignored by the schema and never hits the wire.
        #[derive(Debug, Clone, PartialEq)]
        struct Login {
            account: String,
            session: Option<u64>,
            resume: bool,
            debug_label: String,
        }

        let registry = FormatterRegistry::with_primitives();
        let account_fmt = registry.get::<String>().unwrap();
        let session_fmt = registry.get::<Option<u64>>().unwrap();
        let resume_fmt = registry.get::<bool>().unwrap();

        let (enc_a, enc_s, enc_r) =
            (account_fmt.clone(), session_fmt.clone(), resume_fmt.clone());
        registry.register(Formatter::<Login>::new(
            move |v, w| {
                enc_a.encode(&v.account, w)?;
                enc_s.encode(&v.session, w)?;
                enc_r.encode(&v.resume, w)
            },
            move |r| {
                Ok(Login {
                    account: account_fmt.decode(r)?,
                    session: session_fmt.decode(r)?,
                    resume: resume_fmt.decode(r)?,
                    debug_label: String::new(),
                })
            },
        ));

        let value = Login {
            account: "ada".to_owned(),
            session: Some(99),
            resume: true,
            debug_label: "not on the wire".to_owned(),
        };

        let mut w = WireWriter::new();
        registry.encode_value(&value, &mut w).unwrap();
        let bytes = w.freeze();

        let mut r = WireReader::new(&bytes);
        let decoded = registry.decode_value::<Login>(&mut r).unwrap();
        assert_eq!(decoded.account, value.account);
        assert_eq!(decoded.session, value.session);
        assert_eq!(decoded.resume, value.resume);
        assert_eq!(decoded.debug_label, "");
        assert_eq!(r.remaining(), 0);
    }

    #[test]
    fn global_registry_is_shared() {
        let a = global();
        let b = global();
        assert!(std::ptr::eq(a, b));
        assert!(a.get::<u32>().is_ok());
    }
}
