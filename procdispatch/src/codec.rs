// Copyright (c) 2024-2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! §4.6 Codec abstraction: `encode`/`decode` plus the optional per-type
//! freeze/thaw hook. The wire extension prefixes the payload with
//! `<TAG>!::!<BODY>`; an empty `TAG` means "use the default codec".
//!
//! Unlike the dynamically-typed source this crate generalizes, a Rust work
//! function's return type `T` is fixed at compile time, so dispatch on the
//! tag happens once, against the single `Codec<T>` the call site chose —
//! there is no runtime type registry to consult.

use serde::{de::DeserializeOwned, Serialize};

use crate::error::{DispatchError, DispatchResult};

const TAG_SEPARATOR: &[u8] = b"!::!";

/// Converts a work function's return value to and from bytes for the wire.
///
/// Encoding failure (a value that is not representable — held a live file
/// handle, a trait object, anything the concrete codec can't serialize) is
/// not a dispatcher error in its own right: the child runner treats it as an
/// ordinary work failure and sends an `ERROR` frame (§4.2 step 4).
pub trait Codec<T> {
    /// # Errors
    /// Returns [`DispatchError::UnserializableResult`] (or a codec-specific
    /// variant) if `value` cannot be represented on the wire.
    fn encode(value: &T) -> DispatchResult<Vec<u8>>;

    /// # Errors
    /// Returns [`DispatchError::TransportError`] if `bytes` is not a valid
    /// encoding produced by [`Codec::encode`].
    fn decode(bytes: &[u8]) -> DispatchResult<T>;
}

/// The default codec: JSON via `serde`, tagged with an empty type tag.
pub struct DefaultCodec;

impl<T> Codec<T> for DefaultCodec
where
    T: Serialize + DeserializeOwned,
{
    fn encode(value: &T) -> DispatchResult<Vec<u8>> {
        let body = serde_json::to_vec(value).map_err(|e| DispatchError::UnserializableResult {
            origin: crate::origin::Origin::here(),
            detail: e.to_string(),
        })?;
        Ok(tag_body("", &body))
    }

    fn decode(bytes: &[u8]) -> DispatchResult<T> {
        let (tag, body) = split_tag(bytes)?;
        if !tag.is_empty() {
            return Err(DispatchError::TransportError {
                detail: format!("unexpected type tag {tag:?} for the default codec"),
            });
        }
        serde_json::from_slice(body)
            .map_err(|e| DispatchError::TransportError { detail: e.to_string() })
    }
}

/// The per-type hook (object-protocol `freeze`/`thaw`): a value that knows
/// how to serialize and deserialize itself, identified on the wire by
/// [`FreezeThaw::TAG`].
///
/// Implement this instead of relying on [`DefaultCodec`] when a type needs
/// custom wire semantics (a non-`Serialize` field that can be reconstructed,
/// a more compact binary layout, a value that is sometimes outright
/// unrepresentable).
pub trait FreezeThaw: Sized {
    /// A non-empty tag identifying this type's encoding on the wire.
    const TAG: &'static str;

    /// # Errors
    /// Returns [`DispatchError::UnserializableResult`] if `self` cannot be
    /// frozen (e.g. it holds a live file handle or other opaque resource).
    fn freeze(&self) -> DispatchResult<Vec<u8>>;

    /// # Errors
    /// Returns [`DispatchError::TransportError`] if `bytes` is not a valid
    /// frozen encoding of `Self`.
    fn thaw(bytes: &[u8]) -> DispatchResult<Self>;
}

/// [`Codec`] adapter that routes through a type's own [`FreezeThaw`] hook.
pub struct HookedCodec;

impl<T: FreezeThaw> Codec<T> for HookedCodec {
    fn encode(value: &T) -> DispatchResult<Vec<u8>> {
        Ok(tag_body(T::TAG, &value.freeze()?))
    }

    fn decode(bytes: &[u8]) -> DispatchResult<T> {
        let (tag, body) = split_tag(bytes)?;
        if tag != T::TAG {
            return Err(DispatchError::TransportError {
                detail: format!("expected type tag {:?}, got {tag:?}", T::TAG),
            });
        }
        T::thaw(body)
    }
}

fn tag_body(tag: &str, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(tag.len() + TAG_SEPARATOR.len() + body.len());
    out.extend_from_slice(tag.as_bytes());
    out.extend_from_slice(TAG_SEPARATOR);
    out.extend_from_slice(body);
    out
}

fn split_tag(bytes: &[u8]) -> DispatchResult<(&str, &[u8])> {
    let pos = bytes
        .windows(TAG_SEPARATOR.len())
        .position(|w| w == TAG_SEPARATOR)
        .ok_or_else(|| DispatchError::TransportError {
            detail: "payload missing type-tag separator".to_string(),
        })?;
    let tag = std::str::from_utf8(&bytes[..pos])
        .map_err(|e| DispatchError::TransportError { detail: e.to_string() })?;
    let body = &bytes[pos + TAG_SEPARATOR.len()..];
    Ok((tag, body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Point {
        x: i32,
        y: i32,
    }

    #[test]
    fn default_codec_round_trips() {
        let p = Point { x: 3, y: -4 };
        let bytes = DefaultCodec::encode(&p).unwrap();
        let back: Point = DefaultCodec::decode(&bytes).unwrap();
        assert_eq!(p, back);
    }

    struct Doubled(i64);

    impl FreezeThaw for Doubled {
        const TAG: &'static str = "doubled";

        fn freeze(&self) -> DispatchResult<Vec<u8>> {
            Ok((self.0 * 2).to_le_bytes().to_vec())
        }

        fn thaw(bytes: &[u8]) -> DispatchResult<Self> {
            let arr: [u8; 8] = bytes
                .try_into()
                .map_err(|_| DispatchError::TransportError { detail: "bad width".into() })?;
            Ok(Self(i64::from_le_bytes(arr) / 2))
        }
    }

    #[test]
    fn hooked_codec_round_trips_and_tags() {
        let v = Doubled(21);
        let bytes = HookedCodec::encode(&v).unwrap();
        assert!(bytes.starts_with(b"doubled!::!"));
        let back: Doubled = HookedCodec::decode(&bytes).unwrap();
        assert_eq!(back.0, 21);
    }

    struct AlwaysUnrepresentable;

    impl FreezeThaw for AlwaysUnrepresentable {
        const TAG: &'static str = "opaque";

        fn freeze(&self) -> DispatchResult<Vec<u8>> {
            Err(DispatchError::UnserializableResult {
                origin: crate::origin::Origin::here(),
                detail: "holds a live file handle".to_string(),
            })
        }

        fn thaw(_bytes: &[u8]) -> DispatchResult<Self> {
            unreachable!("never produced on the wire")
        }
    }

    #[test]
    fn hooked_codec_surfaces_freeze_failure() {
        let err = HookedCodec::encode(&AlwaysUnrepresentable).unwrap_err();
        assert!(matches!(err, DispatchError::UnserializableResult { .. }));
    }
}
