use serde::{Serialize, de::DeserializeOwned};

use crate::error::{Error, ErrorKind, Result};

/// Pluggable value serializer.
///
/// The framework never interprets payload bytes itself; it only asks the
/// serializer to encode and decode individual values, in declaration order.
/// Encoded values must be self-delimiting so that `read` can consume exactly
/// one value from the input slice.
pub trait Serializer: Clone + Send + Sync + 'static {
    /// # Errors
    fn write<T: Serialize + ?Sized>(&self, out: &mut Vec<u8>, value: &T) -> Result<()>;

    /// Reads one value from the front of `input`, advancing it.
    ///
    /// # Errors
    fn read<T: DeserializeOwned>(&self, input: &mut &[u8]) -> Result<T>;
}

/// MessagePack-backed stock serializer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MsgpackSerializer;

impl Serializer for MsgpackSerializer {
    fn write<T: Serialize + ?Sized>(&self, out: &mut Vec<u8>, value: &T) -> Result<()> {
        Ok(rmp_serde::encode::write(out, value)?)
    }

    fn read<T: DeserializeOwned>(&self, input: &mut &[u8]) -> Result<T> {
        let mut de = rmp_serde::Deserializer::new(&mut *input);
        Ok(T::deserialize(&mut de)?)
    }
}

#[derive(Debug)]
struct AbsentError(String);

impl std::fmt::Display for AbsentError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for AbsentError {}

impl serde::de::Error for AbsentError {
    fn custom<T: std::fmt::Display>(msg: T) -> Self {
        Self(msg.to_string())
    }
}

/// Deserializer for an argument position past the end of the payload.
///
/// Only optional values can materialize out of nothing; everything else is a
/// decode error. This is what makes trailing `Option<T>` parameters
/// omittable by older peers.
struct AbsentDeserializer;

impl<'de> serde::Deserializer<'de> for AbsentDeserializer {
    type Error = AbsentError;

    fn deserialize_any<V: serde::de::Visitor<'de>>(
        self,
        _visitor: V,
    ) -> std::result::Result<V::Value, Self::Error> {
        Err(AbsentError("absent argument".to_string()))
    }

    fn deserialize_option<V: serde::de::Visitor<'de>>(
        self,
        visitor: V,
    ) -> std::result::Result<V::Value, Self::Error> {
        visitor.visit_none()
    }

    serde::forward_to_deserialize_any! {
        bool i8 i16 i32 i64 i128 u8 u16 u32 u64 u128 f32 f64 char str string
        bytes byte_buf unit unit_struct newtype_struct seq tuple
        tuple_struct map struct enum identifier ignored_any
    }
}

fn read_arg<S: Serializer, T: DeserializeOwned>(s: &S, input: &mut &[u8]) -> Result<T> {
    if input.is_empty() {
        T::deserialize(AbsentDeserializer).map_err(|_| {
            Error::new(
                ErrorKind::DeserializeFailed,
                "missing non-optional argument".to_string(),
            )
        })
    } else {
        s.read(input)
    }
}

/// An argument tuple that can cross the wire.
///
/// Arguments are encoded strictly in declaration order. `marshal` reserves
/// `head_space` zero bytes at the front so the frame header can be written in
/// place without a second allocation. `unmarshal` reads in the same order and
/// ignores bytes past the last declared argument.
pub trait RpcArgs: Sized + Send + 'static {
    /// # Errors
    fn marshal<S: Serializer>(&self, s: &S, head_space: usize) -> Result<Vec<u8>>;

    /// # Errors
    fn unmarshal<S: Serializer>(s: &S, input: &[u8]) -> Result<Self>;
}

impl RpcArgs for () {
    fn marshal<S: Serializer>(&self, _s: &S, head_space: usize) -> Result<Vec<u8>> {
        Ok(vec![0u8; head_space])
    }

    fn unmarshal<S: Serializer>(_s: &S, _input: &[u8]) -> Result<Self> {
        Ok(())
    }
}

macro_rules! impl_rpc_args {
    ($($name:ident),+) => {
        impl<$($name,)+> RpcArgs for ($($name,)+)
        where
            $($name: Serialize + DeserializeOwned + Send + 'static,)+
        {
            fn marshal<S: Serializer>(&self, s: &S, head_space: usize) -> Result<Vec<u8>> {
                #[allow(non_snake_case)]
                let ($($name,)+) = self;
                let mut out = vec![0u8; head_space];
                $(s.write(&mut out, $name)?;)+
                Ok(out)
            }

            fn unmarshal<S: Serializer>(s: &S, mut input: &[u8]) -> Result<Self> {
                Ok(($(read_arg::<S, $name>(s, &mut input)?,)+))
            }
        }
    };
}

impl_rpc_args!(A0);
impl_rpc_args!(A0, A1);
impl_rpc_args!(A0, A1, A2);
impl_rpc_args!(A0, A1, A2, A3);
impl_rpc_args!(A0, A1, A2, A3, A4);
impl_rpc_args!(A0, A1, A2, A3, A4, A5);

pub(crate) const EX_USER: u32 = 0;
pub(crate) const EX_UNKNOWN_VERB: u32 = 1;

pub(crate) fn encode_user_exception(head_space: usize, msg: &str) -> Vec<u8> {
    let mut out = vec![0u8; head_space];
    out.extend_from_slice(&EX_USER.to_le_bytes());
    out.extend_from_slice(&u32::try_from(msg.len()).unwrap_or(u32::MAX).to_le_bytes());
    out.extend_from_slice(msg.as_bytes());
    out
}

pub(crate) fn encode_unknown_verb_exception(head_space: usize, verb: u64) -> Vec<u8> {
    let mut out = vec![0u8; head_space];
    out.extend_from_slice(&EX_UNKNOWN_VERB.to_le_bytes());
    out.extend_from_slice(&8u32.to_le_bytes());
    out.extend_from_slice(&verb.to_le_bytes());
    out
}

/// Decodes an exception payload.
///
/// `Ok` carries the remote error to hand to the caller; `Err` means the
/// payload itself is malformed, which is connection-fatal.
pub(crate) fn decode_exception(mut data: &[u8]) -> Result<Error> {
    fn take<'a, const N: usize>(data: &mut &'a [u8]) -> Result<[u8; N]> {
        take_slice(data, N).map(|head| {
            let mut bytes = [0u8; N];
            bytes.copy_from_slice(head);
            bytes
        })
    }

    fn take_slice<'a>(data: &mut &'a [u8], n: usize) -> Result<&'a [u8]> {
        if data.len() < n {
            return Err(Error::new(
                ErrorKind::Protocol,
                "buffer underflow in exception payload".to_string(),
            ));
        }
        let (head, tail) = data.split_at(n);
        *data = tail;
        Ok(head)
    }

    let kind = u32::from_le_bytes(take(&mut data)?);
    let len = u32::from_le_bytes(take(&mut data)?);
    let mut body = take_slice(&mut data, len as usize)?;
    match kind {
        EX_USER => Ok(Error::new(
            ErrorKind::Remote,
            String::from_utf8_lossy(body).into_owned(),
        )),
        EX_UNKNOWN_VERB => {
            let verb = u64::from_le_bytes(take(&mut body)?);
            Ok(Error::new(ErrorKind::UnknownVerb, verb.to_string()))
        }
        other => Ok(Error::kind(ErrorKind::Unknown(format!(
            "exception type {other}"
        )))),
    }
}
