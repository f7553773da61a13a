use std::sync::LazyLock;

use serde::{Deserialize, Serialize};

/// Serialization boundary. Implementations must be pure and thread-safe;
/// errors are logged at the call site and surface as `Err(())` so the
/// caller decides the policy.
pub trait Codec: Default + Send + Sync + 'static {
    fn encode<T: Serialize>(&self, msg: &T) -> Result<Vec<u8>, ()>;

    /// Serialize the msg into `buf` and return the size written.
    fn encode_into<T: Serialize>(&self, msg: &T, buf: &mut Vec<u8>) -> Result<usize, ()>;

    fn decode<'a, T: Deserialize<'a>>(&self, buf: &'a [u8]) -> Result<T, ()>;
}

#[derive(Default)]
pub struct MsgpCodec();

impl Codec for MsgpCodec {
    #[inline(always)]
    fn encode<T: Serialize>(&self, msg: &T) -> Result<Vec<u8>, ()> {
        match rmp_serde::encode::to_vec_named(msg) {
            Ok(buf) => Ok(buf),
            Err(e) => {
                log::error!("encode error: {:?}", e);
                Err(())
            }
        }
    }

    fn encode_into<T: Serialize>(&self, msg: &T, buf: &mut Vec<u8>) -> Result<usize, ()> {
        let pre_len = buf.len();
        if let Err(e) = rmp_serde::encode::write_named(buf, msg) {
            log::error!("encode error: {:?}", e);
            Err(())
        } else {
            Ok(buf.len() - pre_len)
        }
    }

    #[inline(always)]
    fn decode<'a, T: Deserialize<'a>>(&self, buf: &'a [u8]) -> Result<T, ()> {
        match rmp_serde::decode::from_slice::<T>(buf) {
            Err(e) => {
                log::warn!("decode error: {:?}", e);
                Err(())
            }
            Ok(s) => Ok(s),
        }
    }
}

static SERIALIZER: LazyLock<MsgpCodec> = LazyLock::new(MsgpCodec::default);

/// The process-wide serializer the dispatcher-side deserialization uses.
#[inline]
pub fn serializer() -> &'static MsgpCodec {
    &SERIALIZER
}
