use bytes::{Buf, BufMut, Bytes};

use crate::{common::ByteStr, protocol::ProtocolError};

/// Integer signess in postgres docs is awful.
pub trait UsizeExt {
    /// length is usize in rust, while sometime postgres want u32,
    /// this will panic when overflow instead of wrapping
    fn to_u32(self) -> u32;
    /// length is usize in rust, while sometime postgres want u16,
    /// this will panic when overflow instead of wrapping
    fn to_u16(self) -> u16;
}

impl UsizeExt for usize {
    fn to_u32(self) -> u32 {
        self.try_into().expect("message size too large for protocol")
    }

    fn to_u16(self) -> u16 {
        self.try_into().expect("message size too large for protocol")
    }
}

pub trait StrExt {
    /// postgres String must be nul terminated
    fn nul_string_len(&self) -> u32;
}

impl StrExt for str {
    fn nul_string_len(&self) -> u32 {
        self.len().to_u32() + 1/* nul */
    }
}

pub trait BufMutExt {
    /// postgres String must be nul terminated
    fn put_nul_string(&mut self, string: &str);
}

impl<B: BufMut> BufMutExt for B {
    fn put_nul_string(&mut self, string: &str) {
        self.put(string.as_bytes());
        self.put_u8(b'\0');
    }
}

pub trait BytesExt {
    /// Split off bytes up to the next nul terminator, consuming the terminator.
    fn get_nul_bytes(&mut self) -> Result<Bytes, ProtocolError>;

    /// Split off a nul terminated utf8 string.
    fn get_nul_bytestr(&mut self) -> Result<ByteStr, ProtocolError>;
}

impl BytesExt for Bytes {
    fn get_nul_bytes(&mut self) -> Result<Bytes, ProtocolError> {
        let end = self
            .iter()
            .position(|e| matches!(e, b'\0'))
            .ok_or_else(ProtocolError::missing_nul)?;
        let me = self.split_to(end);
        Buf::advance(self, 1); // nul
        Ok(me)
    }

    fn get_nul_bytestr(&mut self) -> Result<ByteStr, ProtocolError> {
        ByteStr::from_utf8(self.get_nul_bytes()?).map_err(ProtocolError::non_utf8)
    }
}
