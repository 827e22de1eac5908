//! Fixed-width integer helpers for the envelope encoding.

use arf_proto::DecodeError;
use std::io::Read;

pub(crate) fn read_u8(r: &mut dyn Read) -> Result<u8, DecodeError> {
    let mut b = [0u8; 1];
    r.read_exact(&mut b)?;
    Ok(b[0])
}

pub(crate) fn read_u16(r: &mut dyn Read) -> Result<u16, DecodeError> {
    let mut b = [0u8; 2];
    r.read_exact(&mut b)?;
    Ok(u16::from_be_bytes(b))
}
