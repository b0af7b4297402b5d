use std::io;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::consts::MAX_OOB_PAYLOAD_SIZE;

pub trait Bytes: Sized {
    fn write_to(&self, writer: &mut impl WriteBytesExt) -> Result<(), io::Error>;
    fn read_from(reader: &mut impl ReadBytesExt) -> Result<Self, io::Error>;
}

/// Writes a `u16` length-prefixed opaque payload.
pub(crate) fn write_payload(writer: &mut impl WriteBytesExt, payload: &[u8]) -> io::Result<()> {
    if payload.len() > MAX_OOB_PAYLOAD_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!(
                "payload of {} bytes exceeds max of {MAX_OOB_PAYLOAD_SIZE}",
                payload.len()
            ),
        ));
    }
    writer.write_u16::<LittleEndian>(payload.len() as u16)?;
    writer.write_all(payload)
}

pub(crate) fn read_payload(reader: &mut impl ReadBytesExt) -> io::Result<Vec<u8>> {
    let len = reader.read_u16::<LittleEndian>()? as usize;
    if len > MAX_OOB_PAYLOAD_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("payload length {len} is out of range 0-{MAX_OOB_PAYLOAD_SIZE}"),
        ));
    }
    let mut payload = vec![0; len];
    reader.read_exact(&mut payload)?;
    Ok(payload)
}
