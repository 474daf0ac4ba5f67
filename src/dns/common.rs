use bitstream_io::{BitWrite, BitWriter, Endianness};

use super::ParseError;

/// Serialization half of the wire codec. Parsing goes through the
/// offset-based functions in [`super::wire`], which handle compression
/// pointers; writing always emits uncompressed names.
pub trait PacketComponent {
    fn write<E: Endianness>(
        &self,
        writer: &mut BitWriter<&mut Vec<u8>, E>,
    ) -> Result<(), ParseError>;

    fn write_labels<E: Endianness>(
        &self,
        writer: &mut BitWriter<&mut Vec<u8>, E>,
        labels: &[String],
    ) -> Result<(), ParseError> {
        for label in labels {
            if label.is_empty() {
                continue;
            }
            if label.len() > 63 {
                return Err(ParseError::InvalidLabel);
            }
            writer.write_var::<u8>(8, label.len() as u8)?;
            writer.write_bytes(label.as_bytes())?;
        }
        writer.write_var::<u8>(8, 0)?;
        Ok(())
    }
}

/// Encode a dotted name as uncompressed wire labels.
pub fn encode_name(name: &str) -> Result<Vec<u8>, ParseError> {
    let mut out = Vec::with_capacity(name.len() + 2);
    for label in name.split('.').filter(|l| !l.is_empty()) {
        if label.len() > 63 {
            return Err(ParseError::InvalidLabel);
        }
        out.push(label.len() as u8);
        out.extend_from_slice(label.as_bytes());
    }
    out.push(0);
    Ok(out)
}
