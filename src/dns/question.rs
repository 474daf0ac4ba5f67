use bitstream_io::{BitWrite, BitWriter, Endianness};

use super::{
    ParseError,
    common::PacketComponent,
    enums::{RecordClass, RecordType},
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Question {
    pub labels: Vec<String>,
    pub qtype: RecordType,
    pub qclass: RecordClass,
}

impl Default for Question {
    fn default() -> Self {
        Self {
            labels: Vec::new(),
            qtype: RecordType::A,
            qclass: RecordClass::IN,
        }
    }
}

impl Question {
    /// Lowercased dotted name without trailing dot. This is the form used
    /// for cache keys and blocklist lookups.
    pub fn name(&self) -> String {
        let mut name = String::with_capacity(64);
        for label in self.labels.iter().filter(|l| !l.is_empty()) {
            if !name.is_empty() {
                name.push('.');
            }
            name.push_str(label);
        }
        name.make_ascii_lowercase();
        name
    }
}

impl PacketComponent for Question {
    fn write<E: Endianness>(
        &self,
        writer: &mut BitWriter<&mut Vec<u8>, E>,
    ) -> Result<(), ParseError> {
        self.write_labels(writer, &self.labels)?;
        writer.write_var::<u16>(16, self.qtype.into())?;
        writer.write_var::<u16>(16, self.qclass.into())?;
        Ok(())
    }
}
