use std::net::{Ipv4Addr, Ipv6Addr};

use bitstream_io::{BitWrite, BitWriter, Endianness};

use super::{
    ParseError,
    common::{PacketComponent, encode_name},
    enums::{RecordClass, RecordType},
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResourceRecord {
    pub labels: Vec<String>,
    pub rtype: RecordType,
    pub rclass: RecordClass,
    pub ttl: u32,
    pub rdata: Vec<u8>,
}

impl ResourceRecord {
    fn new(name: &str, rtype: RecordType, ttl: u32, rdata: Vec<u8>) -> Self {
        Self {
            labels: name
                .split('.')
                .filter(|l| !l.is_empty())
                .map(|l| l.to_string())
                .collect(),
            rtype,
            rclass: RecordClass::IN,
            ttl,
            rdata,
        }
    }

    pub fn a(name: &str, ttl: u32, addr: Ipv4Addr) -> Self {
        Self::new(name, RecordType::A, ttl, addr.octets().to_vec())
    }

    pub fn aaaa(name: &str, ttl: u32, addr: Ipv6Addr) -> Self {
        Self::new(name, RecordType::AAAA, ttl, addr.octets().to_vec())
    }

    pub fn cname(name: &str, ttl: u32, target: &str) -> Result<Self, ParseError> {
        Ok(Self::new(name, RecordType::CNAME, ttl, encode_name(target)?))
    }

    /// TXT rdata is a sequence of length-prefixed character strings; long
    /// values are chunked at 255 bytes.
    pub fn txt(name: &str, ttl: u32, text: &str) -> Self {
        let mut rdata = Vec::with_capacity(text.len() + 1);
        for chunk in text.as_bytes().chunks(255) {
            rdata.push(chunk.len() as u8);
            rdata.extend_from_slice(chunk);
        }
        if text.is_empty() {
            rdata.push(0);
        }
        Self::new(name, RecordType::TXT, ttl, rdata)
    }
}

impl PacketComponent for ResourceRecord {
    fn write<E: Endianness>(
        &self,
        writer: &mut BitWriter<&mut Vec<u8>, E>,
    ) -> Result<(), ParseError> {
        self.write_labels(writer, &self.labels)?;
        writer.write_var::<u16>(16, self.rtype.into())?;
        writer.write_var::<u16>(16, self.rclass.into())?;
        writer.write_var::<u32>(32, self.ttl)?;
        writer.write_var::<u16>(16, self.rdata.len() as u16)?;
        writer.write_bytes(&self.rdata)?;
        Ok(())
    }
}
