pub mod common;
pub mod enums;
pub mod header;
pub mod question;
pub mod resource;
pub mod wire;

pub use enums::{RecordClass, RecordType, Rcode};
pub use header::Header;
pub use question::Question;
pub use resource::ResourceRecord;

use bitstream_io::{BigEndian, BitReader, BitWriter};
use common::PacketComponent;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum ParseError {
    #[error("Invalid DNS header")]
    InvalidHeader,
    #[error("Invalid DNS label")]
    InvalidLabel,
    #[error("Invalid question section")]
    InvalidQuestion,
    #[error("Invalid resource record")]
    InvalidRecord,
    #[error("Unexpected end of packet at offset {0}")]
    UnexpectedEnd(usize),
    #[error("Bit stream error: {0}")]
    BitStream(String),
}

impl From<std::io::Error> for ParseError {
    fn from(err: std::io::Error) -> Self {
        ParseError::BitStream(err.to_string())
    }
}

impl From<ParseError> for crate::error::GjallarError {
    fn from(err: ParseError) -> Self {
        crate::error::GjallarError::ParseError(err.to_string())
    }
}

/// A fully-parsed DNS message.
///
/// The resolver parses incoming queries into `Message` and synthesizes
/// local/blocked/safe-search answers through it. Upstream responses are kept
/// as raw wire bytes and manipulated with the offset helpers in [`wire`];
/// `Message::parse` is only applied to them in tests.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Message {
    pub header: Header,
    pub questions: Vec<Question>,
    pub answers: Vec<ResourceRecord>,
    pub authorities: Vec<ResourceRecord>,
    pub additionals: Vec<ResourceRecord>,
}

impl Message {
    pub fn parse(buf: &[u8]) -> Result<Self, ParseError> {
        if buf.len() < 12 {
            return Err(ParseError::InvalidHeader);
        }

        let mut reader = BitReader::<_, BigEndian>::new(&buf[0..12]);
        let mut header = Header::default();
        header.read(&mut reader)?;

        let mut offset = 12;
        let mut questions = Vec::with_capacity(header.qdcount as usize);
        for _ in 0..header.qdcount {
            let (question, next) = wire::parse_question(buf, offset)?;
            questions.push(question);
            offset = next;
        }

        let mut sections = [
            Vec::with_capacity(header.ancount as usize),
            Vec::with_capacity(header.nscount as usize),
            Vec::with_capacity(header.arcount as usize),
        ];
        let counts = [header.ancount, header.nscount, header.arcount];
        for (section, &count) in sections.iter_mut().zip(counts.iter()) {
            for _ in 0..count {
                let (record, next) = wire::parse_record(buf, offset)?;
                section.push(record);
                offset = next;
            }
        }
        let [answers, authorities, additionals] = sections;

        Ok(Self {
            header,
            questions,
            answers,
            authorities,
            additionals,
        })
    }

    /// Serialize without name compression. Section counts are taken from the
    /// vectors, not the header fields.
    pub fn serialize(&self) -> Result<Vec<u8>, ParseError> {
        let mut out = Vec::with_capacity(512);
        let mut writer = BitWriter::endian(&mut out, BigEndian);

        let mut header = self.header.clone();
        header.qdcount = self.questions.len() as u16;
        header.ancount = self.answers.len() as u16;
        header.nscount = self.authorities.len() as u16;
        header.arcount = self.additionals.len() as u16;
        header.write(&mut writer)?;

        for question in &self.questions {
            question.write(&mut writer)?;
        }
        for record in self
            .answers
            .iter()
            .chain(&self.authorities)
            .chain(&self.additionals)
        {
            record.write(&mut writer)?;
        }

        Ok(out)
    }

    /// Start a response from a query: same ID and question, QR/RA set,
    /// RD echoed, all answer sections empty.
    pub fn response_for(query: &Message) -> Self {
        let mut header = Header {
            id: query.header.id,
            qr: true,
            opcode: query.header.opcode,
            rd: query.header.rd,
            ra: true,
            ..Header::default()
        };
        header.qdcount = query.questions.len() as u16;

        Self {
            header,
            questions: query.questions.clone(),
            answers: Vec::new(),
            authorities: Vec::new(),
            additionals: Vec::new(),
        }
    }

    pub fn answer_for(query: &Message, answers: Vec<ResourceRecord>) -> Self {
        let mut response = Self::response_for(query);
        response.header.ancount = answers.len() as u16;
        response.answers = answers;
        response
    }

    pub fn nxdomain_for(query: &Message) -> Self {
        let mut response = Self::response_for(query);
        response.header.rcode = Rcode::NxDomain.to_u8();
        response
    }

    /// NODATA: NOERROR with an empty answer section.
    pub fn nodata_for(query: &Message) -> Self {
        Self::response_for(query)
    }

    pub fn servfail_for(query: &Message) -> Self {
        let mut response = Self::response_for(query);
        response.header.rcode = Rcode::ServFail.to_u8();
        response
    }

    pub fn formerr_for(query: &Message) -> Self {
        let mut response = Self::response_for(query);
        response.header.rcode = Rcode::FormErr.to_u8();
        response
    }

    pub fn rcode(&self) -> Rcode {
        Rcode::from_u8(self.header.rcode)
    }

    /// Smallest TTL across answer records, skipping OPT pseudo-records.
    pub fn min_answer_ttl(&self) -> Option<u32> {
        self.answers
            .iter()
            .filter(|r| r.rtype != RecordType::OPT)
            .map(|r| r.ttl)
            .min()
    }

    /// NXDOMAIN, or NOERROR with no answers.
    pub fn is_negative(&self) -> bool {
        self.rcode() == Rcode::NxDomain
            || (self.rcode() == Rcode::NoError && self.answers.is_empty())
    }
}
