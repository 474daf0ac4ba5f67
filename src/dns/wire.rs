//! Offset-based helpers over raw DNS wire bytes.
//!
//! Cached responses are stored and served as wire bytes; these functions
//! patch or inspect them in place without a full parse.

use super::{ParseError, Question, ResourceRecord};

pub const HEADER_LEN: usize = 12;

pub fn id(buf: &[u8]) -> u16 {
    u16::from_be_bytes([buf[0], buf[1]])
}

pub fn set_id(buf: &mut [u8], id: u16) {
    buf[0..2].copy_from_slice(&id.to_be_bytes());
}

pub fn rcode(buf: &[u8]) -> u8 {
    buf[3] & 0x0F
}

pub fn qdcount(buf: &[u8]) -> u16 {
    u16::from_be_bytes([buf[4], buf[5]])
}

pub fn ancount(buf: &[u8]) -> u16 {
    u16::from_be_bytes([buf[6], buf[7]])
}

fn nscount(buf: &[u8]) -> u16 {
    u16::from_be_bytes([buf[8], buf[9]])
}

fn arcount(buf: &[u8]) -> u16 {
    u16::from_be_bytes([buf[10], buf[11]])
}

/// NXDOMAIN, or NOERROR with an empty answer section.
pub fn is_negative(buf: &[u8]) -> bool {
    rcode(buf) == 3 || (rcode(buf) == 0 && ancount(buf) == 0)
}

/// Decode a (possibly compressed) name starting at `start`. Returns the
/// labels and the offset just past the name in the original byte stream.
pub fn parse_name(buf: &[u8], start: usize) -> Result<(Vec<String>, usize), ParseError> {
    let mut labels = Vec::new();
    let mut offset = start;
    let mut jumps = 0;
    let mut resume_at = None;

    loop {
        let len = *buf.get(offset).ok_or(ParseError::UnexpectedEnd(offset))? as usize;

        if len & 0xC0 == 0xC0 {
            let next = *buf.get(offset + 1).ok_or(ParseError::UnexpectedEnd(offset))?;
            if resume_at.is_none() {
                resume_at = Some(offset + 2);
            }
            jumps += 1;
            if jumps > 8 {
                return Err(ParseError::InvalidLabel);
            }
            offset = ((len & 0x3F) << 8) | next as usize;
            continue;
        }

        if len == 0 {
            return Ok((labels, resume_at.unwrap_or(offset + 1)));
        }
        if len > 63 {
            return Err(ParseError::InvalidLabel);
        }

        let end = offset + 1 + len;
        let bytes = buf
            .get(offset + 1..end)
            .ok_or(ParseError::UnexpectedEnd(offset))?;
        labels.push(String::from_utf8(bytes.to_vec()).map_err(|_| ParseError::InvalidLabel)?);
        offset = end;

        if labels.len() > 128 {
            return Err(ParseError::InvalidLabel);
        }
    }
}

/// Advance past a name without decoding it. A compression pointer ends the
/// name after two bytes.
pub fn skip_name(buf: &[u8], start: usize) -> Result<usize, ParseError> {
    let mut offset = start;
    loop {
        let len = *buf.get(offset).ok_or(ParseError::UnexpectedEnd(offset))? as usize;
        if len & 0xC0 == 0xC0 {
            if offset + 2 > buf.len() {
                return Err(ParseError::UnexpectedEnd(offset));
            }
            return Ok(offset + 2);
        }
        if len == 0 {
            return Ok(offset + 1);
        }
        if len > 63 {
            return Err(ParseError::InvalidLabel);
        }
        offset += 1 + len;
        if offset > buf.len() {
            return Err(ParseError::UnexpectedEnd(offset));
        }
    }
}

pub fn parse_question(buf: &[u8], offset: usize) -> Result<(Question, usize), ParseError> {
    let (labels, after_name) = parse_name(buf, offset)?;
    let end = after_name + 4;
    if end > buf.len() {
        return Err(ParseError::InvalidQuestion);
    }
    let qtype = u16::from_be_bytes([buf[after_name], buf[after_name + 1]]).into();
    let qclass = u16::from_be_bytes([buf[after_name + 2], buf[after_name + 3]]).into();
    Ok((
        Question {
            labels,
            qtype,
            qclass,
        },
        end,
    ))
}

pub fn parse_record(buf: &[u8], offset: usize) -> Result<(ResourceRecord, usize), ParseError> {
    let (labels, after_name) = parse_name(buf, offset)?;
    let fixed_end = after_name + 10;
    if fixed_end > buf.len() {
        return Err(ParseError::InvalidRecord);
    }
    let rtype = u16::from_be_bytes([buf[after_name], buf[after_name + 1]]).into();
    let rclass = u16::from_be_bytes([buf[after_name + 2], buf[after_name + 3]]).into();
    let ttl = u32::from_be_bytes([
        buf[after_name + 4],
        buf[after_name + 5],
        buf[after_name + 6],
        buf[after_name + 7],
    ]);
    let rdlength = u16::from_be_bytes([buf[after_name + 8], buf[after_name + 9]]) as usize;
    let end = fixed_end + rdlength;
    if end > buf.len() {
        return Err(ParseError::InvalidRecord);
    }
    Ok((
        ResourceRecord {
            labels,
            rtype,
            rclass,
            ttl,
            rdata: buf[fixed_end..end].to_vec(),
        },
        end,
    ))
}

fn skip_question(buf: &[u8], offset: usize) -> Result<usize, ParseError> {
    let after_name = skip_name(buf, offset)?;
    let end = after_name + 4;
    if end > buf.len() {
        return Err(ParseError::InvalidQuestion);
    }
    Ok(end)
}

/// Byte range of the question section (all questions).
pub fn question_section(buf: &[u8]) -> Result<std::ops::Range<usize>, ParseError> {
    if buf.len() < HEADER_LEN {
        return Err(ParseError::InvalidHeader);
    }
    let mut offset = HEADER_LEN;
    for _ in 0..qdcount(buf) {
        offset = skip_question(buf, offset)?;
    }
    Ok(HEADER_LEN..offset)
}

/// Smallest TTL across answer records, skipping OPT pseudo-records.
pub fn min_answer_ttl(buf: &[u8]) -> Result<Option<u32>, ParseError> {
    let mut offset = question_section(buf)?.end;
    let mut min = None;
    for _ in 0..ancount(buf) {
        let after_name = skip_name(buf, offset)?;
        let fixed_end = after_name + 10;
        if fixed_end > buf.len() {
            return Err(ParseError::InvalidRecord);
        }
        let rtype = u16::from_be_bytes([buf[after_name], buf[after_name + 1]]);
        let ttl = u32::from_be_bytes([
            buf[after_name + 4],
            buf[after_name + 5],
            buf[after_name + 6],
            buf[after_name + 7],
        ]);
        if rtype != 41 {
            min = Some(min.map_or(ttl, |m: u32| m.min(ttl)));
        }
        let rdlength = u16::from_be_bytes([buf[after_name + 8], buf[after_name + 9]]) as usize;
        offset = fixed_end + rdlength;
        if offset > buf.len() {
            return Err(ParseError::InvalidRecord);
        }
    }
    Ok(min)
}

/// Overwrite the TTL of every record in all three record sections, except
/// OPT pseudo-records whose TTL field carries EDNS flags.
pub fn rewrite_ttls(buf: &mut [u8], ttl: u32) -> Result<(), ParseError> {
    let mut offset = question_section(buf)?.end;
    let records = ancount(buf) as usize + nscount(buf) as usize + arcount(buf) as usize;
    for _ in 0..records {
        let after_name = skip_name(buf, offset)?;
        let fixed_end = after_name + 10;
        if fixed_end > buf.len() {
            return Err(ParseError::InvalidRecord);
        }
        let rtype = u16::from_be_bytes([buf[after_name], buf[after_name + 1]]);
        if rtype != 41 {
            buf[after_name + 4..after_name + 8].copy_from_slice(&ttl.to_be_bytes());
        }
        let rdlength = u16::from_be_bytes([buf[after_name + 8], buf[after_name + 9]]) as usize;
        offset = fixed_end + rdlength;
        if offset > buf.len() {
            return Err(ParseError::InvalidRecord);
        }
    }
    Ok(())
}

/// Rewrite a cached response so it answers `query`: copy the query's message
/// ID and its question section (which may differ from the cached one in
/// letter case). The cache key guarantees the names match ignoring case, so
/// the sections are the same length; anything else is a corrupt entry.
pub fn patch_reply(cached: &mut [u8], query: &[u8]) -> Result<(), ParseError> {
    set_id(cached, id(query));

    let query_range = question_section(query)?;
    let cached_range = question_section(cached)?;
    if query_range.len() != cached_range.len() {
        return Err(ParseError::InvalidQuestion);
    }
    cached[cached_range].copy_from_slice(&query[query_range]);
    Ok(())
}
