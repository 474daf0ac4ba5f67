//! Static local records, answered before any cache or upstream work.
//! Reloaded by snapshot swap; thread-safe reads.

use crate::config::LocalRecordConfig;
use crate::dns::{RecordType, ResourceRecord};
use crate::error::{GjallarError, Result};
use arc_swap::ArcSwap;
use std::collections::HashMap;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

/// TTL stamped on locally-answered records.
pub const LOCAL_RECORD_TTL: u32 = 300;

pub fn validate_record(config: &LocalRecordConfig) -> Result<()> {
    let rtype = RecordType::parse_str(&config.rtype).ok_or_else(|| {
        GjallarError::InvalidLocalRecord(format!("{}: unknown type {}", config.name, config.rtype))
    })?;
    match rtype {
        RecordType::A => {
            config.value.parse::<Ipv4Addr>().map_err(|_| {
                GjallarError::InvalidLocalRecord(format!("{}: bad IPv4 {}", config.name, config.value))
            })?;
        }
        RecordType::AAAA => {
            config.value.parse::<Ipv6Addr>().map_err(|_| {
                GjallarError::InvalidLocalRecord(format!("{}: bad IPv6 {}", config.name, config.value))
            })?;
        }
        RecordType::CNAME | RecordType::TXT => {}
        other => {
            return Err(GjallarError::InvalidLocalRecord(format!(
                "{}: unsupported local record type {:?}",
                config.name, other
            )));
        }
    }
    Ok(())
}

fn build_record(name: &str, config: &LocalRecordConfig) -> Result<ResourceRecord> {
    validate_record(config)?;
    let rtype = RecordType::parse_str(&config.rtype)
        .ok_or_else(|| GjallarError::InvalidLocalRecord(config.rtype.clone()))?;
    let record = match rtype {
        RecordType::A => ResourceRecord::a(
            name,
            LOCAL_RECORD_TTL,
            config.value.parse().map_err(|_| {
                GjallarError::InvalidLocalRecord(config.value.clone())
            })?,
        ),
        RecordType::AAAA => ResourceRecord::aaaa(
            name,
            LOCAL_RECORD_TTL,
            config.value.parse().map_err(|_| {
                GjallarError::InvalidLocalRecord(config.value.clone())
            })?,
        ),
        RecordType::CNAME => ResourceRecord::cname(name, LOCAL_RECORD_TTL, &config.value)
            .map_err(|e| GjallarError::InvalidLocalRecord(e.to_string()))?,
        RecordType::TXT => ResourceRecord::txt(name, LOCAL_RECORD_TTL, &config.value),
        _ => unreachable!("validate_record rejects other types"),
    };
    Ok(record)
}

pub struct LocalRecords {
    snapshot: ArcSwap<HashMap<String, Vec<ResourceRecord>>>,
}

impl LocalRecords {
    pub fn new() -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(HashMap::new()),
        }
    }

    pub fn apply_config(&self, records: &[LocalRecordConfig]) -> Result<()> {
        let mut map: HashMap<String, Vec<ResourceRecord>> = HashMap::new();
        for config in records {
            let name = config.name.trim_end_matches('.').to_ascii_lowercase();
            let record = build_record(&name, config)?;
            map.entry(name).or_default().push(record);
        }
        self.snapshot.store(Arc::new(map));
        Ok(())
    }

    /// `None`: the name is not locally defined. `Some(empty)`: the name
    /// exists but has no records of this type (answered as NODATA). A CNAME
    /// satisfies any query type.
    pub fn lookup(&self, name: &str, qtype: RecordType) -> Option<Vec<ResourceRecord>> {
        let snapshot = self.snapshot.load();
        let records = snapshot.get(name)?;

        let matching: Vec<ResourceRecord> = records
            .iter()
            .filter(|r| r.rtype == qtype)
            .cloned()
            .collect();
        if !matching.is_empty() {
            return Some(matching);
        }

        let cnames: Vec<ResourceRecord> = records
            .iter()
            .filter(|r| r.rtype == RecordType::CNAME)
            .cloned()
            .collect();
        Some(cnames)
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot.load().is_empty()
    }
}

impl Default for LocalRecords {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(name: &str, rtype: &str, value: &str) -> LocalRecordConfig {
        LocalRecordConfig {
            name: name.to_string(),
            rtype: rtype.to_string(),
            value: value.to_string(),
        }
    }

    #[test]
    fn lookup_by_type() {
        let records = LocalRecords::new();
        records
            .apply_config(&[
                record("nas.home", "A", "192.168.1.10"),
                record("nas.home", "AAAA", "fd00::10"),
                record("info.home", "TXT", "hello"),
            ])
            .unwrap();

        let a = records.lookup("nas.home", RecordType::A).unwrap();
        assert_eq!(a.len(), 1);
        assert_eq!(a[0].rdata, vec![192, 168, 1, 10]);

        let aaaa = records.lookup("nas.home", RecordType::AAAA).unwrap();
        assert_eq!(aaaa.len(), 1);

        // Defined name, missing type: NODATA, not a miss.
        assert_eq!(records.lookup("info.home", RecordType::A).unwrap().len(), 0);
        assert!(records.lookup("unknown.home", RecordType::A).is_none());
    }

    #[test]
    fn cname_answers_any_type() {
        let records = LocalRecords::new();
        records
            .apply_config(&[record("alias.home", "CNAME", "nas.home")])
            .unwrap();

        let for_a = records.lookup("alias.home", RecordType::A).unwrap();
        assert_eq!(for_a.len(), 1);
        assert_eq!(for_a[0].rtype, RecordType::CNAME);
    }

    #[test]
    fn names_are_normalized() {
        let records = LocalRecords::new();
        records
            .apply_config(&[record("NAS.Home.", "A", "192.168.1.10")])
            .unwrap();
        assert!(records.lookup("nas.home", RecordType::A).is_some());
    }

    #[test]
    fn invalid_records_are_rejected() {
        assert!(validate_record(&record("x.home", "A", "not-an-ip")).is_err());
        assert!(validate_record(&record("x.home", "MX", "10 mail.home")).is_err());
        assert!(validate_record(&record("x.home", "AAAA", "192.168.1.1")).is_err());
        assert!(validate_record(&record("x.home", "TXT", "anything")).is_ok());
    }
}
