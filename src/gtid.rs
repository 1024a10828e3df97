//! MariaDB GTID 관리
//!
//! GTID 형식: domain-server-sequence (예: "0-1-100")
//! GTID 목록: 도메인마다 최대 하나씩, 쉼표로 구분 ("0-1-100,1-2-7")

use crate::error::{ReplicationError, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

fn gtid_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^(\d+)-(\d+)-(\d+)$").expect("GTID pattern is a valid regex")
    })
}

/// 단일 MariaDB GTID
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Gtid {
    pub domain_id: u32,
    pub server_id: u32,
    pub sequence: u64,
}

impl Gtid {
    pub fn new(domain_id: u32, server_id: u32, sequence: u64) -> Self {
        Gtid {
            domain_id,
            server_id,
            sequence,
        }
    }
}

impl FromStr for Gtid {
    type Err = ReplicationError;

    fn from_str(s: &str) -> Result<Self> {
        let caps = gtid_pattern()
            .captures(s.trim())
            .ok_or_else(|| ReplicationError::Gtid(format!("Invalid GTID format: {}", s)))?;

        let field = |i: usize| -> &str { caps.get(i).map(|m| m.as_str()).unwrap_or_default() };
        let overflow = |_| ReplicationError::Gtid(format!("GTID component out of range: {}", s));

        Ok(Gtid {
            domain_id: field(1).parse().map_err(overflow)?,
            server_id: field(2).parse().map_err(overflow)?,
            sequence: field(3).parse().map_err(overflow)?,
        })
    }
}

impl fmt::Display for Gtid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{}", self.domain_id, self.server_id, self.sequence)
    }
}

/// `@slave_connect_state`에 넘기는 GTID 목록
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GtidList {
    domains: BTreeMap<u32, Gtid>,
}

impl GtidList {
    pub fn new() -> Self {
        GtidList::default()
    }

    /// 쉼표로 구분된 목록 파싱. 같은 도메인이 두 번 나오면 에러
    pub fn parse(s: &str) -> Result<Self> {
        let mut list = GtidList::new();
        for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let gtid: Gtid = part.parse()?;
            if list.domains.contains_key(&gtid.domain_id) {
                return Err(ReplicationError::Gtid(format!(
                    "Duplicate domain {} in GTID list: {}",
                    gtid.domain_id, s
                )));
            }
            list.domains.insert(gtid.domain_id, gtid);
        }
        Ok(list)
    }

    /// 같은 도메인의 GTID는 교체
    pub fn update(&mut self, gtid: Gtid) {
        self.domains.insert(gtid.domain_id, gtid);
    }

    pub fn get(&self, domain_id: u32) -> Option<&Gtid> {
        self.domains.get(&domain_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Gtid> {
        self.domains.values()
    }

    pub fn is_empty(&self) -> bool {
        self.domains.is_empty()
    }
}

impl From<Gtid> for GtidList {
    fn from(gtid: Gtid) -> Self {
        let mut list = GtidList::new();
        list.update(gtid);
        list
    }
}

impl fmt::Display for GtidList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, gtid) in self.domains.values().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{}", gtid)?;
        }
        Ok(())
    }
}
