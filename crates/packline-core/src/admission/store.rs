//! Ban store and admission decision.
//!
//! Holds the whitelist, the active ban map, and the ordered criterion
//! chain. The criterion list is mutable only until the first
//! [`AdmissionStore::check`]; the store locks itself at that point and
//! later registration attempts fail, so the chain is an immutable snapshot
//! for the listener's whole lifetime.

use std::{
    collections::{HashMap, HashSet},
    net::IpAddr,
    sync::{
        Arc, RwLock,
        atomic::{AtomicBool, Ordering},
    },
};

use crate::{admission::AdmissionCriterion, error::AdmissionError};

/// Default ban duration in minutes.
pub const DEFAULT_BAN_MINUTES: u64 = 15;

/// An active ban.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BanRecord {
    /// Unix milliseconds when the ban lapses
    pub expires_at_ms: i64,
    /// True for operator bans, false for criterion-imposed ones
    pub explicit: bool,
}

/// A parsed whitelist entry: one address or a CIDR block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WhitelistEntry {
    Exact(IpAddr),
    Cidr { network: IpAddr, prefix: u8 },
}

impl WhitelistEntry {
    /// Parse dotted IPv4, bracketed or plain IPv6, or CIDR notation.
    fn parse(input: &str) -> Result<Self, AdmissionError> {
        let trimmed = input.trim();
        let invalid = || AdmissionError::InvalidAddress(input.to_owned());

        let (addr_part, prefix_part) = match trimmed.split_once('/') {
            Some((addr, prefix)) => (addr, Some(prefix)),
            None => (trimmed, None),
        };

        let addr_part = addr_part.strip_prefix('[').map_or(addr_part, |rest| {
            rest.strip_suffix(']').unwrap_or(rest)
        });
        let addr: IpAddr = addr_part.parse().map_err(|_| invalid())?;

        match prefix_part {
            None => Ok(Self::Exact(addr)),
            Some(prefix) => {
                let prefix: u8 = prefix.parse().map_err(|_| invalid())?;
                let max = if addr.is_ipv4() { 32 } else { 128 };
                if prefix > max {
                    return Err(invalid());
                }
                Ok(Self::Cidr { network: addr, prefix })
            },
        }
    }

    fn matches(&self, addr: IpAddr) -> bool {
        match *self {
            Self::Exact(entry) => entry == addr,
            Self::Cidr { network, prefix } => match (network, addr) {
                (IpAddr::V4(net), IpAddr::V4(addr)) => {
                    prefix_matches(&net.octets(), &addr.octets(), prefix)
                },
                (IpAddr::V6(net), IpAddr::V6(addr)) => {
                    prefix_matches(&net.octets(), &addr.octets(), prefix)
                },
                _ => false,
            },
        }
    }
}

/// Compare the leading `prefix` bits of two addresses.
fn prefix_matches(network: &[u8], addr: &[u8], prefix: u8) -> bool {
    let full_bytes = (prefix / 8) as usize;
    let tail_bits = prefix % 8;

    if network[..full_bytes] != addr[..full_bytes] {
        return false;
    }
    if tail_bits == 0 {
        return true;
    }

    let mask = !(0xFFu8 >> tail_bits);
    (network[full_bytes] & mask) == (addr[full_bytes] & mask)
}

/// IP admission store: whitelist, ban map, and criterion chain.
///
/// All operations are concurrency-safe. Ban-map reads take a shared lock;
/// the criterion list is snapshot-copied out of its lock before any
/// criterion is awaited, so no lock is ever held across a suspension point.
pub struct AdmissionStore {
    whitelist: RwLock<Vec<WhitelistEntry>>,
    whitelist_exact: RwLock<HashSet<IpAddr>>,
    bans: RwLock<HashMap<IpAddr, BanRecord>>,
    criteria: RwLock<Vec<Arc<dyn AdmissionCriterion>>>,
    locked: AtomicBool,
    ban_ms: i64,
}

impl AdmissionStore {
    /// Create a store with the given default ban duration.
    #[must_use]
    pub fn new(ban_minutes: u64) -> Self {
        Self {
            whitelist: RwLock::new(Vec::new()),
            whitelist_exact: RwLock::new(HashSet::new()),
            bans: RwLock::new(HashMap::new()),
            criteria: RwLock::new(Vec::new()),
            locked: AtomicBool::new(false),
            ban_ms: (ban_minutes * 60 * 1_000) as i64,
        }
    }

    /// True once the first `check` has locked the configuration.
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Acquire)
    }

    /// Append a criterion to the chain.
    ///
    /// # Errors
    ///
    /// - [`AdmissionError::Locked`] after the first `check`. This is a
    ///   startup ordering bug and should be treated as fatal.
    pub fn register_criterion(
        &self,
        criterion: Arc<dyn AdmissionCriterion>,
    ) -> Result<(), AdmissionError> {
        if self.is_locked() {
            return Err(AdmissionError::Locked);
        }

        let Ok(mut criteria) = self.criteria.write() else {
            return Err(AdmissionError::Locked);
        };
        criteria.push(criterion);
        Ok(())
    }

    /// Add an address or CIDR block to the whitelist.
    ///
    /// Accepts dotted IPv4 (`10.0.0.1`), bracketed or plain IPv6
    /// (`[::1]`), and CIDR notation (`10.0.0.0/8`). Resolution is eager:
    /// parse failure is a configuration error.
    pub fn add_to_whitelist(&self, input: &str) -> Result<(), AdmissionError> {
        let entry = WhitelistEntry::parse(input)?;

        if let WhitelistEntry::Exact(addr) = entry {
            if let Ok(mut exact) = self.whitelist_exact.write() {
                exact.insert(addr);
            }
            return Ok(());
        }

        if let Ok(mut whitelist) = self.whitelist.write() {
            whitelist.push(entry);
        }
        Ok(())
    }

    /// True if the address is whitelisted (exact entry or CIDR match).
    #[must_use]
    pub fn is_whitelisted(&self, addr: IpAddr) -> bool {
        if self.whitelist_exact.read().is_ok_and(|exact| exact.contains(&addr)) {
            return true;
        }
        self.whitelist
            .read()
            .is_ok_and(|entries| entries.iter().any(|entry| entry.matches(addr)))
    }

    /// Admission decision for one request from `addr`.
    ///
    /// Whitelisted addresses short-circuit every other rule. Otherwise each
    /// criterion judges the request in registration order; the first
    /// violation bans the address for the default duration and stops the
    /// chain. Finally the ban map is consulted.
    ///
    /// The first call locks the store: criterion registration fails from
    /// here on.
    ///
    /// # Errors
    ///
    /// - [`AdmissionError::Forbidden`] when the address is actively banned.
    pub async fn check(&self, addr: IpAddr, now_ms: i64) -> Result<(), AdmissionError> {
        self.locked.store(true, Ordering::Release);

        if self.is_whitelisted(addr) {
            return Ok(());
        }

        // Snapshot so no lock is held across the awaits below.
        let criteria: Vec<Arc<dyn AdmissionCriterion>> = match self.criteria.read() {
            Ok(list) => list.clone(),
            Err(_) => Vec::new(),
        };

        for criterion in criteria {
            if criterion.validate(addr, now_ms).await {
                self.try_ban(addr, false, None, now_ms);
                break;
            }
        }

        let banned = self
            .bans
            .read()
            .is_ok_and(|bans| bans.get(&addr).is_some_and(|ban| ban.expires_at_ms > now_ms));

        if banned { Err(AdmissionError::Forbidden(addr)) } else { Ok(()) }
    }

    /// Upsert a ban record.
    ///
    /// `until_ms` defaults to `now + ban_time`. Whitelisted addresses are
    /// never banned; returns whether a record was written.
    pub fn try_ban(&self, addr: IpAddr, explicit: bool, until_ms: Option<i64>, now_ms: i64) -> bool {
        if self.is_whitelisted(addr) {
            return false;
        }

        let record =
            BanRecord { expires_at_ms: until_ms.unwrap_or(now_ms + self.ban_ms), explicit };

        match self.bans.write() {
            Ok(mut bans) => {
                bans.insert(addr, record);
                true
            },
            Err(_) => false,
        }
    }

    /// Remove a ban and clear the address from every criterion.
    ///
    /// Returns whether a record existed.
    pub fn try_unban(&self, addr: IpAddr) -> bool {
        let removed = self.bans.write().is_ok_and(|mut bans| bans.remove(&addr).is_some());

        if let Ok(criteria) = self.criteria.read() {
            for criterion in criteria.iter() {
                criterion.clear(addr);
            }
        }

        removed
    }

    /// Drop expired bans and stale criterion state.
    ///
    /// Idempotent when nothing has expired since the prior call.
    pub fn purge(&self, now_ms: i64) -> usize {
        let purged = match self.bans.write() {
            Ok(mut bans) => {
                let before = bans.len();
                bans.retain(|_, ban| ban.expires_at_ms > now_ms);
                before - bans.len()
            },
            Err(_) => 0,
        };

        if let Ok(criteria) = self.criteria.read() {
            for criterion in criteria.iter() {
                criterion.purge_stale(now_ms);
            }
        }

        purged
    }

    /// Active ban for `addr`, if one exists and has not lapsed.
    #[must_use]
    pub fn active_ban(&self, addr: IpAddr, now_ms: i64) -> Option<BanRecord> {
        self.bans
            .read()
            .ok()
            .and_then(|bans| bans.get(&addr).copied())
            .filter(|ban| ban.expires_at_ms > now_ms)
    }

    /// Number of ban records, including lapsed ones awaiting purge.
    #[must_use]
    pub fn ban_count(&self) -> usize {
        self.bans.read().map(|bans| bans.len()).unwrap_or(0)
    }
}

impl std::fmt::Debug for AdmissionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionStore")
            .field("locked", &self.is_locked())
            .field("ban_count", &self.ban_count())
            .finish_non_exhaustive()
    }
}
