//! Per-address quality tracking: scores, timed bans, reconnect backoff.

use std::collections::HashMap;
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Mutex;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Reconnect backoff starts here and doubles per failure.
pub const BACKOFF_INITIAL: Duration = Duration::from_secs(1);
/// Backoff ceiling.
pub const BACKOFF_MAX: Duration = Duration::from_secs(5 * 60);
/// How long a chain-rule violation keeps a peer out.
pub const BAD_CHAIN_BAN_SECS: u64 = 60 * 60;

#[derive(Clone, Debug)]
pub struct BannedPeer {
    pub addr: SocketAddr,
    pub banned_until: SystemTime,
}

#[derive(Debug, Deserialize, Serialize)]
struct BanListFile {
    version: u32,
    banned: Vec<BanListEntry>,
}

#[derive(Debug, Deserialize, Serialize)]
struct BanListEntry {
    addr: SocketAddr,
    banned_until: u64,
}

const BANLIST_VERSION: u32 = 1;

#[derive(Clone, Copy)]
struct BackoffState {
    delay: Duration,
    retry_at: Instant,
}

#[derive(Default)]
pub struct PeerBook {
    scores: Mutex<HashMap<SocketAddr, i32>>,
    banned: Mutex<HashMap<SocketAddr, SystemTime>>,
    backoff: Mutex<HashMap<SocketAddr, BackoffState>>,
}

impl PeerBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// A handshake reached Ready: reward the address and reset its backoff.
    pub fn record_success(&self, addr: SocketAddr) {
        if let Ok(mut scores) = self.scores.lock() {
            let entry = scores.entry(addr).or_insert(0);
            *entry = entry.saturating_add(3);
        }
        if let Ok(mut backoff) = self.backoff.lock() {
            backoff.remove(&addr);
        }
    }

    /// A connect or handshake failed: penalise and double the backoff.
    pub fn record_failure(&self, addr: SocketAddr) {
        if let Ok(mut scores) = self.scores.lock() {
            let entry = scores.entry(addr).or_insert(0);
            *entry = entry.saturating_sub(1);
        }
        if let Ok(mut backoff) = self.backoff.lock() {
            let now = Instant::now();
            let state = backoff.entry(addr).or_insert(BackoffState {
                delay: BACKOFF_INITIAL,
                retry_at: now,
            });
            state.retry_at = now + state.delay;
            state.delay = (state.delay * 2).min(BACKOFF_MAX);
        }
    }

    /// The peer served a header that failed chain validation.
    pub fn record_bad_chain(&self, addr: SocketAddr) {
        self.record_failure(addr);
        self.ban_for(addr, BAD_CHAIN_BAN_SECS);
    }

    /// Whether the address may be dialled right now.
    pub fn may_connect(&self, addr: SocketAddr) -> bool {
        if self.is_banned(addr) {
            return false;
        }
        let Ok(backoff) = self.backoff.lock() else {
            return true;
        };
        match backoff.get(&addr) {
            Some(state) => state.retry_at <= Instant::now(),
            None => true,
        }
    }

    pub fn is_banned(&self, addr: SocketAddr) -> bool {
        let now = SystemTime::now();
        let Ok(mut banned) = self.banned.lock() else {
            return false;
        };
        if let Some(until) = banned.get(&addr).copied() {
            if until > now {
                return true;
            }
            banned.remove(&addr);
        }
        false
    }

    pub fn ban_for(&self, addr: SocketAddr, secs: u64) {
        if let Ok(mut banned) = self.banned.lock() {
            banned.insert(addr, SystemTime::now() + Duration::from_secs(secs));
        }
    }

    pub fn unban(&self, addr: SocketAddr) -> bool {
        self.banned
            .lock()
            .map(|mut banned| banned.remove(&addr).is_some())
            .unwrap_or(false)
    }

    /// Highest-scoring connectable addresses first.
    pub fn preferred(&self, limit: usize) -> Vec<SocketAddr> {
        if limit == 0 {
            return Vec::new();
        }
        let scores = match self.scores.lock() {
            Ok(scores) => scores,
            Err(_) => return Vec::new(),
        };
        let mut entries: Vec<(SocketAddr, i32)> = scores
            .iter()
            .filter(|(addr, score)| **score > 0 && !self.is_banned(**addr))
            .map(|(addr, score)| (*addr, *score))
            .collect();
        entries.sort_by(|a, b| b.1.cmp(&a.1));
        entries.truncate(limit);
        entries.into_iter().map(|(addr, _)| addr).collect()
    }

    pub fn banned_peers(&self) -> Vec<BannedPeer> {
        let now = SystemTime::now();
        let Ok(mut banned) = self.banned.lock() else {
            return Vec::new();
        };
        banned.retain(|_, until| *until > now);
        banned
            .iter()
            .map(|(addr, until)| BannedPeer {
                addr: *addr,
                banned_until: *until,
            })
            .collect()
    }

    pub fn load_banlist(&self, path: &Path) -> Result<usize, String> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(err) => return Err(err.to_string()),
        };
        let file: BanListFile =
            serde_json::from_slice(&bytes).map_err(|err| format!("invalid banlist: {err}"))?;
        if file.version != BANLIST_VERSION {
            return Err(format!(
                "unsupported banlist version {} (expected {})",
                file.version, BANLIST_VERSION
            ));
        }
        let now = SystemTime::now();
        let mut inserted = 0usize;
        if let Ok(mut banned) = self.banned.lock() {
            for entry in file.banned {
                let until = UNIX_EPOCH + Duration::from_secs(entry.banned_until);
                if until <= now {
                    continue;
                }
                banned.insert(entry.addr, until);
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    pub fn save_banlist(&self, path: &Path) -> Result<(), String> {
        let now = SystemTime::now();
        let mut entries = Vec::new();
        if let Ok(mut banned) = self.banned.lock() {
            banned.retain(|_, until| *until > now);
            for (addr, until) in banned.iter() {
                let secs = until
                    .duration_since(UNIX_EPOCH)
                    .unwrap_or_default()
                    .as_secs();
                entries.push(BanListEntry {
                    addr: *addr,
                    banned_until: secs,
                });
            }
        }
        entries.sort_by_key(|entry| entry.addr.to_string());
        let file = BanListFile {
            version: BANLIST_VERSION,
            banned: entries,
        };
        let json = serde_json::to_vec_pretty(&file).map_err(|err| err.to_string())?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| err.to_string())?;
        }
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, json).map_err(|err| err.to_string())?;
        if fs::rename(&tmp, path).is_err() {
            let _ = fs::remove_file(path);
            fs::rename(&tmp, path).map_err(|err| err.to_string())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        format!("10.0.0.1:{port}").parse().expect("addr")
    }

    #[test]
    fn backoff_doubles_and_resets() {
        let book = PeerBook::new();
        let target = addr(9333);
        assert!(book.may_connect(target));

        book.record_failure(target);
        assert!(!book.may_connect(target));
        {
            let backoff = book.backoff.lock().expect("lock");
            assert_eq!(backoff[&target].delay, BACKOFF_INITIAL * 2);
        }
        book.record_failure(target);
        {
            let backoff = book.backoff.lock().expect("lock");
            assert_eq!(backoff[&target].delay, BACKOFF_INITIAL * 4);
        }

        book.record_success(target);
        assert!(book.may_connect(target));
    }

    #[test]
    fn backoff_caps_at_maximum() {
        let book = PeerBook::new();
        let target = addr(9334);
        for _ in 0..32 {
            book.record_failure(target);
        }
        let backoff = book.backoff.lock().expect("lock");
        assert_eq!(backoff[&target].delay, BACKOFF_MAX);
    }

    #[test]
    fn bad_chain_bans_for_an_hour() {
        let book = PeerBook::new();
        let target = addr(9335);
        book.record_bad_chain(target);
        assert!(book.is_banned(target));
        assert!(!book.may_connect(target));
        let banned = book.banned_peers();
        assert_eq!(banned.len(), 1);
        assert!(banned[0].banned_until > SystemTime::now() + Duration::from_secs(3500));
        assert!(book.unban(target));
        assert!(!book.is_banned(target));
    }

    #[test]
    fn preferred_orders_by_score() {
        let book = PeerBook::new();
        let good = addr(1);
        let better = addr(2);
        let banned = addr(3);
        book.record_success(good);
        book.record_success(better);
        book.record_success(better);
        book.record_success(banned);
        book.ban_for(banned, 600);

        assert_eq!(book.preferred(10), vec![better, good]);
        assert_eq!(book.preferred(1), vec![better]);
    }

    #[test]
    fn banlist_round_trips() {
        let book = PeerBook::new();
        book.ban_for(addr(9336), 600);
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("banlist.json");
        book.save_banlist(&path).expect("save");

        let restored = PeerBook::new();
        assert_eq!(restored.load_banlist(&path).expect("load"), 1);
        assert!(restored.is_banned(addr(9336)));
    }
}
