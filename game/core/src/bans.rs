//! The ban list: addresses refused at the accept filter and usernames
//! refused at the handshake. State lives in memory and persists through the
//! provider's settings store, so bans survive restarts wherever the
//! provider does.

use ember::logging::{self, Logger};
use ember::store::DataProvider;
use hashbrown::HashSet;
use parking_lot::RwLock;
use std::net::IpAddr;
use std::sync::Arc;

const IP_KEY: &str = "banned_ips";
const NAME_KEY: &str = "banned_names";

pub struct BanList {
    data: Arc<dyn DataProvider>,
    ips: RwLock<HashSet<IpAddr>>,
    /// Stored lowercased; lookups are case-insensitive.
    names: RwLock<HashSet<String>>,
    log: Logger,
}

impl BanList {
    /// Loads the persisted lists. Unparseable entries are dropped with a
    /// warning rather than poisoning the rest.
    pub fn load(data: Arc<dyn DataProvider>, log: Logger) -> BanList {
        let mut ips = HashSet::new();
        if let Ok(Some(stored)) = data.get_setting(IP_KEY) {
            for entry in stored.split(',').filter(|e| !e.is_empty()) {
                match entry.parse::<IpAddr>() {
                    Ok(ip) => {
                        ips.insert(ip);
                    }
                    Err(_) => {
                        logging::warn!(log, "dropping malformed banned ip"; "entry" => entry);
                    }
                }
            }
        }

        let mut names = HashSet::new();
        if let Ok(Some(stored)) = data.get_setting(NAME_KEY) {
            for entry in stored.split(',').filter(|e| !e.is_empty()) {
                names.insert(entry.to_ascii_lowercase());
            }
        }

        BanList {
            data,
            ips: RwLock::new(ips),
            names: RwLock::new(names),
            log,
        }
    }

    #[inline]
    pub fn is_ip_banned(&self, ip: &IpAddr) -> bool {
        self.ips.read().contains(ip)
    }

    #[inline]
    pub fn is_name_banned(&self, name: &str) -> bool {
        self.names.read().contains(&name.to_ascii_lowercase())
    }

    /// Bans an address. Returns false when it already was.
    pub fn ban_ip(&self, ip: IpAddr) -> bool {
        let inserted = self.ips.write().insert(ip);
        if inserted {
            logging::info!(self.log, "address banned"; "ip" => %ip);
            self.persist_ips();
        }
        inserted
    }

    /// Lifts an address ban. Returns false when it was not banned.
    pub fn pardon_ip(&self, ip: &IpAddr) -> bool {
        let removed = self.ips.write().remove(ip);
        if removed {
            logging::info!(self.log, "address pardoned"; "ip" => %ip);
            self.persist_ips();
        }
        removed
    }

    /// Bans a username, case-insensitively. Returns false when it already
    /// was.
    pub fn ban_name(&self, name: &str) -> bool {
        let inserted = self.names.write().insert(name.to_ascii_lowercase());
        if inserted {
            logging::info!(self.log, "username banned"; "username" => name);
            self.persist_names();
        }
        inserted
    }

    /// Lifts a username ban. Returns false when it was not banned.
    pub fn pardon_name(&self, name: &str) -> bool {
        let removed = self.names.write().remove(&name.to_ascii_lowercase());
        if removed {
            logging::info!(self.log, "username pardoned"; "username" => name);
            self.persist_names();
        }
        removed
    }

    pub fn ip_count(&self) -> usize {
        self.ips.read().len()
    }

    pub fn name_count(&self) -> usize {
        self.names.read().len()
    }

    // Persistence failures keep the in-memory state; the next mutation
    // retries the write.

    fn persist_ips(&self) {
        let joined = self
            .ips
            .read()
            .iter()
            .map(|ip| ip.to_string())
            .collect::<Vec<_>>()
            .join(",");
        if let Err(err) = self.data.set_setting(IP_KEY, &joined) {
            logging::warn!(self.log, "failed to persist ip bans"; "error" => %err);
        }
    }

    fn persist_names(&self) {
        let joined = self
            .names
            .read()
            .iter()
            .cloned()
            .collect::<Vec<_>>()
            .join(",");
        if let Err(err) = self.data.set_setting(NAME_KEY, &joined) {
            logging::warn!(self.log, "failed to persist name bans"; "error" => %err);
        }
    }
}
