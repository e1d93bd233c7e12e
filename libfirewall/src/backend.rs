use std::collections::HashMap;
use std::sync::Mutex;

use log::debug;

use crate::error::FirewallError;
use crate::rule::{IpVersion, Rule, Table};

/// Ordered chain/rule storage behind iptables semantics.
///
/// The driver is the single writer; every mutation in the process funnels
/// through one shared backend instance. Duplicate appends/inserts are
/// no-ops, `delete` of an absent rule is an error, `delete_if_exists` is
/// not.
pub trait RuleBackend: Send + Sync {
    fn ensure_chain(&self, ipv: IpVersion, table: Table, chain: &str) -> Result<(), FirewallError>;

    fn append(&self, rule: &Rule) -> Result<(), FirewallError>;

    /// Insert at `pos` (1-based, iptables convention) unless present.
    fn insert(&self, rule: &Rule, pos: usize) -> Result<(), FirewallError>;

    fn delete(&self, rule: &Rule) -> Result<(), FirewallError>;

    fn delete_if_exists(&self, rule: &Rule) -> Result<(), FirewallError>;

    fn exists(&self, rule: &Rule) -> Result<bool, FirewallError>;

    fn flush_chain(&self, ipv: IpVersion, table: Table, chain: &str) -> Result<(), FirewallError>;

    fn delete_chain(&self, ipv: IpVersion, table: Table, chain: &str) -> Result<(), FirewallError>;

    fn list(&self, ipv: IpVersion, table: Table, chain: &str) -> Result<Vec<String>, FirewallError>;
}

/// Backend that forks the iptables/ip6tables binaries.
pub struct IptablesBackend {
    v4: iptables::IPTables,
    v6: iptables::IPTables,
    // iptables itself takes the xtables lock; this one keeps our own
    // check-then-act sequences atomic.
    write_lock: Mutex<()>,
}

impl IptablesBackend {
    pub fn new() -> Result<Self, FirewallError> {
        let v4 = iptables::new(false).map_err(|e| FirewallError::Command(e.to_string()))?;
        let v6 = iptables::new(true).map_err(|e| FirewallError::Command(e.to_string()))?;
        Ok(IptablesBackend {
            v4,
            v6,
            write_lock: Mutex::new(()),
        })
    }

    fn conn(&self, ipv: IpVersion) -> &iptables::IPTables {
        match ipv {
            IpVersion::V4 => &self.v4,
            IpVersion::V6 => &self.v6,
        }
    }
}

impl RuleBackend for IptablesBackend {
    fn ensure_chain(&self, ipv: IpVersion, table: Table, chain: &str) -> Result<(), FirewallError> {
        let _guard = self.write_lock.lock().unwrap();
        let conn = self.conn(ipv);
        // Listing chains and scanning beats the crate's chain existence
        // check, which forks once per probe.
        let chains = conn
            .list_chains(table.as_str())
            .map_err(|e| FirewallError::Command(e.to_string()))?;
        if chains.iter().any(|c| c == chain) {
            return Ok(());
        }
        conn.new_chain(table.as_str(), chain)
            .map(|_| debug!("created chain {chain} in table {table}"))
            .map_err(|e| FirewallError::Command(e.to_string()))
    }

    fn append(&self, rule: &Rule) -> Result<(), FirewallError> {
        let _guard = self.write_lock.lock().unwrap();
        let conn = self.conn(rule.ipv);
        let spec = rule.spec();
        let exists = conn
            .exists(rule.table.as_str(), &rule.chain, &spec)
            .map_err(|e| FirewallError::Command(e.to_string()))?;
        if exists {
            return Ok(());
        }
        conn.append(rule.table.as_str(), &rule.chain, &spec)
            .map(|_| debug!("appended {rule}"))
            .map_err(|e| FirewallError::Command(e.to_string()))
    }

    fn insert(&self, rule: &Rule, pos: usize) -> Result<(), FirewallError> {
        let _guard = self.write_lock.lock().unwrap();
        let conn = self.conn(rule.ipv);
        let spec = rule.spec();
        let exists = conn
            .exists(rule.table.as_str(), &rule.chain, &spec)
            .map_err(|e| FirewallError::Command(e.to_string()))?;
        if exists {
            return Ok(());
        }
        conn.insert(rule.table.as_str(), &rule.chain, &spec, pos as i32)
            .map(|_| debug!("inserted {rule} at {pos}"))
            .map_err(|e| FirewallError::Command(e.to_string()))
    }

    fn delete(&self, rule: &Rule) -> Result<(), FirewallError> {
        let _guard = self.write_lock.lock().unwrap();
        let conn = self.conn(rule.ipv);
        let spec = rule.spec();
        let exists = conn
            .exists(rule.table.as_str(), &rule.chain, &spec)
            .map_err(|e| FirewallError::Command(e.to_string()))?;
        if !exists {
            return Err(FirewallError::RuleMissing(rule.to_string()));
        }
        conn.delete(rule.table.as_str(), &rule.chain, &spec)
            .map_err(|e| FirewallError::Command(e.to_string()))
    }

    fn delete_if_exists(&self, rule: &Rule) -> Result<(), FirewallError> {
        match self.delete(rule) {
            Ok(()) | Err(FirewallError::RuleMissing(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn exists(&self, rule: &Rule) -> Result<bool, FirewallError> {
        self.conn(rule.ipv)
            .exists(rule.table.as_str(), &rule.chain, &rule.spec())
            .map_err(|e| FirewallError::Command(e.to_string()))
    }

    fn flush_chain(&self, ipv: IpVersion, table: Table, chain: &str) -> Result<(), FirewallError> {
        let _guard = self.write_lock.lock().unwrap();
        self.conn(ipv)
            .flush_chain(table.as_str(), chain)
            .map_err(|e| FirewallError::Command(e.to_string()))
    }

    fn delete_chain(&self, ipv: IpVersion, table: Table, chain: &str) -> Result<(), FirewallError> {
        let _guard = self.write_lock.lock().unwrap();
        let conn = self.conn(ipv);
        let chains = conn
            .list_chains(table.as_str())
            .map_err(|e| FirewallError::Command(e.to_string()))?;
        if !chains.iter().any(|c| c == chain) {
            return Ok(());
        }
        conn.flush_chain(table.as_str(), chain)
            .map_err(|e| FirewallError::Command(e.to_string()))?;
        conn.delete_chain(table.as_str(), chain)
            .map_err(|e| FirewallError::Command(e.to_string()))
    }

    fn list(&self, ipv: IpVersion, table: Table, chain: &str) -> Result<Vec<String>, FirewallError> {
        self.conn(ipv)
            .list(table.as_str(), chain)
            .map_err(|e| FirewallError::Command(e.to_string()))
    }
}

/// In-memory backend with the same semantics, for tests and for asserting
/// rule composition without forking anything.
#[derive(Debug)]
pub struct MemoryBackend {
    state: Mutex<HashMap<(IpVersion, Table), HashMap<String, Vec<Rule>>>>,
}

const BUILTINS: &[(Table, &[&str])] = &[
    (Table::Filter, &["INPUT", "FORWARD", "OUTPUT"]),
    (Table::Nat, &["PREROUTING", "INPUT", "OUTPUT", "POSTROUTING"]),
    (
        Table::Mangle,
        &["PREROUTING", "INPUT", "FORWARD", "OUTPUT", "POSTROUTING"],
    ),
    (Table::Raw, &["PREROUTING", "OUTPUT"]),
];

fn builtin_tables() -> HashMap<(IpVersion, Table), HashMap<String, Vec<Rule>>> {
    let mut state = HashMap::new();
    for ipv in [IpVersion::V4, IpVersion::V6] {
        for (table, chains) in BUILTINS {
            let chains: HashMap<String, Vec<Rule>> = chains
                .iter()
                .map(|c| (c.to_string(), Vec::new()))
                .collect();
            state.insert((ipv, *table), chains);
        }
    }
    state
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        MemoryBackend {
            state: Mutex::new(builtin_tables()),
        }
    }

    /// What an external `iptables -F` plus chain deletion does: every rule
    /// gone, user chains gone, builtins empty.
    pub fn simulate_external_flush(&self) {
        *self.state.lock().unwrap() = builtin_tables();
    }

    /// Rendered argument vectors of `chain`, in order.
    pub fn rules(&self, ipv: IpVersion, table: Table, chain: &str) -> Vec<String> {
        let state = self.state.lock().unwrap();
        state
            .get(&(ipv, table))
            .and_then(|chains| chains.get(chain))
            .map(|rules| rules.iter().map(|r| r.spec()).collect())
            .unwrap_or_default()
    }

    pub fn chain_exists(&self, ipv: IpVersion, table: Table, chain: &str) -> bool {
        let state = self.state.lock().unwrap();
        state
            .get(&(ipv, table))
            .is_some_and(|chains| chains.contains_key(chain))
    }
}

impl RuleBackend for MemoryBackend {
    fn ensure_chain(&self, ipv: IpVersion, table: Table, chain: &str) -> Result<(), FirewallError> {
        let mut state = self.state.lock().unwrap();
        state
            .entry((ipv, table))
            .or_default()
            .entry(chain.to_string())
            .or_default();
        Ok(())
    }

    fn append(&self, rule: &Rule) -> Result<(), FirewallError> {
        let mut state = self.state.lock().unwrap();
        let chains = state.entry((rule.ipv, rule.table)).or_default();
        let rules = chains
            .get_mut(&rule.chain)
            .ok_or_else(|| FirewallError::ChainMissing(rule.chain.clone(), rule.table.to_string()))?;
        if !rules.contains(rule) {
            rules.push(rule.clone());
        }
        Ok(())
    }

    fn insert(&self, rule: &Rule, pos: usize) -> Result<(), FirewallError> {
        let mut state = self.state.lock().unwrap();
        let chains = state.entry((rule.ipv, rule.table)).or_default();
        let rules = chains
            .get_mut(&rule.chain)
            .ok_or_else(|| FirewallError::ChainMissing(rule.chain.clone(), rule.table.to_string()))?;
        if !rules.contains(rule) {
            let idx = pos.saturating_sub(1).min(rules.len());
            rules.insert(idx, rule.clone());
        }
        Ok(())
    }

    fn delete(&self, rule: &Rule) -> Result<(), FirewallError> {
        let mut state = self.state.lock().unwrap();
        let rules = state
            .get_mut(&(rule.ipv, rule.table))
            .and_then(|chains| chains.get_mut(&rule.chain))
            .ok_or_else(|| FirewallError::ChainMissing(rule.chain.clone(), rule.table.to_string()))?;
        let before = rules.len();
        rules.retain(|r| r != rule);
        if rules.len() == before {
            return Err(FirewallError::RuleMissing(rule.to_string()));
        }
        Ok(())
    }

    fn delete_if_exists(&self, rule: &Rule) -> Result<(), FirewallError> {
        match self.delete(rule) {
            Ok(()) | Err(FirewallError::RuleMissing(_)) | Err(FirewallError::ChainMissing(_, _)) => {
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn exists(&self, rule: &Rule) -> Result<bool, FirewallError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .get(&(rule.ipv, rule.table))
            .and_then(|chains| chains.get(&rule.chain))
            .is_some_and(|rules| rules.contains(rule)))
    }

    fn flush_chain(&self, ipv: IpVersion, table: Table, chain: &str) -> Result<(), FirewallError> {
        let mut state = self.state.lock().unwrap();
        let rules = state
            .get_mut(&(ipv, table))
            .and_then(|chains| chains.get_mut(chain))
            .ok_or_else(|| FirewallError::ChainMissing(chain.to_string(), table.to_string()))?;
        rules.clear();
        Ok(())
    }

    fn delete_chain(&self, ipv: IpVersion, table: Table, chain: &str) -> Result<(), FirewallError> {
        let mut state = self.state.lock().unwrap();
        if let Some(chains) = state.get_mut(&(ipv, table)) {
            chains.remove(chain);
        }
        Ok(())
    }

    fn list(&self, ipv: IpVersion, table: Table, chain: &str) -> Result<Vec<String>, FirewallError> {
        let state = self.state.lock().unwrap();
        let rules = state
            .get(&(ipv, table))
            .and_then(|chains| chains.get(chain))
            .ok_or_else(|| FirewallError::ChainMissing(chain.to_string(), table.to_string()))?;
        Ok(rules.iter().map(|r| r.spec()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn masq_rule() -> Rule {
        Rule::new(
            IpVersion::V4,
            Table::Nat,
            "POSTROUTING",
            ["-s", "172.17.0.0/16", "!", "-o", "docker0", "-j", "MASQUERADE"],
        )
    }

    #[test]
    fn test_duplicate_append_is_noop() {
        let backend = MemoryBackend::new();
        backend.append(&masq_rule()).unwrap();
        backend.append(&masq_rule()).unwrap();
        assert_eq!(
            backend.rules(IpVersion::V4, Table::Nat, "POSTROUTING"),
            vec!["-s 172.17.0.0/16 ! -o docker0 -j MASQUERADE"]
        );
    }

    #[test]
    fn test_delete_absent_rule_is_error() {
        let backend = MemoryBackend::new();
        assert!(matches!(
            backend.delete(&masq_rule()).unwrap_err(),
            FirewallError::RuleMissing(_)
        ));
        backend.delete_if_exists(&masq_rule()).unwrap();
    }

    #[test]
    fn test_append_to_missing_chain_is_error() {
        let backend = MemoryBackend::new();
        let rule = Rule::new(IpVersion::V4, Table::Filter, "DOCKER-FORWARD", ["-j", "ACCEPT"]);
        assert!(matches!(
            backend.append(&rule).unwrap_err(),
            FirewallError::ChainMissing(_, _)
        ));
        backend
            .ensure_chain(IpVersion::V4, Table::Filter, "DOCKER-FORWARD")
            .unwrap();
        backend.append(&rule).unwrap();
    }

    #[test]
    fn test_insert_orders_before_append() {
        let backend = MemoryBackend::new();
        let accept = Rule::new(IpVersion::V4, Table::Filter, "FORWARD", ["-j", "ACCEPT"]);
        let jump = Rule::new(IpVersion::V4, Table::Filter, "FORWARD", ["-j", "DOCKER-FORWARD"]);
        backend.append(&accept).unwrap();
        backend.insert(&jump, 1).unwrap();
        assert_eq!(
            backend.rules(IpVersion::V4, Table::Filter, "FORWARD"),
            vec!["-j DOCKER-FORWARD", "-j ACCEPT"]
        );
    }

    #[test]
    fn test_external_flush_clears_user_chains() {
        let backend = MemoryBackend::new();
        backend
            .ensure_chain(IpVersion::V4, Table::Filter, "DOCKER")
            .unwrap();
        backend.append(&masq_rule()).unwrap();
        backend.simulate_external_flush();
        assert!(!backend.chain_exists(IpVersion::V4, Table::Filter, "DOCKER"));
        assert!(backend
            .rules(IpVersion::V4, Table::Nat, "POSTROUTING")
            .is_empty());
    }
}
