//! iptables access.
//!
//! Rules are plain argument vectors as given to `iptables -A`, without the
//! table and chain.

use std::collections::HashMap;
use std::process::Command;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tracing::debug;

use crate::config::IpVersion;

#[derive(Debug, Error)]
pub enum FirewallError {
    #[error("{0}: already exists")]
    AlreadyExists(String),
    #[error("{0}: not found")]
    NotFound(String),
    #[error("`{command}` failed: {stderr}")]
    Command { command: String, stderr: String },
    #[error("failed to run `{command}`: {source}")]
    Spawn {
        command: String,
        source: std::io::Error,
    },
}

impl FirewallError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, FirewallError::NotFound(_))
    }
}

pub trait Firewall: Send + Sync {
    fn chain_exists(&self, v: IpVersion, table: &str, chain: &str) -> Result<bool, FirewallError>;
    fn new_chain(&self, v: IpVersion, table: &str, chain: &str) -> Result<(), FirewallError>;
    /// Flush and remove a chain. Fails with `NotFound` if it is absent.
    fn delete_chain(&self, v: IpVersion, table: &str, chain: &str) -> Result<(), FirewallError>;

    fn exists(
        &self,
        v: IpVersion,
        table: &str,
        chain: &str,
        rule: &[String],
    ) -> Result<bool, FirewallError>;
    fn append(&self, v: IpVersion, table: &str, chain: &str, rule: &[String])
        -> Result<(), FirewallError>;
    fn delete(&self, v: IpVersion, table: &str, chain: &str, rule: &[String])
        -> Result<(), FirewallError>;

    /// Jump target of each rule in `chain`, in rule order.
    fn list_targets(
        &self,
        v: IpVersion,
        table: &str,
        chain: &str,
    ) -> Result<Vec<String>, FirewallError>;
    /// Delete rule number `num` (1-based).
    fn delete_at(&self, v: IpVersion, table: &str, chain: &str, num: usize)
        -> Result<(), FirewallError>;

    fn append_unique(
        &self,
        v: IpVersion,
        table: &str,
        chain: &str,
        rule: &[String],
    ) -> Result<(), FirewallError> {
        if self.exists(v, table, chain, rule)? {
            return Ok(());
        }
        self.append(v, table, chain, rule)
    }
}

/// Build a rule from string slices.
pub fn rule(args: &[&str]) -> Vec<String> {
    args.iter().map(|a| a.to_string()).collect()
}

/// [`Firewall`] driving `iptables`/`ip6tables`, waiting for the xtables lock.
#[derive(Debug, Clone, Default)]
pub struct IptablesCommand;

impl IptablesCommand {
    pub fn new() -> Self {
        Self
    }

    fn program(v: IpVersion) -> &'static str {
        match v {
            IpVersion::V4 => "iptables",
            IpVersion::V6 => "ip6tables",
        }
    }

    fn output(&self, v: IpVersion, args: &[&str]) -> Result<(String, std::process::Output), FirewallError> {
        let program = Self::program(v);
        let command = format!("{} -w {}", program, args.join(" "));
        debug!("{}", command);
        let output = Command::new(program)
            .arg("-w")
            .args(args)
            .output()
            .map_err(|source| FirewallError::Spawn {
                command: command.clone(),
                source,
            })?;
        Ok((command, output))
    }

    fn run(&self, v: IpVersion, args: &[&str]) -> Result<String, FirewallError> {
        let (command, output) = self.output(v, args)?;
        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
        }
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        Err(classify(command, stderr))
    }

    fn with_rule<'a>(head: &[&'a str], rule: &'a [String]) -> Vec<&'a str> {
        head.iter()
            .copied()
            .chain(rule.iter().map(String::as_str))
            .collect()
    }
}

fn classify(command: String, stderr: String) -> FirewallError {
    if stderr.contains("Chain already exists") {
        FirewallError::AlreadyExists(command)
    } else if stderr.contains("No chain/target/match")
        || stderr.contains("does a matching rule exist")
        || stderr.contains("Bad rule")
        || stderr.contains("Index of deletion too big")
    {
        FirewallError::NotFound(command)
    } else {
        FirewallError::Command { command, stderr }
    }
}

/// Targets from `iptables -L <chain> -n --line-numbers`, in rule order.
fn parse_targets(listing: &str) -> Vec<String> {
    listing
        .lines()
        .skip(2)
        .filter_map(|line| {
            let mut cols = line.split_whitespace();
            cols.next()?.parse::<usize>().ok()?;
            Some(cols.next().unwrap_or_default().to_string())
        })
        .collect()
}

impl Firewall for IptablesCommand {
    fn chain_exists(&self, v: IpVersion, table: &str, chain: &str) -> Result<bool, FirewallError> {
        match self.run(v, &["-t", table, "-n", "-L", chain]) {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn new_chain(&self, v: IpVersion, table: &str, chain: &str) -> Result<(), FirewallError> {
        self.run(v, &["-t", table, "-N", chain]).map(drop)
    }

    fn delete_chain(&self, v: IpVersion, table: &str, chain: &str) -> Result<(), FirewallError> {
        self.run(v, &["-t", table, "-F", chain])?;
        self.run(v, &["-t", table, "-X", chain]).map(drop)
    }

    fn exists(
        &self,
        v: IpVersion,
        table: &str,
        chain: &str,
        rule: &[String],
    ) -> Result<bool, FirewallError> {
        match self.run(v, &Self::with_rule(&["-t", table, "-C", chain], rule)) {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            // `-C` exits 1 with no recognisable message when the rule is absent.
            Err(FirewallError::Command { stderr, .. }) if stderr.is_empty() => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn append(
        &self,
        v: IpVersion,
        table: &str,
        chain: &str,
        rule: &[String],
    ) -> Result<(), FirewallError> {
        self.run(v, &Self::with_rule(&["-t", table, "-A", chain], rule))
            .map(drop)
    }

    fn delete(
        &self,
        v: IpVersion,
        table: &str,
        chain: &str,
        rule: &[String],
    ) -> Result<(), FirewallError> {
        self.run(v, &Self::with_rule(&["-t", table, "-D", chain], rule))
            .map(drop)
    }

    fn list_targets(
        &self,
        v: IpVersion,
        table: &str,
        chain: &str,
    ) -> Result<Vec<String>, FirewallError> {
        let listing = self.run(v, &["-t", table, "-n", "--line-numbers", "-L", chain])?;
        Ok(parse_targets(&listing))
    }

    fn delete_at(
        &self,
        v: IpVersion,
        table: &str,
        chain: &str,
        num: usize,
    ) -> Result<(), FirewallError> {
        self.run(v, &["-t", table, "-D", chain, &num.to_string()])
            .map(drop)
    }
}

type ChainKey = (IpVersion, String, String);

/// In-memory [`Firewall`]. Builtin chains exist implicitly.
#[derive(Debug, Clone, Default)]
pub struct MemoryFirewall {
    chains: Arc<Mutex<HashMap<ChainKey, Vec<Vec<String>>>>>,
}

const BUILTIN: &[&str] = &["PREROUTING", "INPUT", "FORWARD", "OUTPUT", "POSTROUTING"];

impl MemoryFirewall {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rules of a chain; empty when the chain does not exist.
    pub fn rules(&self, v: IpVersion, table: &str, chain: &str) -> Vec<Vec<String>> {
        self.lock()
            .get(&key(v, table, chain))
            .cloned()
            .unwrap_or_default()
    }

    /// Names of the user chains that exist in `table`.
    pub fn chains(&self, v: IpVersion, table: &str) -> Vec<String> {
        let mut names: Vec<String> = self
            .lock()
            .keys()
            .filter(|(kv, kt, kc)| *kv == v && kt == table && !BUILTIN.contains(&kc.as_str()))
            .map(|(_, _, c)| c.clone())
            .collect();
        names.sort();
        names
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ChainKey, Vec<Vec<String>>>> {
        self.chains.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn with_chain<T>(
        &self,
        v: IpVersion,
        table: &str,
        chain: &str,
        f: impl FnOnce(&mut Vec<Vec<String>>) -> Result<T, FirewallError>,
    ) -> Result<T, FirewallError> {
        let mut chains = self.lock();
        let k = key(v, table, chain);
        if BUILTIN.contains(&chain) {
            return f(chains.entry(k).or_default());
        }
        match chains.get_mut(&k) {
            Some(rules) => f(rules),
            None => Err(FirewallError::NotFound(format!("chain {} in {}", chain, table))),
        }
    }
}

fn key(v: IpVersion, table: &str, chain: &str) -> ChainKey {
    (v, table.to_string(), chain.to_string())
}

/// Target of a rule: the argument after `-j`.
fn target_of(rule: &[String]) -> String {
    rule.iter()
        .skip_while(|a| a.as_str() != "-j")
        .nth(1)
        .cloned()
        .unwrap_or_default()
}

impl Firewall for MemoryFirewall {
    fn chain_exists(&self, v: IpVersion, table: &str, chain: &str) -> Result<bool, FirewallError> {
        Ok(BUILTIN.contains(&chain) || self.lock().contains_key(&key(v, table, chain)))
    }

    fn new_chain(&self, v: IpVersion, table: &str, chain: &str) -> Result<(), FirewallError> {
        let mut chains = self.lock();
        let k = key(v, table, chain);
        if chains.contains_key(&k) {
            return Err(FirewallError::AlreadyExists(format!("chain {}", chain)));
        }
        chains.insert(k, Vec::new());
        Ok(())
    }

    fn delete_chain(&self, v: IpVersion, table: &str, chain: &str) -> Result<(), FirewallError> {
        let mut chains = self.lock();
        let referenced = chains
            .iter()
            .filter(|((kv, kt, _), _)| *kv == v && kt == table)
            .flat_map(|(_, rules)| rules)
            .any(|r| target_of(r) == chain);
        if referenced {
            return Err(FirewallError::Command {
                command: format!("iptables -t {} -X {}", table, chain),
                stderr: "Too many links".to_string(),
            });
        }
        chains
            .remove(&key(v, table, chain))
            .map(drop)
            .ok_or_else(|| FirewallError::NotFound(format!("chain {}", chain)))
    }

    fn exists(
        &self,
        v: IpVersion,
        table: &str,
        chain: &str,
        rule: &[String],
    ) -> Result<bool, FirewallError> {
        self.with_chain(v, table, chain, |rules| Ok(rules.iter().any(|r| r == rule)))
    }

    fn append(
        &self,
        v: IpVersion,
        table: &str,
        chain: &str,
        rule: &[String],
    ) -> Result<(), FirewallError> {
        self.with_chain(v, table, chain, |rules| {
            rules.push(rule.to_vec());
            Ok(())
        })
    }

    fn delete(
        &self,
        v: IpVersion,
        table: &str,
        chain: &str,
        rule: &[String],
    ) -> Result<(), FirewallError> {
        self.with_chain(v, table, chain, |rules| {
            let pos = rules
                .iter()
                .position(|r| r == rule)
                .ok_or_else(|| FirewallError::NotFound(format!("rule in {}", chain)))?;
            rules.remove(pos);
            Ok(())
        })
    }

    fn list_targets(
        &self,
        v: IpVersion,
        table: &str,
        chain: &str,
    ) -> Result<Vec<String>, FirewallError> {
        self.with_chain(v, table, chain, |rules| {
            Ok(rules.iter().map(|r| target_of(r)).collect())
        })
    }

    fn delete_at(
        &self,
        v: IpVersion,
        table: &str,
        chain: &str,
        num: usize,
    ) -> Result<(), FirewallError> {
        self.with_chain(v, table, chain, |rules| {
            if num == 0 || num > rules.len() {
                return Err(FirewallError::NotFound(format!("rule {} in {}", num, chain)));
            }
            rules.remove(num - 1);
            Ok(())
        })
    }
}
